//! The service directory: name registry of every service on the bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use qimessaging_core::is_internal_service;
use qimessaging_transport::message::service;
use qimessaging_transport::{
    Buffer, MessageSocket, ProcessContext, ServiceInfo, SharedSocket, SocketId,
};

use crate::error::{DirectoryError, RpcError};
use crate::object::{
    CallContext, MetaObject, ServiceObject, SignalHub, decode_args, encode_reply,
};

/// Name the directory registers itself under.
pub const SERVICE_DIRECTORY_NAME: &str = "ServiceDirectory";

/// Action ids of the directory's methods and signals.
pub mod method {
    /// `service(name) -> ServiceInfo`
    pub const SERVICE: u32 = 100;
    /// `services() -> [ServiceInfo]`
    pub const SERVICES: u32 = 101;
    /// `registerService(ServiceInfo) -> id`
    pub const REGISTER_SERVICE: u32 = 102;
    /// `unregisterService(id)`
    pub const UNREGISTER_SERVICE: u32 = 103;
    /// `serviceReady(id)`
    pub const SERVICE_READY: u32 = 104;
    /// `updateServiceInfo(ServiceInfo)`
    pub const UPDATE_SERVICE_INFO: u32 = 105;
    /// Signal `serviceAdded(id, name)`
    pub const SERVICE_ADDED: u32 = 106;
    /// Signal `serviceRemoved(id, name)`
    pub const SERVICE_REMOVED: u32 = 107;
    /// `machineId() -> string`
    pub const MACHINE_ID: u32 = 108;
}

#[derive(Default)]
struct DirectoryState {
    last_service_id: u32,
    pending: BTreeMap<u32, ServiceInfo>,
    connected: BTreeMap<u32, ServiceInfo>,
    name_to_id: HashMap<String, u32>,
    socket_to_ids: HashMap<SocketId, Vec<u32>>,
    id_to_socket: HashMap<u32, SharedSocket>,
}

fn announce(name: &str, message: std::fmt::Arguments<'_>) {
    if is_internal_service(name) {
        tracing::debug!("{}", message);
    } else {
        tracing::info!("{}", message);
    }
}

/// Registry mapping service names to ids and endpoints.
///
/// # Service lifecycle
///
/// ```text
///   registerService        serviceReady          unregisterService
/// ─────────────────▶ pending ─────────────▶ ready ─────────────────▶ gone
///                      │                                  ▲
///                      └──────────── unregisterService ───┘
/// ```
///
/// Ids are assigned sequentially and never reused. The directory itself is
/// service 1, ready from the start. Only ready services are returned by
/// [`service`](Self::service) and [`services`](Self::services).
///
/// # Cleanup
///
/// Each registration remembers the socket it came from. When that socket
/// goes away every service it registered is unregistered, each emitting
/// `serviceRemoved`.
///
/// # Locking
///
/// One mutex guards all maps. Signals are emitted after the lock is
/// released, so subscribers may call back into the directory.
pub struct ServiceDirectory {
    state: Mutex<DirectoryState>,
    hub: SignalHub,
    context: Arc<ProcessContext>,
}

impl ServiceDirectory {
    /// Create a directory registered as service 1.
    pub fn new(context: Arc<ProcessContext>) -> Arc<Self> {
        let directory = Arc::new(Self {
            state: Mutex::new(DirectoryState::default()),
            hub: SignalHub::new(),
            context: context.clone(),
        });
        let info = ServiceInfo {
            name: SERVICE_DIRECTORY_NAME.to_string(),
            machine_id: context.machine_id().to_string(),
            process_id: context.process_id(),
            session_id: context.new_session_id(),
            ..ServiceInfo::default()
        };
        // Both steps succeed on an empty registry.
        let registered = directory
            .register_service(info, None)
            .and_then(|id| directory.service_ready(id).map(|()| id));
        debug_assert_eq!(registered, Ok(service::SERVICE_DIRECTORY));
        directory
    }

    /// Signals `serviceAdded` and `serviceRemoved`.
    pub fn hub(&self) -> &SignalHub {
        &self.hub
    }

    /// Record a new service as pending and return its id.
    ///
    /// `socket` is the connection the request came from, `None` for
    /// in-process registrations.
    pub fn register_service(
        &self,
        mut info: ServiceInfo,
        socket: Option<&SharedSocket>,
    ) -> Result<u32, DirectoryError> {
        let mut state = self.state.lock();
        if let Some(&service_id) = state.name_to_id.get(&info.name) {
            tracing::warn!(
                "ServiceDirectory::register_service \"{}\" already registered as #{}",
                info.name,
                service_id
            );
            return Err(DirectoryError::AlreadyRegistered {
                name: info.name,
                service_id,
            });
        }

        state.last_service_id += 1;
        let service_id = state.last_service_id;
        info.service_id = service_id;
        state.name_to_id.insert(info.name.clone(), service_id);
        if let Some(socket) = socket {
            state
                .socket_to_ids
                .entry(socket.id())
                .or_default()
                .push(service_id);
            state.id_to_socket.insert(service_id, socket.clone());
        }
        announce(
            &info.name,
            format_args!(
                "Registered Service \"{}\" (#{}) from {:?}",
                info.name,
                service_id,
                info.endpoints.iter().map(ToString::to_string).collect::<Vec<_>>()
            ),
        );
        state.pending.insert(service_id, info);
        Ok(service_id)
    }

    /// Promote a pending service to ready and emit `serviceAdded`.
    pub fn service_ready(&self, service_id: u32) -> Result<(), DirectoryError> {
        let name = {
            let mut state = self.state.lock();
            let info = state
                .pending
                .remove(&service_id)
                .ok_or(DirectoryError::NotPending(service_id))?;
            let name = info.name.clone();
            state.connected.insert(service_id, info);
            name
        };
        announce(
            &name,
            format_args!("Service \"{}\" (#{}) is ready", name, service_id),
        );
        self.emit(method::SERVICE_ADDED, service_id, &name);
        Ok(())
    }

    /// Forget a pending or ready service and emit `serviceRemoved`.
    pub fn unregister_service(&self, service_id: u32) -> Result<(), DirectoryError> {
        let name = {
            let mut state = self.state.lock();
            let info = match state.connected.remove(&service_id) {
                Some(info) => info,
                None => state
                    .pending
                    .remove(&service_id)
                    .ok_or(DirectoryError::CannotUnregister(service_id))?,
            };
            state.name_to_id.remove(&info.name);
            if let Some(socket) = state.id_to_socket.remove(&service_id) {
                let now_empty = match state.socket_to_ids.get_mut(&socket.id()) {
                    Some(ids) => {
                        ids.retain(|id| *id != service_id);
                        ids.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    state.socket_to_ids.remove(&socket.id());
                }
            }
            info.name
        };
        announce(
            &name,
            format_args!("Unregistered Service \"{}\" (#{})", name, service_id),
        );
        self.emit(method::SERVICE_REMOVED, service_id, &name);
        Ok(())
    }

    /// Replace the stored description of a service.
    ///
    /// Ready services registered by the same session get the new endpoints
    /// too. The name cannot change.
    pub fn update_service_info(&self, info: ServiceInfo) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        let service_id = info.service_id;
        let current = state
            .connected
            .get(&service_id)
            .or_else(|| state.pending.get(&service_id))
            .ok_or(DirectoryError::CannotUpdate(service_id))?;
        // The name is the key of the name index.
        if current.name != info.name {
            return Err(DirectoryError::Renamed {
                service_id,
                name: current.name.clone(),
                requested: info.name,
            });
        }

        for (id, other) in state.connected.iter_mut() {
            if *id != service_id && other.session_id == info.session_id {
                other.endpoints = info.endpoints.clone();
            }
        }
        tracing::debug!(
            "ServiceDirectory::update_service_info \"{}\" (#{})",
            info.name,
            service_id
        );
        if let Some(slot) = state.connected.get_mut(&service_id) {
            *slot = info;
        } else if let Some(slot) = state.pending.get_mut(&service_id) {
            *slot = info;
        }
        Ok(())
    }

    /// Description of the ready service called `name`.
    pub fn service(&self, name: &str) -> Result<ServiceInfo, DirectoryError> {
        let state = self.state.lock();
        let service_id = state
            .name_to_id
            .get(name)
            .ok_or_else(|| DirectoryError::UnknownService(name.to_string()))?;
        state
            .connected
            .get(service_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotReady(name.to_string()))
    }

    /// Every ready service, by id.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state.lock().connected.values().cloned().collect()
    }

    /// Machine the directory runs on.
    pub fn machine_id(&self) -> String {
        self.context.machine_id().to_string()
    }

    /// Socket a service was registered from.
    pub fn socket_of_service(&self, service_id: u32) -> Option<SharedSocket> {
        self.state.lock().id_to_socket.get(&service_id).cloned()
    }

    /// Unregister every service registered through `socket`.
    pub fn remove_client_socket(&self, socket: SocketId) {
        let ids = self
            .state
            .lock()
            .socket_to_ids
            .remove(&socket)
            .unwrap_or_default();
        for service_id in ids {
            tracing::debug!(
                "ServiceDirectory::remove_client_socket {} unregisters #{}",
                socket,
                service_id
            );
            if let Err(error) = self.unregister_service(service_id) {
                tracing::warn!(
                    "ServiceDirectory::remove_client_socket {}: {}",
                    socket,
                    error
                );
            }
        }
    }

    fn emit(&self, event: u32, service_id: u32, name: &str) {
        if let Err(error) = self.hub.emit(event, &(service_id, name)) {
            tracing::error!("ServiceDirectory::emit event {}: {}", event, error);
        }
    }
}

#[async_trait]
impl ServiceObject for ServiceDirectory {
    fn meta_object(&self) -> MetaObject {
        MetaObject::new()
            .with_method(method::SERVICE, "service", "(s)", "(sIsI[s]s)")
            .with_method(method::SERVICES, "services", "()", "[(sIsI[s]s)]")
            .with_method(method::REGISTER_SERVICE, "registerService", "((sIsI[s]s))", "I")
            .with_method(method::UNREGISTER_SERVICE, "unregisterService", "(I)", "v")
            .with_method(method::SERVICE_READY, "serviceReady", "(I)", "v")
            .with_method(method::UPDATE_SERVICE_INFO, "updateServiceInfo", "((sIsI[s]s))", "v")
            .with_signal(method::SERVICE_ADDED, "serviceAdded", "(Is)")
            .with_signal(method::SERVICE_REMOVED, "serviceRemoved", "(Is)")
            .with_method(method::MACHINE_ID, "machineId", "()", "s")
            .with_description("Registry of the services on the bus")
    }

    async fn call(&self, ctx: &CallContext, action: u32, args: Buffer) -> Result<Buffer, RpcError> {
        match action {
            method::SERVICE => {
                let name: String = decode_args(&args)?;
                encode_reply(&self.service(&name)?)
            }
            method::SERVICES => encode_reply(&self.services()),
            method::REGISTER_SERVICE => {
                let info: ServiceInfo = decode_args(&args)?;
                encode_reply(&self.register_service(info, ctx.socket())?)
            }
            method::UNREGISTER_SERVICE => {
                let service_id: u32 = decode_args(&args)?;
                self.unregister_service(service_id)?;
                encode_reply(&())
            }
            method::SERVICE_READY => {
                let service_id: u32 = decode_args(&args)?;
                self.service_ready(service_id)?;
                encode_reply(&())
            }
            method::UPDATE_SERVICE_INFO => {
                let info: ServiceInfo = decode_args(&args)?;
                self.update_service_info(info)?;
                encode_reply(&())
            }
            method::MACHINE_ID => encode_reply(&self.machine_id()),
            other => Err(RpcError::NoSuchMethod(format!(
                "{}.1.{}",
                ctx.service_id(),
                other
            ))),
        }
    }

    fn signal_hub(&self) -> Option<&SignalHub> {
        Some(&self.hub)
    }

    fn socket_unbound(&self, socket: &SharedSocket) {
        self.remove_client_socket(socket.id());
    }
}

impl std::fmt::Debug for ServiceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServiceDirectory")
            .field("pending", &state.pending.len())
            .field("connected", &state.connected.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qimessaging_core::from_buffer;
    use qimessaging_transport::Url;

    fn directory() -> Arc<ServiceDirectory> {
        ServiceDirectory::new(ProcessContext::with_machine_id("machine-a"))
    }

    fn info(name: &str, session: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            machine_id: "machine-a".to_string(),
            session_id: session.to_string(),
            endpoints: vec![Url::parse("tcp://127.0.0.1:9600").expect("url")],
            ..ServiceInfo::default()
        }
    }

    #[test]
    fn test_directory_registers_itself() {
        let directory = directory();
        let own = directory.service(SERVICE_DIRECTORY_NAME).expect("self");
        assert_eq!(own.service_id, service::SERVICE_DIRECTORY);
        assert_eq!(directory.services().len(), 1);
        assert_eq!(directory.machine_id(), "machine-a");
    }

    #[test]
    fn test_echo_lifecycle() {
        let directory = directory();
        let (_, mut added) = directory.hub().connect_local(method::SERVICE_ADDED);
        let (_, mut removed) = directory.hub().connect_local(method::SERVICE_REMOVED);

        let id = directory.register_service(info("echo", "s1"), None).expect("register");
        assert_eq!(id, 2);
        assert_eq!(
            directory.service("echo").err().map(|e| e.to_string()),
            Some("Cannot find ServiceInfo for service 'echo'".to_string())
        );
        assert_eq!(directory.services().len(), 1);

        directory.service_ready(id).expect("ready");
        let event: (u32, String) = from_buffer(&added.try_recv().expect("added")).expect("decode");
        assert_eq!(event, (2, "echo".to_string()));
        assert_eq!(directory.service("echo").expect("ready").service_id, 2);
        assert_eq!(directory.services().len(), 2);

        directory.unregister_service(id).expect("unregister");
        let event: (u32, String) =
            from_buffer(&removed.try_recv().expect("removed")).expect("decode");
        assert_eq!(event, (2, "echo".to_string()));
        assert_eq!(
            directory.service("echo").err(),
            Some(DirectoryError::UnknownService("echo".to_string()))
        );

        // Ids are never reused.
        assert_eq!(directory.register_service(info("echo", "s1"), None), Ok(3));
    }

    #[test]
    fn test_conflicting_registration_is_rejected() {
        let directory = directory();
        directory.register_service(info("echo", "s1"), None).expect("register");
        let error = directory
            .register_service(info("echo", "s2"), None)
            .err()
            .expect("conflict");
        assert_eq!(
            error.to_string(),
            "Service \"echo\" (#2) is already registered. Rejecting conflicting registration attempt."
        );
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let directory = directory();
        assert_eq!(
            directory.unregister_service(42).err().map(|e| e.to_string()),
            Some("Unregister Service: Can't find service #42".to_string())
        );
        assert_eq!(
            directory.service_ready(42).err().map(|e| e.to_string()),
            Some("Can't find pending service #42".to_string())
        );
        assert_eq!(
            directory.update_service_info(info("ghost", "s1")).err(),
            Some(DirectoryError::CannotUpdate(0))
        );

        // Ready twice: no longer pending.
        let id = directory.register_service(info("echo", "s1"), None).expect("register");
        directory.service_ready(id).expect("ready");
        assert_eq!(directory.service_ready(id), Err(DirectoryError::NotPending(id)));
    }

    #[test]
    fn test_update_refreshes_services_of_the_same_session() {
        let directory = directory();
        let first = directory.register_service(info("first", "s1"), None).expect("register");
        let second = directory.register_service(info("second", "s1"), None).expect("register");
        let other = directory.register_service(info("other", "s2"), None).expect("register");
        for id in [first, second, other] {
            directory.service_ready(id).expect("ready");
        }

        let moved = vec![Url::parse("tcp://10.0.0.5:9700").expect("url")];
        let mut updated = directory.service("first").expect("first");
        updated.endpoints = moved.clone();
        directory.update_service_info(updated).expect("update");

        assert_eq!(directory.service("first").expect("first").endpoints, moved);
        assert_eq!(directory.service("second").expect("second").endpoints, moved);
        assert_ne!(directory.service("other").expect("other").endpoints, moved);
    }

    #[test]
    fn test_update_cannot_rename_a_service() {
        let directory = directory();
        let id = directory.register_service(info("echo", "s1"), None).expect("register");
        directory.service_ready(id).expect("ready");

        let mut renamed = directory.service("echo").expect("echo");
        renamed.name = "other".to_string();
        assert_eq!(
            directory.update_service_info(renamed).err().map(|e| e.to_string()),
            Some(
                "updateServiceInfo: service #2 is \"echo\", refusing to rename it to \"other\""
                    .to_string()
            )
        );
        assert_eq!(directory.service("echo").expect("echo").service_id, id);
        assert_eq!(
            directory.service("other").err(),
            Some(DirectoryError::UnknownService("other".to_string()))
        );
    }

    #[test]
    fn test_locally_registered_services_have_no_socket() {
        let directory = directory();
        let id = directory.register_service(info("echo", "s1"), None).expect("register");
        assert!(directory.socket_of_service(id).is_none());
        // Unknown sockets are ignored.
        directory.remove_client_socket(SocketId::next());
        assert!(directory.socket_of_service(id).is_none());
        assert_eq!(directory.unregister_service(id), Ok(()));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        #[derive(Debug, Clone)]
        enum Op {
            Register(usize),
            Ready(usize),
            Unregister(usize),
            Update(usize, usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..4usize).prop_map(Op::Register),
                (0..4usize).prop_map(Op::Ready),
                (0..4usize).prop_map(Op::Unregister),
                (0..4usize, 0..4usize).prop_map(|(i, j)| Op::Update(i, j)),
            ]
        }

        proptest! {
            #[test]
            fn test_names_and_ids_stay_a_bijection(ops in proptest::collection::vec(op(), 0..40)) {
                let directory = directory();
                let names = ["a", "b", "c", "d"];
                let mut ids: HashMap<&str, u32> = HashMap::new();
                let mut ready: BTreeSet<&str> = BTreeSet::new();

                for op in ops {
                    match op {
                        Op::Register(i) => {
                            let result = directory.register_service(info(names[i], "s"), None);
                            prop_assert_eq!(result.is_ok(), !ids.contains_key(names[i]));
                            if let Ok(id) = result {
                                ids.insert(names[i], id);
                            }
                        }
                        Op::Ready(i) => {
                            let pending = ids.contains_key(names[i]) && !ready.contains(names[i]);
                            let id = ids.get(names[i]).copied().unwrap_or(9999);
                            prop_assert_eq!(directory.service_ready(id).is_ok(), pending);
                            if pending {
                                ready.insert(names[i]);
                            }
                        }
                        Op::Unregister(i) => {
                            let id = ids.get(names[i]).copied().unwrap_or(9999);
                            prop_assert_eq!(directory.unregister_service(id).is_ok(), ids.contains_key(names[i]));
                            ids.remove(names[i]);
                            ready.remove(names[i]);
                        }
                        Op::Update(i, j) => {
                            let id = ids.get(names[i]).copied().unwrap_or(9999);
                            let mut update = info(names[j], "s");
                            update.service_id = id;
                            let accepted = ids.contains_key(names[i]) && i == j;
                            prop_assert_eq!(directory.update_service_info(update).is_ok(), accepted);
                        }
                    }

                    let listed: BTreeSet<String> = directory
                        .services()
                        .into_iter()
                        .map(|info| info.name)
                        .filter(|name| name != SERVICE_DIRECTORY_NAME)
                        .collect();
                    let expected: BTreeSet<String> = ready.iter().map(|name| name.to_string()).collect();
                    prop_assert_eq!(listed, expected);
                    for (name, id) in &ids {
                        match directory.service(name) {
                            Ok(found) => prop_assert_eq!(found.service_id, *id),
                            Err(error) => prop_assert_eq!(error, DirectoryError::NotReady(name.to_string())),
                        }
                    }
                }
            }
        }
    }
}
