//! Process-scoped identity and counters.
//!
//! A [`ProcessContext`] is created once per process (or per test) and shared
//! by the session, the object server and the service directory. It replaces
//! process-wide globals: the machine id, the process id and the counter used
//! to mint object ids for objects handed out over the network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Object id of the main object of a service.
pub const MAIN_OBJECT_ID: u32 = 1;

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Identity of the current process plus its id counters.
#[derive(Debug)]
pub struct ProcessContext {
    machine_id: String,
    process_id: u32,
    next_object_id: AtomicU32,
}

impl ProcessContext {
    /// Create a context for this process.
    ///
    /// The machine id is read from the system when available, otherwise a
    /// random one is generated.
    pub fn new() -> Arc<Self> {
        Self::with_machine_id(detect_machine_id())
    }

    /// Create a context with an explicit machine id.
    pub fn with_machine_id(machine_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            machine_id: machine_id.into(),
            process_id: std::process::id(),
            next_object_id: AtomicU32::new(MAIN_OBJECT_ID + 1),
        })
    }

    /// Identifier of the machine this process runs on.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Operating system process id.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Mint a fresh object id, never [`MAIN_OBJECT_ID`].
    pub fn next_object_id(&self) -> u32 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh session identifier.
    pub fn new_session_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

fn detect_machine_id() -> String {
    for path in MACHINE_ID_FILES {
        if let Ok(content) = std::fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    let generated = uuid::Uuid::new_v4().to_string();
    tracing::debug!("ProcessContext: no system machine id, using {}", generated);
    generated
}
