//! Shared records exchanged between processes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::Url;

/// Description of a registered service, as stored by the service directory.
///
/// Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Unique service name.
    pub name: String,
    /// Id assigned by the directory, 0 until registered.
    pub service_id: u32,
    /// Machine the service runs on.
    pub machine_id: String,
    /// Process hosting the service.
    pub process_id: u32,
    /// Urls the hosting process listens on.
    pub endpoints: Vec<Url>,
    /// Session that registered the service.
    pub session_id: String,
}

impl ServiceInfo {
    /// Create an unregistered service description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Internal services have names starting with `_`.
    pub fn is_internal(&self) -> bool {
        is_internal_service(&self.name)
    }
}

/// True for names of internal services, which are logged more quietly.
pub fn is_internal_service(name: &str) -> bool {
    name.starts_with('_')
}

/// A value in a [`CapabilityMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityValue {
    /// Feature flag.
    Bool(bool),
    /// Numeric setting.
    Int(i64),
    /// Free-form setting.
    Str(String),
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(v) => write!(f, "{v}"),
            CapabilityValue::Int(v) => write!(f, "{v}"),
            CapabilityValue::Str(v) => f.write_str(v),
        }
    }
}

/// Features advertised by each side of a connection.
pub type CapabilityMap = BTreeMap<String, CapabilityValue>;

/// Capabilities advertised when nothing else is configured.
pub fn default_capabilities() -> CapabilityMap {
    CapabilityMap::from([
        ("ClientServerSocket".to_string(), CapabilityValue::Bool(true)),
        ("MessageFlags".to_string(), CapabilityValue::Bool(true)),
        ("RemoteCancelableCalls".to_string(), CapabilityValue::Bool(false)),
        ("ObjectPtrUID".to_string(), CapabilityValue::Bool(false)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Protocol;

    #[test]
    fn test_service_info_wire_order() {
        let info = ServiceInfo {
            name: "a".to_string(),
            service_id: 2,
            machine_id: "m".to_string(),
            process_id: 7,
            endpoints: vec![Url::new(Protocol::Tcp, "127.0.0.1", 1)],
            session_id: "s".to_string(),
        };
        let buffer = crate::to_buffer(&info).expect("encode");
        let bytes = buffer.as_slice();
        assert_eq!(&bytes[..5], &[1, 0, 0, 0, b'a']);
        assert_eq!(&bytes[5..9], &2u32.to_le_bytes());

        let decoded: ServiceInfo = crate::from_buffer(&buffer).expect("decode");
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_internal_names() {
        assert!(ServiceInfo::new("_hidden").is_internal());
        assert!(!ServiceInfo::new("visible").is_internal());
    }
}
