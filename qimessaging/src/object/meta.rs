//! Method and signal tables describing an object.

use std::collections::BTreeMap;

use qimessaging_transport::message::action;
use serde::{Deserialize, Serialize};

/// A callable method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaMethod {
    /// Action id used on the wire.
    pub uid: u32,
    /// Method name.
    pub name: String,
    /// Signature of the argument tuple, e.g. `(s)`.
    pub parameters_signature: String,
    /// Signature of the return value.
    pub return_signature: String,
    /// Free-form documentation.
    pub description: String,
}

/// A signal that subscribers can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaSignal {
    /// Event id used on the wire.
    pub uid: u32,
    /// Signal name.
    pub name: String,
    /// Signature of the emitted tuple.
    pub signature: String,
}

/// Method and signal table of an object, fetched by proxies with the
/// `MetaObject` control action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaObject {
    /// Methods by action id.
    pub methods: BTreeMap<u32, MetaMethod>,
    /// Signals by event id.
    pub signals: BTreeMap<u32, MetaSignal>,
    /// Free-form documentation.
    pub description: String,
}

impl MetaObject {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method.
    pub fn with_method(
        mut self,
        uid: u32,
        name: &str,
        parameters_signature: &str,
        return_signature: &str,
    ) -> Self {
        self.methods.insert(
            uid,
            MetaMethod {
                uid,
                name: name.to_string(),
                parameters_signature: parameters_signature.to_string(),
                return_signature: return_signature.to_string(),
                description: String::new(),
            },
        );
        self
    }

    /// Add a signal.
    pub fn with_signal(mut self, uid: u32, name: &str, signature: &str) -> Self {
        self.signals.insert(
            uid,
            MetaSignal {
                uid,
                name: name.to_string(),
                signature: signature.to_string(),
            },
        );
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Method with action id `uid`.
    pub fn method(&self, uid: u32) -> Option<&MetaMethod> {
        self.methods.get(&uid)
    }

    /// Action id of the first method called `name`.
    pub fn method_id(&self, name: &str) -> Option<u32> {
        self.methods
            .values()
            .find(|method| method.name == name)
            .map(|method| method.uid)
    }

    /// Signal with event id `uid`.
    pub fn signal(&self, uid: u32) -> Option<&MetaSignal> {
        self.signals.get(&uid)
    }

    /// Event id of the signal called `name`.
    pub fn signal_id(&self, name: &str) -> Option<u32> {
        self.signals
            .values()
            .find(|signal| signal.name == name)
            .map(|signal| signal.uid)
    }

    /// The table extended with the control methods every bound object answers.
    pub fn with_control_methods(mut self) -> Self {
        let control = [
            (action::REGISTER_EVENT, "registerEvent", "(IIL)", "L"),
            (action::UNREGISTER_EVENT, "unregisterEvent", "(IIL)", "v"),
            (action::META_OBJECT, "metaObject", "(I)", "m"),
            (action::TERMINATE, "terminate", "(I)", "v"),
            (action::GET_PROPERTY, "property", "(m)", "m"),
            (action::SET_PROPERTY, "setProperty", "(mm)", "v"),
            (action::PROPERTIES, "properties", "()", "[s]"),
            (
                action::REGISTER_EVENT_WITH_SIGNATURE,
                "registerEventWithSignature",
                "(IILs)",
                "L",
            ),
        ];
        for (uid, name, parameters, returns) in control {
            self = self.with_method(uid, name, parameters, returns);
        }
        self
    }
}
