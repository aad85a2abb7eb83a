//! Identity of the process emitting spans

use serde::Serialize;
use std::collections::BTreeMap;

/// Default service name
pub const DEFAULT_SERVICE_NAME: &str = "peerlink";

/// Service description attached to every exported batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub attributes: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(service_name: impl Into<String>) -> Self {
        Resource {
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for Resource {
    fn default() -> Self {
        Resource::new(DEFAULT_SERVICE_NAME)
    }
}
