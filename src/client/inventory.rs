use etc_os_release::OsRelease;
use serde::Serialize;
use sysinfo::System;

use crate::HAWSER_VERSION;

/// One inventory attribute, as the inventory endpoint expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: String,
}

impl InventoryAttribute {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// Collects the attribute set pushed by the inventory-update state: device
/// identity plus a small machine fingerprint. Discovery beyond this is the
/// server's business.
pub fn gather_attributes(device_type: &str, artifact_name: &str) -> Vec<InventoryAttribute> {
    let mut attributes = vec![
        InventoryAttribute::new("device_type", device_type),
        InventoryAttribute::new("artifact_name", artifact_name),
        InventoryAttribute::new("client_version", HAWSER_VERSION),
    ];

    if let Some(kernel) = System::kernel_version() {
        attributes.push(InventoryAttribute::new("kernel", kernel));
    }
    if let Some(hostname) = System::host_name() {
        attributes.push(InventoryAttribute::new("hostname", hostname));
    }
    if let Ok(os_release) = OsRelease::open() {
        if let Some(os) = os_release.get_value("PRETTY_NAME") {
            attributes.push(InventoryAttribute::new("os", os));
        }
    }

    attributes
}
