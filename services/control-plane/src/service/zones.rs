//! Zones as configured.

use serde::Serialize;

use super::{Core, ServiceError};
use crate::config::{PortRange, ZoneConfig};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneView {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub deployment_domain: String,
    pub storage_domain: String,
    pub port_range: PortRange,
}

impl From<&ZoneConfig> for ZoneView {
    fn from(zone: &ZoneConfig) -> Self {
        Self {
            name: zone.name.clone(),
            description: zone.description.clone(),
            capabilities: zone.capabilities.clone(),
            deployment_domain: zone.deployment_domain.clone(),
            storage_domain: zone.storage_domain.clone(),
            port_range: zone.port_range,
        }
    }
}

pub fn list(core: &Core, capability: Option<&str>) -> Vec<ZoneView> {
    core.config
        .zones
        .iter()
        .filter(|zone| capability.is_none_or(|c| zone.has_capability(c)))
        .map(ZoneView::from)
        .collect()
}

pub fn get(core: &Core, name: &str) -> Result<ZoneView, ServiceError> {
    core.zone(Some(name)).map(ZoneView::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing;

    #[test]
    fn test_list_and_get() {
        let t = testing::core();
        assert_eq!(list(&t.core, None).len(), 1);
        assert_eq!(list(&t.core, Some("vm")).len(), 1);
        assert!(list(&t.core, Some("quantum")).is_empty());
        assert_eq!(get(&t.core, "dev").unwrap().deployment_domain, "app.fabric.local");
        assert!(get(&t.core, "mars").unwrap_err().is_not_found());
    }
}
