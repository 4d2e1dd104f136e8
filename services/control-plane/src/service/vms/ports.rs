//! Public port leases in the `vmPorts` collection.
//!
//! A lease is a document keyed `<zone>-<port>`; inserting it is the
//! allocation, so two VMs racing for a port cannot both win.

use chrono::Utc;
use fabric_id::{ResourceId, UserId};
use tracing::debug;

use crate::config::ZoneConfig;
use crate::db::{Filter, Patch};
use crate::model::worker::VmPort;
use crate::service::{Core, ServiceError};
use crate::subsystems::SubsystemError;

/// Lease a free public port for `port_name` of the VM. A lease the VM already
/// holds for that port name is returned again.
pub async fn allocate(
    core: &Core,
    zone: &ZoneConfig,
    vm_id: ResourceId,
    user_id: &UserId,
    port_name: &str,
) -> Result<u16, ServiceError> {
    let repo = core.repo::<VmPort>();
    let held = repo
        .first(
            Filter::new()
                .with_eq("vmId", vm_id.to_string())
                .with_eq("portName", port_name),
        )
        .await?;
    if let Some(lease) = held {
        return Ok(lease.public_port);
    }

    for port in zone.port_range.start..zone.port_range.end {
        let lease = VmPort {
            id: VmPort::key(&zone.name, port),
            zone: zone.name.clone(),
            public_port: port,
            vm_id,
            user_id: user_id.clone(),
            port_name: port_name.to_string(),
            created_at: Utc::now(),
        };
        match repo.insert(&lease).await {
            Ok(()) => {
                debug!(vm_id = %vm_id, port, port_name, "Public port leased");
                return Ok(port);
            }
            Err(err) if err.is_non_unique() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(SubsystemError::NoPortsAvailable(zone.name.clone()).into())
}

/// Release the lease of `port_name`, if any.
pub async fn release(core: &Core, vm_id: ResourceId, port_name: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<VmPort>();
    let leases = repo
        .find(
            &Filter::new()
                .with_eq("vmId", vm_id.to_string())
                .with_eq("portName", port_name),
        )
        .await?;
    for lease in leases {
        repo.remove(&lease.id).await?;
    }
    Ok(())
}

/// Release every lease of the VM.
pub async fn release_all(core: &Core, vm_id: ResourceId) -> Result<(), ServiceError> {
    let repo = core.repo::<VmPort>();
    for lease in repo.find(&Filter::new().with_eq("vmId", vm_id.to_string())).await? {
        repo.remove(&lease.id).await?;
    }
    Ok(())
}

/// Move the VM's leases to a new owner.
pub async fn reassign(core: &Core, vm_id: ResourceId, user_id: &UserId) -> Result<(), ServiceError> {
    let repo = core.repo::<VmPort>();
    for lease in repo.find(&Filter::new().with_eq("vmId", vm_id.to_string())).await? {
        repo.update(&lease.id, &Patch::new().set("userId", user_id.as_str()))
            .await?;
    }
    Ok(())
}
