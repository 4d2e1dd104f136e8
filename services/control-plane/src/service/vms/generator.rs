//! Desired hypervisor objects of a VM.

use std::collections::BTreeMap;

use crate::config::{FabricConfig, ZoneConfig};
use crate::model::vm::Vm;
use crate::subsystems::cs::{PortForwardingRule, VirtualMachine};
use crate::subsystems::SubsystemError;

/// The VM itself and one forwarding rule per port with a public port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsObjects {
    pub vm: VirtualMachine,
    /// Keyed by port name.
    pub rules: BTreeMap<String, PortForwardingRule>,
}

/// Host for a new VM: a stable pick among the zone's usable hosts.
pub fn pick_host(vm: &Vm, zone: &ZoneConfig, config: &FabricConfig) -> Result<String, SubsystemError> {
    let hosts: Vec<&String> = zone
        .vm_hosts
        .iter()
        .filter(|h| !config.is_excluded_host(h))
        .collect();
    if hosts.is_empty() {
        return Err(SubsystemError::HostNotAvailable(format!(
            "zone {} has no usable hosts",
            zone.name
        )));
    }
    let bytes = vm.id.uuid().as_u128();
    let index = (bytes % hosts.len() as u128) as usize;
    Ok(hosts[index].clone())
}

/// Hypervisor name of the VM. Stable across renames.
pub fn machine_name(vm: &Vm) -> String {
    vm.id.to_string()
}

/// Hypervisor objects for `vm` placed on `host`.
pub fn cs(vm: &Vm, host: &str) -> CsObjects {
    let machine_name = machine_name(vm);
    let machine = VirtualMachine {
        name: machine_name.clone(),
        host: host.to_string(),
        cpu_cores: vm.specs.cpu_cores,
        ram: vm.specs.ram,
        disk_size: vm.specs.disk_size,
        ssh_public_key: vm.ssh_public_key.clone(),
        gpu: vm.gpu.as_ref().map(|g| g.gpu_group.clone()),
        id: None,
        power_state: None,
        created_at: None,
    };

    let rules = vm
        .ports
        .iter()
        .filter_map(|port| {
            let public_port = port.public_port?;
            Some((
                port.name.clone(),
                PortForwardingRule {
                    name: port.name.clone(),
                    vm_name: machine_name.clone(),
                    public_port,
                    private_port: port.port,
                    protocol: port.protocol.clone(),
                    id: None,
                    created_at: None,
                },
            ))
        })
        .collect();

    CsObjects { vm: machine, rules }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::vm::{AttachedGpu, PortSpec};
    use crate::service::vms::testing::vm;
    use fabric_id::GpuLeaseId;

    #[test]
    fn test_host_pick_is_stable() {
        let config = FabricConfig::default();
        let zone = config.default_zone();
        let vm = vm("alice", "box");
        let first = pick_host(&vm, zone, &config).unwrap();
        assert_eq!(pick_host(&vm, zone, &config).unwrap(), first);
        assert!(zone.vm_hosts.contains(&first));
    }

    #[test]
    fn test_excluded_hosts_are_skipped() {
        let mut config = FabricConfig::default();
        config.excluded_hosts = config.zones[0].vm_hosts.clone();
        let err = pick_host(&vm("alice", "box"), &config.zones[0], &config).unwrap_err();
        assert!(matches!(err, SubsystemError::HostNotAvailable(_)));
    }

    #[test]
    fn test_rules_only_for_assigned_ports() {
        let mut vm = vm("alice", "box");
        vm.ports = vec![
            PortSpec {
                name: "ssh".into(),
                port: 22,
                protocol: "tcp".into(),
                public_port: Some(30005),
            },
            PortSpec {
                name: "web".into(),
                port: 80,
                protocol: "tcp".into(),
                public_port: None,
            },
        ];
        vm.gpu = Some(AttachedGpu {
            lease_id: GpuLeaseId::new(),
            gpu_group: "nvidia-a100".into(),
        });

        let objects = cs(&vm, "host-1");
        assert_eq!(objects.vm.name, vm.id.to_string());
        assert_eq!(objects.vm.gpu.as_deref(), Some("nvidia-a100"));
        assert_eq!(objects.rules.len(), 1);
        let ssh = &objects.rules["ssh"];
        assert_eq!(ssh.vm_name, objects.vm.name);
        assert_eq!((ssh.public_port, ssh.private_port), (30005, 22));
    }
}
