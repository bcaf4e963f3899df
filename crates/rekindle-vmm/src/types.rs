//! Request types shared by hypervisor backends.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Machine shape for a new microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub mem_size_mib: u64,
    /// Network namespace the VM's tap device lives in, if any.
    pub netns_path: Option<PathBuf>,
    /// Nameservers pushed to the guest.
    pub nameservers: Vec<String>,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 2048,
            netns_path: None,
            nameservers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
        }
    }
}

/// Lifecycle state of a microVM as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Booted and executing.
    Running,
    /// Paused; the guest is quiescent and its memory is stable.
    Paused,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_machine_spec() {
        let spec = MachineSpec::default();
        assert_eq!(spec.vcpu_count, 2);
        assert_eq!(spec.mem_size_mib, 2048);
        assert!(spec.netns_path.is_none());
    }
}
