//! The hypervisor trait and the simulated backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, VmmError};
use crate::types::{MachineSpec, VmState};

/// Control-plane operations the coordinator needs from a hypervisor.
#[async_trait]
pub trait Vmm: Send + Sync + 'static {
    /// Boots a fresh microVM.
    async fn create_vm(&self, vm_id: &str, spec: &MachineSpec) -> Result<()>;

    /// Boots a microVM from an existing snapshot's memory and device files.
    async fn create_vm_from_snapshot(
        &self,
        vm_id: &str,
        spec: &MachineSpec,
        mem_path: &Path,
        snap_path: &Path,
    ) -> Result<()>;

    /// Pauses the VM. On return the guest is quiescent.
    async fn pause_vm(&self, vm_id: &str) -> Result<()>;

    /// Resumes a paused VM. On return the VM is runnable again.
    async fn resume_vm(&self, vm_id: &str) -> Result<()>;

    /// Stops and removes the VM.
    async fn stop_vm(&self, vm_id: &str) -> Result<()>;

    /// Writes the paused VM's memory image and device state to host files.
    /// On return both files are closed and consistent.
    async fn create_snapshot(&self, vm_id: &str, mem_path: &Path, snap_path: &Path) -> Result<()>;

    /// Injects an opaque metadata blob into the VM (e.g. registry
    /// credentials consumed by the in-guest agent).
    async fn set_vm_metadata(&self, vm_id: &str, metadata: &str) -> Result<()>;
}

#[derive(Debug)]
struct SimVm {
    state: VmState,
    metadata: Option<String>,
}

/// Simulated hypervisor backend.
///
/// Enforces the same per-VM state machine as a real control plane and
/// fabricates a deterministic guest memory image on snapshot, so the
/// chunk/upload/download pipeline runs end-to-end in development and tests.
pub struct SimVmm {
    vms: RwLock<HashMap<String, SimVm>>,
    /// Size of the synthetic memory image written by `create_snapshot`.
    mem_bytes: usize,
}

/// Synthetic memory image size. Big enough to span several chunks at the
/// default chunk size without slowing tests down.
const DEFAULT_SIM_MEM_BYTES: usize = 4 * 1024 * 1024;

impl SimVmm {
    /// Creates a simulated hypervisor with the default memory image size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory_size(DEFAULT_SIM_MEM_BYTES)
    }

    /// Creates a simulated hypervisor whose snapshots carry `mem_bytes` of
    /// guest memory.
    #[must_use]
    pub fn with_memory_size(mem_bytes: usize) -> Self {
        Self {
            vms: RwLock::new(HashMap::new()),
            mem_bytes,
        }
    }

    /// Current state of a VM, if it exists.
    #[must_use]
    pub fn state(&self, vm_id: &str) -> Option<VmState> {
        self.vms.read().ok()?.get(vm_id).map(|vm| vm.state)
    }

    /// Number of live VMs.
    #[must_use]
    pub fn vm_count(&self) -> usize {
        self.vms.read().map(|m| m.len()).unwrap_or(0)
    }

    fn insert_running(&self, vm_id: &str) -> Result<()> {
        let mut vms = self
            .vms
            .write()
            .map_err(|_| VmmError::api("lock poisoned"))?;
        if vms.contains_key(vm_id) {
            return Err(VmmError::AlreadyExists(vm_id.to_string()));
        }
        vms.insert(
            vm_id.to_string(),
            SimVm {
                state: VmState::Running,
                metadata: None,
            },
        );
        Ok(())
    }

    fn transition(&self, vm_id: &str, from: VmState, to: VmState) -> Result<()> {
        let mut vms = self
            .vms
            .write()
            .map_err(|_| VmmError::api("lock poisoned"))?;
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| VmmError::UnknownVm(vm_id.to_string()))?;
        if vm.state != from {
            return Err(VmmError::InvalidState(format!(
                "VM {vm_id} is {:?}, expected {from:?}",
                vm.state
            )));
        }
        vm.state = to;
        Ok(())
    }

    /// Deterministic guest memory image for a VM.
    ///
    /// Interleaves patterned pages with zero pages so sparsification and
    /// dedup have something realistic to chew on. The same vm id always
    /// produces the same bytes.
    fn synthesize_memory(&self, vm_id: &str) -> Vec<u8> {
        let seed = vm_id
            .bytes()
            .fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
        let mut image = vec![0u8; self.mem_bytes];
        for (page_no, page) in image.chunks_mut(4096).enumerate() {
            // Every third page stays zero.
            if page_no % 3 == 2 {
                continue;
            }
            for (i, byte) in page.iter_mut().enumerate() {
                *byte = seed.wrapping_add((page_no as u8).wrapping_mul(7)).wrapping_add(i as u8);
            }
        }
        image
    }
}

impl Default for SimVmm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Vmm for SimVmm {
    async fn create_vm(&self, vm_id: &str, _spec: &MachineSpec) -> Result<()> {
        self.insert_running(vm_id)?;
        debug!(vm_id, "simulated VM booted");
        Ok(())
    }

    async fn create_vm_from_snapshot(
        &self,
        vm_id: &str,
        _spec: &MachineSpec,
        mem_path: &Path,
        snap_path: &Path,
    ) -> Result<()> {
        for path in [mem_path, snap_path] {
            if !path.is_file() {
                return Err(VmmError::api(format!(
                    "snapshot file missing: {}",
                    path.display()
                )));
            }
        }
        self.insert_running(vm_id)?;
        debug!(vm_id, mem = %mem_path.display(), "simulated VM resumed from snapshot");
        Ok(())
    }

    async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        self.transition(vm_id, VmState::Running, VmState::Paused)
    }

    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        self.transition(vm_id, VmState::Paused, VmState::Running)
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<()> {
        let mut vms = self
            .vms
            .write()
            .map_err(|_| VmmError::api("lock poisoned"))?;
        vms.remove(vm_id)
            .ok_or_else(|| VmmError::UnknownVm(vm_id.to_string()))?;
        debug!(vm_id, "simulated VM stopped");
        Ok(())
    }

    async fn create_snapshot(&self, vm_id: &str, mem_path: &Path, snap_path: &Path) -> Result<()> {
        {
            let vms = self.vms.read().map_err(|_| VmmError::api("lock poisoned"))?;
            let vm = vms
                .get(vm_id)
                .ok_or_else(|| VmmError::UnknownVm(vm_id.to_string()))?;
            if vm.state != VmState::Paused {
                return Err(VmmError::InvalidState(format!(
                    "VM {vm_id} must be paused to snapshot"
                )));
            }
        }

        let image = self.synthesize_memory(vm_id);
        tokio::fs::write(mem_path, &image).await?;
        let device_state =
            serde_json::json!({ "vm_id": vm_id, "mem_bytes": image.len() }).to_string();
        tokio::fs::write(snap_path, device_state).await?;
        debug!(vm_id, bytes = image.len(), "simulated snapshot written");
        Ok(())
    }

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &str) -> Result<()> {
        let mut vms = self
            .vms
            .write()
            .map_err(|_| VmmError::api("lock poisoned"))?;
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| VmmError::UnknownVm(vm_id.to_string()))?;
        vm.metadata = Some(metadata.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_pause_resume_stop() {
        let vmm = SimVmm::new();
        vmm.create_vm("vm-1", &MachineSpec::default()).await.unwrap();
        assert_eq!(vmm.state("vm-1"), Some(VmState::Running));

        vmm.pause_vm("vm-1").await.unwrap();
        assert_eq!(vmm.state("vm-1"), Some(VmState::Paused));

        vmm.resume_vm("vm-1").await.unwrap();
        vmm.stop_vm("vm-1").await.unwrap();
        assert_eq!(vmm.vm_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_boot_rejected() {
        let vmm = SimVmm::new();
        vmm.create_vm("vm-1", &MachineSpec::default()).await.unwrap();
        let err = vmm.create_vm("vm-1", &MachineSpec::default()).await.unwrap_err();
        assert!(matches!(err, VmmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn snapshot_requires_pause() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = SimVmm::with_memory_size(8192);
        vmm.create_vm("vm-1", &MachineSpec::default()).await.unwrap();

        let mem = dir.path().join("mem");
        let snap = dir.path().join("snap");
        let err = vmm.create_snapshot("vm-1", &mem, &snap).await.unwrap_err();
        assert!(matches!(err, VmmError::InvalidState(_)));

        vmm.pause_vm("vm-1").await.unwrap();
        vmm.create_snapshot("vm-1", &mem, &snap).await.unwrap();
        assert_eq!(std::fs::metadata(&mem).unwrap().len(), 8192);
        assert!(snap.is_file());
    }

    #[tokio::test]
    async fn snapshot_memory_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = SimVmm::with_memory_size(16384);
        for vm_id in ["a", "a2"] {
            vmm.create_vm(vm_id, &MachineSpec::default()).await.unwrap();
            vmm.pause_vm(vm_id).await.unwrap();
        }

        let mem_a = dir.path().join("mem-a");
        let mem_b = dir.path().join("mem-b");
        vmm.create_snapshot("a", &mem_a, &dir.path().join("s-a")).await.unwrap();
        vmm.create_snapshot("a", &mem_b, &dir.path().join("s-b")).await.unwrap();
        assert_eq!(
            std::fs::read(&mem_a).unwrap(),
            std::fs::read(&mem_b).unwrap()
        );

        let mem_c = dir.path().join("mem-c");
        vmm.create_snapshot("a2", &mem_c, &dir.path().join("s-c")).await.unwrap();
        assert_ne!(
            std::fs::read(&mem_a).unwrap(),
            std::fs::read(&mem_c).unwrap()
        );
    }

    #[tokio::test]
    async fn boot_from_snapshot_needs_files() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = SimVmm::new();
        let err = vmm
            .create_vm_from_snapshot(
                "vm-1",
                &MachineSpec::default(),
                &dir.path().join("missing-mem"),
                &dir.path().join("missing-snap"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VmmError::Api(_)));
    }
}
