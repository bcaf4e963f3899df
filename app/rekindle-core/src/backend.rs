//! Collaborator seams: container runtime and network manager.
//!
//! The coordinator instructs the container runtime to start the function
//! container inside a cold-booted VM and to manage snapshot-backed container
//! mounts for warm boots; the network manager owns per-VM network
//! namespaces. Both are external processes in a deployment, so the seams
//! report opaque string errors and the coordinator maps them to its own
//! error kinds.

use async_trait::async_trait;

/// Handle to a container task running inside a VM.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    /// Container identifier inside the runtime.
    pub container_key: String,
    /// Task identifier inside the runtime.
    pub task_id: String,
}

/// A snapshot-backed container mount and the lease pinning it.
#[derive(Debug, Clone)]
pub struct SnapshotMount {
    /// Runtime key of the container snapshot.
    pub snap_key: String,
    /// Lease that keeps the snapshot contents alive.
    pub lease_id: String,
}

/// Handle to a VM's network namespace.
#[derive(Debug, Clone)]
pub struct NetHandle {
    /// Path of the network namespace.
    pub netns_path: String,
}

/// Container-runtime operations the coordinator needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Starts the function container inside a freshly cold-booted VM.
    async fn start_container(
        &self,
        vm_id: &str,
        image: &str,
    ) -> std::result::Result<TaskHandle, String>;

    /// Tears a container task down: kill, await exit, delete the task,
    /// delete the container.
    async fn teardown_task(&self, handle: &TaskHandle) -> std::result::Result<(), String>;

    /// Prepares the container snapshot mount (and its lease) for a VM booted
    /// from a snapshot.
    async fn prepare_snapshot_mount(
        &self,
        vm_id: &str,
        revision: &str,
    ) -> std::result::Result<SnapshotMount, String>;

    /// Releases a snapshot mount and deletes its lease.
    async fn release_snapshot_mount(
        &self,
        mount: &SnapshotMount,
    ) -> std::result::Result<(), String>;
}

/// Network operations the coordinator needs.
#[async_trait]
pub trait NetworkManager: Send + Sync + 'static {
    /// Creates the network namespace and plumbing for a VM.
    async fn create_network(&self, vm_id: &str) -> std::result::Result<NetHandle, String>;

    /// Tears the VM's network namespace down.
    async fn remove_network(&self, handle: &NetHandle) -> std::result::Result<(), String>;
}

/// Container runtime that hands out synthetic handles.
///
/// Stands in where no runtime daemon is wired up (development and tests);
/// the coordinator's sequencing around the seam stays identical.
#[derive(Debug, Default)]
pub struct NullRuntime;

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn start_container(
        &self,
        vm_id: &str,
        _image: &str,
    ) -> std::result::Result<TaskHandle, String> {
        Ok(TaskHandle {
            container_key: format!("ctr-{vm_id}"),
            task_id: format!("task-{vm_id}"),
        })
    }

    async fn teardown_task(&self, _handle: &TaskHandle) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn prepare_snapshot_mount(
        &self,
        vm_id: &str,
        revision: &str,
    ) -> std::result::Result<SnapshotMount, String> {
        Ok(SnapshotMount {
            snap_key: format!("snap-{vm_id}-{revision}"),
            lease_id: format!("lease-{vm_id}"),
        })
    }

    async fn release_snapshot_mount(
        &self,
        _mount: &SnapshotMount,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Network manager that hands out synthetic namespaces.
#[derive(Debug, Default)]
pub struct NullNetwork;

#[async_trait]
impl NetworkManager for NullNetwork {
    async fn create_network(&self, vm_id: &str) -> std::result::Result<NetHandle, String> {
        Ok(NetHandle {
            netns_path: format!("/var/run/netns/{vm_id}"),
        })
    }

    async fn remove_network(&self, _handle: &NetHandle) -> std::result::Result<(), String> {
        Ok(())
    }
}
