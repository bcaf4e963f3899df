//! Active-container table and VM boot/snapshot orchestration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use rekindle_error::CommonError;
use rekindle_snapshot::{sparse, Snapshot, SnapshotManager};
use rekindle_vmm::{MachineSpec, Vmm};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ContainerRuntime, NetHandle, NetworkManager, SnapshotMount, TaskHandle};
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Result};

/// Everything the coordinator tracks about one live VM.
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// Hypervisor VM id.
    pub vm_id: String,
    /// Container image the function runs.
    pub image: String,
    /// Function revision.
    pub revision: String,
    /// True if the VM was booted from a snapshot (warm path).
    pub snap_booted: bool,
    /// Container task, present on cold-booted VMs.
    pub task: Option<TaskHandle>,
    /// Snapshot-backed container mount, present on warm-booted VMs.
    pub snapshot_mount: Option<SnapshotMount>,
    /// Network namespace handle.
    pub net: Option<NetHandle>,
}

/// The VM coordinator.
///
/// One `RwLock` guards the `container id → VmInfo` table and serialises only
/// insert, remove and probe; hypervisor and storage work always runs outside
/// it, so N parallel start/stop flows contend only on the brief map
/// operations.
pub struct Coordinator {
    active: RwLock<HashMap<String, VmInfo>>,
    config: CoordinatorConfig,
    snapshots: Option<Arc<SnapshotManager>>,
    vmm: Option<Arc<dyn Vmm>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    network: Option<Arc<dyn NetworkManager>>,
}

impl Coordinator {
    /// Creates a fully orchestrated coordinator.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        snapshots: Arc<SnapshotManager>,
        vmm: Arc<dyn Vmm>,
        runtime: Arc<dyn ContainerRuntime>,
        network: Arc<dyn NetworkManager>,
    ) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            config: CoordinatorConfig {
                orchestrated: true,
                ..config
            },
            snapshots: Some(snapshots),
            vmm: Some(vmm),
            runtime: Some(runtime),
            network: Some(network),
        }
    }

    /// Creates a coordinator in orchestrator-less mode: no hypervisor,
    /// snapshot-manager or network calls are made, and `start_vm` hands out
    /// synthetic VMs. The active table behaves exactly as in orchestrated
    /// mode.
    #[must_use]
    pub fn orchestrator_less() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            config: CoordinatorConfig {
                orchestrated: false,
                ..CoordinatorConfig::default()
            },
            snapshots: None,
            vmm: None,
            runtime: None,
            network: None,
        }
    }

    /// The snapshot manager, when orchestrated.
    #[must_use]
    pub fn snapshot_manager(&self) -> Option<&Arc<SnapshotManager>> {
        self.snapshots.as_ref()
    }

    /// Starts a VM for `image` at `revision`: warm-boots from a snapshot
    /// when one can be acquired (downloading it on a local miss if remote
    /// storage is enabled), cold-boots otherwise.
    ///
    /// The returned [`VmInfo`] is not yet in the active table; pair it with
    /// a container id via [`Self::insert_active`].
    pub async fn start_vm(
        &self,
        image: &str,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<VmInfo> {
        let vm_id = uuid::Uuid::new_v4().to_string();

        if !self.config.orchestrated {
            return Ok(VmInfo {
                vm_id,
                image: image.to_string(),
                revision: revision.to_string(),
                snap_booted: false,
                task: None,
                snapshot_mount: None,
                net: None,
            });
        }

        let net = self
            .network()
            .create_network(&vm_id)
            .await
            .map_err(CoreError::Network)?;

        match self.boot_vm(&vm_id, image, revision, net.clone(), cancel).await {
            Ok(info) => Ok(info),
            Err(e) => {
                // Unwind the namespace; the VM never became visible.
                if let Err(ne) = self.network().remove_network(&net).await {
                    warn!(vm_id, error = %ne, "network rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Boots a VM strictly from the snapshot for `revision`, never falling
    /// back to a cold start. Fails with [`CoreError::RemoteUnavailable`]
    /// when the snapshot is absent locally and remote storage is disabled.
    pub async fn boot_from_snapshot(
        &self,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<VmInfo> {
        let vm_id = uuid::Uuid::new_v4().to_string();

        if !self.config.orchestrated {
            return Ok(VmInfo {
                vm_id,
                image: String::new(),
                revision: revision.to_string(),
                snap_booted: true,
                task: None,
                snapshot_mount: None,
                net: None,
            });
        }

        let snapshot = match self.resolve_snapshot(revision, cancel).await? {
            Some(snapshot) => snapshot,
            None => {
                return Err(CoreError::RemoteUnavailable(format!("revision {revision}")));
            }
        };

        let net = self
            .network()
            .create_network(&vm_id)
            .await
            .map_err(CoreError::Network)?;
        match self
            .warm_boot(&vm_id, &snapshot, net.clone(), cancel)
            .await
        {
            Ok(info) => Ok(info),
            Err(e) => {
                if let Err(ne) = self.network().remove_network(&net).await {
                    warn!(vm_id, error = %ne, "network rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn boot_vm(
        &self,
        vm_id: &str,
        image: &str,
        revision: &str,
        net: NetHandle,
        cancel: &CancellationToken,
    ) -> Result<VmInfo> {
        if let Some(snapshot) = self.resolve_snapshot(revision, cancel).await? {
            return self.warm_boot(vm_id, &snapshot, net, cancel).await;
        }
        self.cold_boot(vm_id, image, revision, net, cancel).await
    }

    /// Resolves the snapshot for `revision`: local acquire, then (with
    /// remote storage enabled) download and re-acquire. A plain miss on both
    /// returns `None`; any error other than not-found propagates.
    async fn resolve_snapshot(
        &self,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot>> {
        let manager = self.snapshots();

        match manager.acquire_snapshot(revision) {
            Ok(snapshot) => return Ok(Some(snapshot)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if !self.config.use_remote_storage || !manager.has_remote() {
            return Ok(None);
        }

        match manager.download_snapshot(revision, cancel).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match manager.acquire_snapshot(revision) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn warm_boot(
        &self,
        vm_id: &str,
        snapshot: &Snapshot,
        net: NetHandle,
        cancel: &CancellationToken,
    ) -> Result<VmInfo> {
        let spec = self.machine_spec(&net);
        self.vmm_call(cancel, "booting VM from snapshot", {
            let vmm = self.vmm();
            async move {
                vmm.create_vm_from_snapshot(
                    vm_id,
                    &spec,
                    &snapshot.mem_file_path,
                    &snapshot.snapshot_file_path,
                )
                .await
            }
        })
        .await?;

        let mount = self
            .runtime()
            .prepare_snapshot_mount(vm_id, &snapshot.revision)
            .await
            .map_err(CoreError::Runtime)?;

        info!(vm_id, revision = %snapshot.revision, "VM booted from snapshot");
        Ok(VmInfo {
            vm_id: vm_id.to_string(),
            image: snapshot.image.clone(),
            revision: snapshot.revision.clone(),
            snap_booted: true,
            task: None,
            snapshot_mount: Some(mount),
            net: Some(net),
        })
    }

    async fn cold_boot(
        &self,
        vm_id: &str,
        image: &str,
        revision: &str,
        net: NetHandle,
        cancel: &CancellationToken,
    ) -> Result<VmInfo> {
        let spec = self.machine_spec(&net);
        self.vmm_call(cancel, "creating VM", {
            let vmm = self.vmm();
            async move { vmm.create_vm(vm_id, &spec).await }
        })
        .await?;

        let result = self.start_cold_container(vm_id, image, cancel).await;
        match result {
            Ok(task) => {
                info!(vm_id, image, revision, "VM cold-booted");
                Ok(VmInfo {
                    vm_id: vm_id.to_string(),
                    image: image.to_string(),
                    revision: revision.to_string(),
                    snap_booted: false,
                    task: Some(task),
                    snapshot_mount: None,
                    net: Some(net),
                })
            }
            Err(e) => {
                // The VM booted but its container did not; take it down.
                if let Err(se) = self.vmm().stop_vm(vm_id).await {
                    warn!(vm_id, error = %se, "VM rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn start_cold_container(
        &self,
        vm_id: &str,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskHandle> {
        if let Some(registry) = &self.config.registry {
            let blob = registry.metadata_blob();
            self.vmm_call(cancel, "setting VM metadata", {
                let vmm = self.vmm();
                async move { vmm.set_vm_metadata(vm_id, &blob).await }
            })
            .await?;
        }

        self.runtime()
            .start_container(vm_id, image)
            .await
            .map_err(CoreError::Runtime)
    }

    /// Inserts a started VM into the active table under `container_id`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the container id is taken; the caller still owns
    /// the dangling VM and is responsible for stopping it.
    pub fn insert_active(&self, container_id: &str, info: VmInfo) -> Result<()> {
        let mut active = self
            .active
            .write()
            .map_err(|_| CommonError::internal("active table lock poisoned"))?;
        if active.contains_key(container_id) {
            return Err(CommonError::already_exists(format!("container {container_id}")).into());
        }
        debug!(container_id, vm_id = %info.vm_id, "container active");
        active.insert(container_id.to_string(), info);
        Ok(())
    }

    /// Returns true if `container_id` is in the active table.
    #[must_use]
    pub fn is_active(&self, container_id: &str) -> bool {
        self.active
            .read()
            .map(|active| active.contains_key(container_id))
            .unwrap_or(false)
    }

    /// Number of active containers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().map(|active| active.len()).unwrap_or(0)
    }

    /// Captures a snapshot of a running, cold-booted VM.
    ///
    /// Pauses the VM, has the hypervisor write the memory and device-state
    /// files at the paths the fresh record dictates, resumes, sparsifies the
    /// memory file (best-effort), serializes the info file, uploads when
    /// remote storage is enabled, and finally commits. A failure while the
    /// VM is paused discards the snapshot and attempts to resume, so the VM
    /// is back in its pre-call state and the revision is never left
    /// half-snapshotted.
    pub async fn orch_create_snapshot(
        &self,
        info: &VmInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.config.orchestrated {
            return Ok(());
        }
        let manager = self.snapshots();

        self.vmm_call(cancel, "pausing VM", {
            let vmm = self.vmm();
            let vm_id = info.vm_id.clone();
            async move { vmm.pause_vm(&vm_id).await }
        })
        .await?;

        let snapshot =
            match manager.init_snapshot(&info.revision, &info.image, Some(info.vm_id.as_str())) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.try_resume(&info.vm_id).await;
                    return Err(e.into());
                }
            };

        if let Err(e) = self
            .vmm_call(cancel, "creating VM snapshot", {
                let vmm = self.vmm();
                let vm_id = info.vm_id.clone();
                let mem = snapshot.mem_file_path.clone();
                let snap = snapshot.snapshot_file_path.clone();
                async move { vmm.create_snapshot(&vm_id, &mem, &snap).await }
            })
            .await
        {
            self.discard(&info.revision);
            self.try_resume(&info.vm_id).await;
            return Err(e);
        }

        if let Err(e) = self
            .vmm_call(cancel, "resuming VM", {
                let vmm = self.vmm();
                let vm_id = info.vm_id.clone();
                async move { vmm.resume_vm(&vm_id).await }
            })
            .await
        {
            self.discard(&info.revision);
            return Err(e);
        }

        // Unused guest pages become holes on disk; a dense file still works.
        if let Err(e) = sparse::punch_holes(&snapshot.mem_file_path) {
            warn!(revision = %info.revision, error = %e, "hole punching failed");
        }

        if let Err(e) = manager.write_info(&info.revision) {
            self.discard(&info.revision);
            return Err(e.into());
        }

        if self.config.use_remote_storage && manager.has_remote() {
            if let Err(e) = manager.upload_snapshot(&info.revision, cancel).await {
                if matches!(
                    &e,
                    rekindle_snapshot::SnapshotError::Common(CommonError::Cancelled(_))
                ) {
                    // A cancelled capture leaves nothing behind.
                    self.discard(&info.revision);
                }
                return Err(e.into());
            }
        }

        manager.commit_snapshot(&info.revision)?;
        info!(revision = %info.revision, vm_id = %info.vm_id, "snapshot created");
        Ok(())
    }

    /// Stops the VM for `container_id` and removes it from the active table.
    ///
    /// Teardown is best-effort: every step is attempted even after an
    /// earlier one fails, and the first error is returned.
    pub async fn stop_vm(&self, container_id: &str, cancel: &CancellationToken) -> Result<()> {
        let info = {
            let mut active = self
                .active
                .write()
                .map_err(|_| CommonError::internal("active table lock poisoned"))?;
            active
                .remove(container_id)
                .ok_or_else(|| CommonError::not_found(format!("container {container_id}")))?
        };

        if !self.config.orchestrated {
            return Ok(());
        }

        let mut first_err: Option<CoreError> = None;

        if !info.snap_booted {
            if let Some(task) = &info.task {
                if let Err(e) = self.runtime().teardown_task(task).await {
                    warn!(container_id, error = %e, "task teardown failed");
                    first_err.get_or_insert(CoreError::Runtime(e));
                }
            }
        }

        if let Err(e) = self
            .vmm_call(cancel, "stopping VM", {
                let vmm = self.vmm();
                let vm_id = info.vm_id.clone();
                async move { vmm.stop_vm(&vm_id).await }
            })
            .await
        {
            warn!(container_id, vm_id = %info.vm_id, error = %e, "VM stop failed");
            first_err.get_or_insert(e);
        }

        if info.snap_booted {
            if let Some(mount) = &info.snapshot_mount {
                if let Err(e) = self.runtime().release_snapshot_mount(mount).await {
                    warn!(container_id, error = %e, "snapshot mount release failed");
                    first_err.get_or_insert(CoreError::Runtime(e));
                }
            }
        }

        if let Some(net) = &info.net {
            if let Err(e) = self.network().remove_network(net).await {
                warn!(container_id, error = %e, "network removal failed");
                first_err.get_or_insert(CoreError::Network(e));
            }
        }

        match first_err {
            None => {
                info!(container_id, vm_id = %info.vm_id, "VM stopped");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    fn machine_spec(&self, net: &NetHandle) -> MachineSpec {
        MachineSpec {
            netns_path: Some(net.netns_path.clone().into()),
            ..self.config.machine.clone()
        }
    }

    /// Runs a hypervisor call under the configured deadline and the caller's
    /// cancellation token.
    async fn vmm_call<T, F>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = rekindle_vmm::Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(CommonError::cancelled(what).into());
        }
        tokio::select! {
            () = cancel.cancelled() => Err(CommonError::cancelled(what).into()),
            outcome = tokio::time::timeout(self.config.vmm_timeout, fut) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CoreError::Vmm(e)),
                Err(_) => Err(CommonError::timeout(format!(
                    "{what} after {:?}",
                    self.config.vmm_timeout
                ))
                .into()),
            },
        }
    }

    /// Resumes a paused VM while unwinding a failed snapshot, ignoring (but
    /// logging) failures so the original error wins.
    async fn try_resume(&self, vm_id: &str) {
        match tokio::time::timeout(self.config.vmm_timeout, self.vmm().resume_vm(vm_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(vm_id, error = %e, "resume during unwind failed"),
            Err(_) => warn!(vm_id, "resume during unwind timed out"),
        }
    }

    /// Drops an uncommitted snapshot while unwinding, logging failures.
    fn discard(&self, revision: &str) {
        if let Err(e) = self.snapshots().delete_snapshot(revision) {
            warn!(revision, error = %e, "snapshot discard failed");
        }
    }

    fn snapshots(&self) -> &Arc<SnapshotManager> {
        self.snapshots
            .as_ref()
            .expect("orchestrated coordinator has a snapshot manager")
    }

    fn vmm(&self) -> &Arc<dyn Vmm> {
        self.vmm
            .as_ref()
            .expect("orchestrated coordinator has a VMM client")
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.runtime
            .as_ref()
            .expect("orchestrated coordinator has a container runtime")
    }

    fn network(&self) -> &Arc<dyn NetworkManager> {
        self.network
            .as_ref()
            .expect("orchestrated coordinator has a network manager")
    }
}
