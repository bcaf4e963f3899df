//! The VM coordinator.
//!
//! For every container request the coordinator either cold-boots a fresh
//! microVM (and can later capture a snapshot of it) or warm-boots from a
//! snapshot resolved through the snapshot manager, downloading and
//! reconstructing it from the object store on a local miss. It owns the
//! `container id → active VM` table under high concurrency; thousands of
//! parallel start/stop operations only contend on brief map locks.
//!
//! The hypervisor, container runtime and network manager are collaborators
//! injected behind traits; orchestrator-less mode skips them entirely so the
//! table and concurrency core can be exercised without any of them.

mod backend;
mod config;
mod coordinator;
mod error;

pub use backend::{
    ContainerRuntime, NetHandle, NetworkManager, NullNetwork, NullRuntime, SnapshotMount,
    TaskHandle,
};
pub use config::{Config, CoordinatorConfig, RegistryCredentials, VmDefaults};
pub use coordinator::{Coordinator, VmInfo};
pub use error::{CoreError, Result};
