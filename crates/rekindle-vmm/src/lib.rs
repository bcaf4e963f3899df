//! Typed facade over the microVM hypervisor control plane.
//!
//! The coordinator consumes hypervisor capabilities exclusively through the
//! [`Vmm`] trait: boot (cold or from a snapshot), pause/resume, snapshot
//! capture, stop, and guest metadata injection. Calls are synchronous in
//! effect: when `pause_vm` returns the guest is quiescent, when
//! `create_snapshot` returns the files on disk are closed and consistent,
//! when `resume_vm` returns the VM is runnable again.
//!
//! The wire protocol to the actual hypervisor process lives behind an
//! implementation of this trait and is out of scope here. [`SimVmm`] is a
//! simulated backend that enforces the same state machine and produces
//! synthetic memory images, so the snapshot pipeline and the coordinator can
//! be exercised without a hypervisor.

mod client;
mod error;
mod types;

pub use client::{SimVmm, Vmm};
pub use error::{Result, VmmError};
pub use types::{MachineSpec, VmState};
