//! Admission control for worker slots.
//!
//! Every preparation or watch worker holds a [`WorkerSlot`] granted by the
//! [`AdmissionController`]. A slot is only granted while the pool for its kind
//! has capacity and host memory utilization is below the configured ceiling.

mod config;
mod controller;
mod memory;

pub use config::AdmissionConfig;
pub use controller::{AdmissionController, AdmissionStatus, Deferral, SlotKind, WorkerSlot};
pub use memory::{MemoryError, MemoryMonitor, MemoryReading, SystemMemoryMonitor};
