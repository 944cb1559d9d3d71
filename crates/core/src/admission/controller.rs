//! Slot accounting for the preparation and watch pools.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::config::AdmissionConfig;
use super::memory::MemoryMonitor;
use crate::metrics;

/// Worker pool a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Preparation,
    Watch,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Preparation => "preparation",
            SlotKind::Watch => "watch",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an admission request was not granted this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deferral {
    /// The pool for this kind is full.
    Capacity,
    /// Memory utilization is at or above the ceiling for this kind.
    Memory { percent: f32 },
    /// The race already holds a slot of this kind.
    AlreadyHeld,
    /// The race was retired after an invariant violation.
    Retired,
}

impl Deferral {
    pub fn reason(&self) -> &'static str {
        match self {
            Deferral::Capacity => "capacity",
            Deferral::Memory { .. } => "memory",
            Deferral::AlreadyHeld => "duplicate",
            Deferral::Retired => "retired",
        }
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub active_preparation: usize,
    pub active_watch: usize,
    pub max_preparation: usize,
    pub max_watch: usize,
    pub max_memory_percent: f32,
    pub watch_memory_percent: f32,
    /// Utilization at the most recent successful sample.
    pub last_memory_percent: Option<f32>,
    pub granted_total: u64,
    pub deferred_total: u64,
}

#[derive(Debug, Default)]
struct State {
    active_preparation: usize,
    active_watch: usize,
    held: HashSet<(String, SlotKind)>,
    retired: HashSet<String>,
    last_memory_percent: Option<f32>,
    sample_failed: bool,
    granted_total: u64,
    deferred_total: u64,
}

impl State {
    fn active_mut(&mut self, kind: SlotKind) -> &mut usize {
        match kind {
            SlotKind::Preparation => &mut self.active_preparation,
            SlotKind::Watch => &mut self.active_watch,
        }
    }

    fn active(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::Preparation => self.active_preparation,
            SlotKind::Watch => self.active_watch,
        }
    }
}

struct Inner {
    config: AdmissionConfig,
    monitor: Arc<dyn MemoryMonitor>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, kind: SlotKind, race_id: &str) {
        let mut state = self.lock();
        if !state.held.remove(&(race_id.to_string(), kind)) {
            error!(race_id = %race_id, kind = %kind, "Released a slot that was not held");
            return;
        }
        let active = state.active_mut(kind);
        match active.checked_sub(1) {
            Some(n) => *active = n,
            None => {
                error!(race_id = %race_id, kind = %kind, "Slot count underflow on release");
                return;
            }
        }
        metrics::ACTIVE_SLOTS
            .with_label_values(&[kind.as_str()])
            .set(state.active(kind) as i64);
        debug!(race_id = %race_id, kind = %kind, active = state.active(kind), "Released slot");
    }
}

/// Grants worker slots under capacity and memory limits.
///
/// Cheap to clone; clones share the same counters. All decisions are made
/// under one lock, so concurrent callers never push a count past its limit.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, monitor: Arc<dyn MemoryMonitor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                monitor,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Request a slot, returning `None` when the request must wait for a later tick.
    pub fn try_admit(&self, kind: SlotKind, race_id: &str) -> Option<WorkerSlot> {
        self.admit(kind, race_id).ok()
    }

    /// Request a slot, reporting why it was deferred.
    ///
    /// A memory sample that cannot be read does not block admission; the
    /// failure is logged once until the monitor recovers.
    pub fn admit(&self, kind: SlotKind, race_id: &str) -> Result<WorkerSlot, Deferral> {
        let inner = &self.inner;
        let mut state = inner.lock();

        let decision = if state.retired.contains(race_id) {
            Err(Deferral::Retired)
        } else if state.held.contains(&(race_id.to_string(), kind)) {
            Err(Deferral::AlreadyHeld)
        } else if state.active(kind) >= inner.config.limit(kind) {
            Err(Deferral::Capacity)
        } else {
            match inner.monitor.sample() {
                Ok(percent) => {
                    state.last_memory_percent = Some(percent);
                    state.sample_failed = false;
                    metrics::MEMORY_PERCENT.set(percent as f64);
                    if percent >= inner.config.memory_ceiling(kind) {
                        Err(Deferral::Memory { percent })
                    } else {
                        Ok(())
                    }
                }
                Err(e) => {
                    if !state.sample_failed {
                        warn!(error = %e, "Memory sample failed, admitting on capacity alone");
                        state.sample_failed = true;
                    }
                    Ok(())
                }
            }
        };

        if let Err(deferral) = decision {
            state.deferred_total += 1;
            metrics::SLOTS_DEFERRED
                .with_label_values(&[kind.as_str(), deferral.reason()])
                .inc();
            debug!(
                race_id = %race_id,
                kind = %kind,
                reason = deferral.reason(),
                "Admission deferred"
            );
            return Err(deferral);
        }

        *state.active_mut(kind) += 1;
        state.held.insert((race_id.to_string(), kind));
        state.granted_total += 1;
        metrics::SLOTS_GRANTED.with_label_values(&[kind.as_str()]).inc();
        metrics::ACTIVE_SLOTS
            .with_label_values(&[kind.as_str()])
            .set(state.active(kind) as i64);
        debug!(race_id = %race_id, kind = %kind, active = state.active(kind), "Granted slot");

        Ok(WorkerSlot {
            kind,
            race_id: race_id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Return a slot. Equivalent to dropping it.
    pub fn release(&self, slot: WorkerSlot) {
        drop(slot);
    }

    /// Refuse all future slots for a race.
    pub fn retire(&self, race_id: &str) {
        self.inner.lock().retired.insert(race_id.to_string());
    }

    /// Slots currently held for a kind.
    pub fn active(&self, kind: SlotKind) -> usize {
        self.inner.lock().active(kind)
    }

    pub fn status(&self) -> AdmissionStatus {
        let config = &self.inner.config;
        let state = self.inner.lock();
        AdmissionStatus {
            active_preparation: state.active_preparation,
            active_watch: state.active_watch,
            max_preparation: config.max_preparation,
            max_watch: config.max_watch,
            max_memory_percent: config.max_memory_percent,
            watch_memory_percent: config.memory_ceiling(SlotKind::Watch),
            last_memory_percent: state.last_memory_percent,
            granted_total: state.granted_total,
            deferred_total: state.deferred_total,
        }
    }
}

/// A granted slot. Returned to the controller exactly once, when dropped.
pub struct WorkerSlot {
    kind: SlotKind,
    race_id: String,
    inner: Arc<Inner>,
}

impl WorkerSlot {
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn race_id(&self) -> &str {
        &self.race_id
    }
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("kind", &self.kind)
            .field("race_id", &self.race_id)
            .finish()
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.inner.release(self.kind, &self.race_id);
    }
}
