//! Operation Registry - who may start what, right now
//!
//! Holds the daemon's only mutable in-memory state, [`SystemState`], behind
//! one mutex. An operation starts by taking a [`Lease`] through
//! [`OperationRegistry::try_begin`] and ends by handing it back through
//! [`OperationRegistry::complete`].
//!
//! Rules:
//! - The update group is pairwise exclusive; Backup and Restore conflict
//!   with the update group and themselves, not with each other
//! - A process-table hit for any update signature means Busy, whoever
//!   started it
//! - The mutex is never held across a probe, a command or an await
//! - A failed or aborted lease has everything it staged removed
//! - Only work started by this process latches "update in progress";
//!   anything found running outside it is re-probed on every ask

use power_common::process_probe::UPDATE_SIGNATURES;
use power_common::{
    BusyReason, Marker, MarkerStore, Operation, Outcome, PowerError, ProcessProbe, Staged,
    VoltageState,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// In-memory state of the daemon
#[derive(Debug, Default)]
pub struct SystemState {
    /// Operation -> id of the lease holding it
    in_flight: HashMap<Operation, u64>,
    next_lease_id: u64,
    /// A reboot update was staged or a live update launched
    system_update_in_progress: bool,
    /// At most one live update per process lifetime
    live_update_attempted: bool,
    low_voltage_ever_observed: bool,
    hardware_clock_detected: bool,
}

impl SystemState {
    fn check(&self, op: Operation) -> Result<(), BusyReason> {
        if let Some(held) = self.in_flight.keys().find(|held| held.conflicts_with(op)) {
            return Err(BusyReason::LeaseHeld(*held));
        }
        if op == Operation::LiveUpdate && self.live_update_attempted {
            return Err(BusyReason::LiveUpdateAlreadyAttempted);
        }
        if op.is_update_group() && self.system_update_in_progress {
            return Err(BusyReason::UpdateInProgress);
        }
        Ok(())
    }
}

/// Read-only view of [`SystemState`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub in_flight: Vec<Operation>,
    pub system_update_in_progress: bool,
    pub live_update_attempted: bool,
    pub low_voltage_ever_observed: bool,
    pub hardware_clock_detected: bool,
}

struct Inner {
    state: Mutex<SystemState>,
    markers: MarkerStore,
    probe: ProcessProbe,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SystemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, lease: &Lease, outcome: &Outcome) -> Result<(), PowerError> {
        let mut first_err = None;

        // Roll back before the lease is released so nobody sees half-undone state
        if !outcome.is_success() {
            for staged in lease.staged.iter().rev() {
                if let Err(e) = self.markers.unstage(*staged) {
                    error!("rollback of {:?} for {} failed: {}", staged, lease.op, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        let mut state = self.lock();
        if state.in_flight.get(&lease.op) == Some(&lease.id) {
            state.in_flight.remove(&lease.op);
        }
        if lease.op == Operation::LiveUpdate && lease.launched {
            state.live_update_attempted = true;
        }
        if outcome.is_success() {
            match lease.op {
                Operation::RebootUpdate => state.system_update_in_progress = true,
                Operation::LiveUpdate if lease.launched => state.system_update_in_progress = true,
                _ => {}
            }
        }
        drop(state);

        match outcome {
            Outcome::Succeeded => info!("{} succeeded", lease.op),
            Outcome::Failed(reason) => warn!("{} failed: {}", lease.op, reason),
            Outcome::Aborted => warn!("{} aborted", lease.op),
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Exclusive right to run one operation
///
/// Hand it back with [`OperationRegistry::complete`]. A lease dropped
/// without completion is treated as aborted.
#[must_use = "a lease must be completed"]
pub struct Lease {
    id: u64,
    op: Operation,
    staged: Vec<Staged>,
    launched: bool,
    done: bool,
    inner: Arc<Inner>,
}

impl Lease {
    pub fn staged(&self) -> &[Staged] {
        &self.staged
    }

    /// The work has started outside this process and can no longer be undone.
    pub fn mark_launched(&mut self) {
        self.launched = true;
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("staged", &self.staged)
            .field("launched", &self.launched)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.done {
            warn!("lease for {} dropped without completion", self.op);
            self.done = true;
            let inner = Arc::clone(&self.inner);
            let _ = inner.finish(self, &Outcome::Aborted);
        }
    }
}

/// The core state machine
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Inner>,
}

impl OperationRegistry {
    pub fn new(markers: MarkerStore, probe: ProcessProbe) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SystemState::default()),
                markers,
                probe,
            }),
        }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.inner.markers
    }

    pub fn probe(&self) -> &ProcessProbe {
        &self.inner.probe
    }

    /// Look for an update left running by an earlier daemon or the boot phase.
    ///
    /// Called once at startup in place of any persisted flag. A hit is only
    /// reported, never latched: once that process exits the system is free.
    pub async fn recover(&self) -> Option<String> {
        let found = self.inner.probe.first_running(&UPDATE_SIGNATURES).await;
        match &found {
            Some(signature) => info!("'{}' is running, system update in progress", signature),
            None => debug!("no update processes found"),
        }
        found
    }

    /// Try to take the lease for `op`.
    pub async fn try_begin(&self, op: Operation) -> Result<Lease, BusyReason> {
        // Cheap answer first; skips the listing when already busy
        self.inner.lock().check(op)?;

        if let Some(signature) = self.inner.probe.first_running(&UPDATE_SIGNATURES).await {
            debug!("{} refused: '{}' is running", op, signature);
            return Err(BusyReason::ExternallyRunning(signature));
        }

        if op.stages_boot_action() && self.inner.markers.boot_action_staged() {
            debug!("{} refused: boot action already staged", op);
            return Err(BusyReason::BootActionPending);
        }

        let mut state = self.inner.lock();
        // The state may have moved while the probe ran
        state.check(op)?;
        state.next_lease_id += 1;
        let id = state.next_lease_id;
        state.in_flight.insert(op, id);
        drop(state);

        info!("{} started (lease {})", op, id);
        Ok(Lease {
            id,
            op,
            staged: Vec::new(),
            launched: false,
            done: false,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Release `lease`. Failed and aborted leases have their staging undone;
    /// a rollback failure is returned after every item was attempted.
    pub fn complete(&self, mut lease: Lease, outcome: Outcome) -> Result<(), PowerError> {
        debug_assert!(Arc::ptr_eq(&self.inner, &lease.inner));
        lease.done = true;
        self.inner.finish(&lease, &outcome)
    }

    /// Set `marker` on behalf of `lease`, to be cleared if the lease fails.
    ///
    /// A marker that was already present is left alone on rollback.
    pub fn stage_marker(&self, lease: &mut Lease, marker: Marker) -> Result<(), PowerError> {
        let existed = self.inner.markers.exists(marker);
        self.inner.markers.set(marker)?;
        if !existed {
            lease.staged.push(Staged::Marker(marker));
        }
        Ok(())
    }

    /// Clear `marker` on behalf of `lease`. Not undone on rollback.
    pub fn clear_marker(&self, _lease: &mut Lease, marker: Marker) -> Result<(), PowerError> {
        self.inner.markers.clear(marker)
    }

    /// Wind up a lease from the result of its work.
    ///
    /// `Ok` completes as succeeded, `Err` as failed; a rollback failure is
    /// logged, and the work's own error is what the caller sees.
    pub fn settle<T>(&self, lease: Lease, result: Result<T, PowerError>) -> Result<T, PowerError> {
        let outcome = match &result {
            Ok(_) => Outcome::Succeeded,
            Err(e) => Outcome::failed(e.to_string()),
        };
        match (self.complete(lease, outcome), result) {
            (Ok(()), result) => result,
            (Err(rollback), Ok(value)) => {
                error!("lease completed but cleanup failed: {}", rollback);
                Ok(value)
            }
            (Err(rollback), Err(e)) => {
                error!("rollback after '{}' failed: {}", e, rollback);
                Err(e)
            }
        }
    }

    /// Install `script` as the boot action on behalf of `lease`.
    pub fn stage_boot_action(&self, lease: &mut Lease, script: &Path) -> Result<(), PowerError> {
        self.inner.markers.install_boot_action(script)?;
        lease.staged.push(Staged::BootAction);
        Ok(())
    }

    pub fn current_status(&self) -> RegistryStatus {
        let state = self.inner.lock();
        let mut in_flight: Vec<Operation> = state.in_flight.keys().copied().collect();
        in_flight.sort_by_key(|op| op.as_str());
        RegistryStatus {
            in_flight,
            system_update_in_progress: state.system_update_in_progress,
            live_update_attempted: state.live_update_attempted,
            low_voltage_ever_observed: state.low_voltage_ever_observed,
            hardware_clock_detected: state.hardware_clock_detected,
        }
    }

    /// In-memory flag, or anything update-like in the process table.
    pub async fn update_in_progress(&self) -> bool {
        if self.inner.lock().system_update_in_progress {
            return true;
        }
        self.inner
            .probe
            .first_running(&UPDATE_SIGNATURES)
            .await
            .is_some()
    }

    /// Record a voltage reading; "ever observed" latches for the process lifetime.
    pub fn observe_voltage(&self, reading: VoltageState) -> VoltageState {
        let mut state = self.inner.lock();
        state.low_voltage_ever_observed |= reading.low_voltage_ever_observed;
        VoltageState {
            low_voltage_now: reading.low_voltage_now,
            low_voltage_ever_observed: state.low_voltage_ever_observed,
        }
    }

    pub fn set_hardware_clock_detected(&self, detected: bool) {
        self.inner.lock().hardware_clock_detected = detected;
    }

    pub fn hardware_clock_detected(&self) -> bool {
        self.inner.lock().hardware_clock_detected
    }
}
