/*
  printhost, a 3D printer build controller.
  Copyright (C) 2023 the printhost developers.

  printhost is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  printhost is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The machine-wide state machine and its guarded cell.

use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
/// The set of errors that can be caused from working with a `StateCell`.
pub enum Error {
    /// The cell's lock was poisoned. This implies a panicked thread owned the
    /// lock.
    #[error("state lock poisoned")]
    Poison,
    /// An illegal transition was attempted.
    #[error("illegal machine state transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// The phase the transition was attempted from.
        from: Phase,
        /// The phase the transition was attempted into.
        to: Phase,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
/// The set of all phases the machine can be in.
pub enum Phase {
    /// No device is attached; requests other than `Connect` are refused.
    NotAttached,
    /// The driver is being initialized.
    Connecting,
    /// Connected and idle, awaiting work.
    Ready,
    /// A build is streaming through the host (live, simulated, or captured).
    Building,
    /// The device is replaying a build from its own storage.
    BuildingRemote,
    /// A stop was requested; the device is being halted.
    Stopping,
    /// A reset was requested; the device is being returned to a known state.
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
/// A snapshot of machine state: the current phase plus the pause flag.
///
/// Values of this type handed out to callers are copies; only the
/// [`StateCell`] mutates the live one.
pub struct MachineState {
    phase: Phase,
    paused: bool,
}

impl MachineState {
    /// The initial state of a freshly constructed machine.
    #[must_use]
    pub const fn new() -> MachineState {
        MachineState {
            phase: Phase::NotAttached,
            paused: false,
        }
    }

    /// The current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a build (host-driven or remote) is in flight.
    #[must_use]
    pub const fn is_building(&self) -> bool {
        matches!(self.phase, Phase::Building | Phase::BuildingRemote)
    }

    /// Whether a device is attached and past initialization.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        !matches!(self.phase, Phase::NotAttached | Phase::Connecting)
    }

    /// Whether the machine is connected and idle.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    /// Whether the in-flight build is paused. Only ever true while building.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState::new()
    }
}

/// A guard for machine state which can be used to notify the worker of
/// changes.
///
/// One condition variable serves every suspension point: the worker's idle
/// wait, the pipeline's pause wait, and the remote-build poll. Every setter
/// and every scheduled request notifies it. Waits are timed so that a wake
/// racing a check costs one tick of latency rather than a hang.
pub struct StateCell {
    /// The current state.
    state: Mutex<MachineState>,
    /// Notified on every mutation and on every scheduled request.
    changed: Condvar,
}

impl StateCell {
    #[must_use]
    /// Construct a new `StateCell` in the initial `NotAttached` state.
    pub fn new() -> StateCell {
        StateCell {
            state: Mutex::new(MachineState::new()),
            changed: Condvar::new(),
        }
    }

    /// Get a copy of the current state. This operation is blocking.
    ///
    /// # Errors
    ///
    /// Will return an error in the case that the internal lock of this cell
    /// is poisoned.
    pub fn snapshot(&self) -> Result<MachineState, Error> {
        match self.state.lock() {
            Ok(s) => Ok(*s),
            Err(_) => Err(Error::Poison),
        }
    }

    /// Move the machine into a new phase.
    ///
    /// Returns `Ok(Some((prev, new)))` when the phase actually changed, and
    /// `Ok(None)` when `phase` equals the current phase (repeated requests
    /// are no-ops). Leaving a building phase clears the pause flag. Wakes
    /// the worker on change.
    ///
    /// # Errors
    ///
    /// Returns `Error::Poison` if the internal lock is poisoned, and
    /// `Error::IllegalTransition` if `phase` is not reachable from the
    /// current phase.
    pub fn set_phase(&self, phase: Phase) -> Result<Option<(MachineState, MachineState)>, Error> {
        let mut guard = self.state.lock().map_err(|_| Error::Poison)?;
        let prev = *guard;

        if prev.phase == phase {
            return Ok(None);
        }

        let valid = match phase {
            Phase::NotAttached => true,
            Phase::Connecting => matches!(
                prev.phase,
                Phase::NotAttached | Phase::Building | Phase::BuildingRemote | Phase::Stopping
            ),
            Phase::Ready => matches!(
                prev.phase,
                Phase::Connecting
                    | Phase::Building
                    | Phase::BuildingRemote
                    | Phase::Stopping
                    | Phase::Reset
            ),
            // simulated builds are allowed without an attached device
            Phase::Building => matches!(prev.phase, Phase::Ready | Phase::NotAttached),
            Phase::BuildingRemote => prev.phase == Phase::Ready,
            Phase::Stopping => prev.is_building(),
            Phase::Reset => prev.is_connected(),
        };

        if !valid {
            return Err(Error::IllegalTransition {
                from: prev.phase,
                to: phase,
            });
        }

        guard.phase = phase;
        if !guard.is_building() {
            guard.paused = false;
        }
        let new = *guard;
        drop(guard);
        self.changed.notify_all();
        Ok(Some((prev, new)))
    }

    /// Set or clear the pause flag.
    ///
    /// Pausing is only meaningful during a build; outside one this is a
    /// no-op returning `Ok(None)`, which keeps pause from outliving the
    /// build it was raised in. Wakes the worker on change.
    ///
    /// # Errors
    ///
    /// Returns `Error::Poison` if the internal lock is poisoned.
    pub fn set_paused(&self, paused: bool) -> Result<Option<(MachineState, MachineState)>, Error> {
        let mut guard = self.state.lock().map_err(|_| Error::Poison)?;
        let prev = *guard;

        if prev.paused == paused || (paused && !prev.is_building()) {
            return Ok(None);
        }

        guard.paused = paused;
        let new = *guard;
        drop(guard);
        self.changed.notify_all();
        Ok(Some((prev, new)))
    }

    /// Wake every thread waiting on this cell without changing state.
    pub fn wake(&self) {
        self.changed.notify_all();
    }

    /// Block until woken or until `timeout` elapses, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns `Error::Poison` if the internal lock is poisoned.
    pub fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let guard = self.state.lock().map_err(|_| Error::Poison)?;
        self.changed
            .wait_timeout(guard, timeout)
            .map_err(|_| Error::Poison)?;
        Ok(())
    }

    /// Block while `condition` holds on the current state, up to `timeout`.
    /// Returns the state observed last.
    ///
    /// # Errors
    ///
    /// Returns `Error::Poison` if the internal lock is poisoned.
    pub fn wait_while(
        &self,
        timeout: Duration,
        mut condition: impl FnMut(MachineState) -> bool,
    ) -> Result<MachineState, Error> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().map_err(|_| Error::Poison)?;
        while condition(*guard) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, deadline - now)
                .map_err(|_| Error::Poison)?;
            guard = next;
        }
        Ok(*guard)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}
