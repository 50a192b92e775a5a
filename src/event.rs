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

//! Events pushed from the machine worker to registered observers.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::{driver::Temperatures, state::MachineState};

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(tag = "type")]
/// The set of events the controller can deliver to its listeners.
pub enum MachineEvent {
    /// The machine state changed.
    StateChange {
        /// The state before the change.
        prev: MachineState,
        /// The state after the change.
        current: MachineState,
    },
    /// A build made progress (one event per processed line).
    Progress {
        /// Time since the build started, in milliseconds.
        elapsed_ms: u64,
        /// The estimated total build time, if an estimate has been taken.
        estimated_total_ms: Option<u64>,
        /// Lines processed so far across all segments.
        lines_processed: u64,
        /// Total lines across warmup, source, and cooldown.
        lines_total: u64,
    },
    /// A status-poll reading of the toolhead, emitted while temperature
    /// monitoring is enabled.
    ToolStatus {
        /// The temperatures read from the device.
        temperatures: Temperatures,
    },
}

/// An observer of machine events.
///
/// Listeners must not call back into the controller from `machine_event`;
/// state-change events are delivered synchronously on the worker thread.
pub trait MachineListener: Send + Sync {
    /// Called for every emitted event.
    fn machine_event(&self, event: &MachineEvent);
}

/// The set of registered listeners.
///
/// The list is guarded by its own lock and snapshotted before every
/// dispatch, so listeners may be added or removed during an emission; the
/// change takes effect from the next event.
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn MachineListener>>>,
}

impl ListenerSet {
    #[must_use]
    /// Construct an empty listener set.
    pub fn new() -> ListenerSet {
        ListenerSet {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener and immediately deliver the current state to it.
    pub fn add(&self, listener: Arc<dyn MachineListener>, current: MachineState) {
        listener.machine_event(&MachineEvent::StateChange {
            prev: current,
            current,
        });
        if let Ok(mut guard) = self.listeners.lock() {
            guard.push(listener);
        }
    }

    /// Remove a listener previously registered with [`add`].
    ///
    /// [`add`]: ListenerSet::add
    pub fn remove(&self, listener: &Arc<dyn MachineListener>) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Deliver `event` to every currently registered listener.
    pub fn emit(&self, event: &MachineEvent) {
        let snapshot: Vec<Arc<dyn MachineListener>> = match self.listeners.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener.machine_event(event);
        }
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        ListenerSet::new()
    }
}

#[cfg(test)]
/// Recording listeners for observing the worker from tests.
pub mod testing {
    use super::*;

    #[derive(Default)]
    /// A listener that records every event it receives.
    pub struct RecordingListener {
        events: Mutex<Vec<MachineEvent>>,
    }

    impl RecordingListener {
        /// All events received so far.
        pub fn events(&self) -> Vec<MachineEvent> {
            self.events.lock().unwrap().clone()
        }

        /// How many progress events have been received.
        pub fn progress_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, MachineEvent::Progress { .. }))
                .count()
        }

        /// The phases observed through state-change events, in order.
        pub fn phases(&self) -> Vec<crate::state::Phase> {
            self.events()
                .iter()
                .filter_map(|e| match e {
                    MachineEvent::StateChange { current, .. } => Some(current.phase()),
                    _ => None,
                })
                .collect()
        }
    }

    impl MachineListener for RecordingListener {
        fn machine_event(&self, event: &MachineEvent) {
            self.events.lock().unwrap().push(*event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::RecordingListener, *};

    #[test]
    /// Test that registration immediately delivers a current-state event.
    fn registration_delivers_current_state() {
        let set = ListenerSet::new();
        let listener = Arc::new(RecordingListener::default());
        let state = MachineState::new();

        set.add(Arc::clone(&listener) as Arc<dyn MachineListener>, state);

        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MachineEvent::StateChange { .. }));
    }

    #[test]
    /// Test that a removed listener stops receiving events while others
    /// keep receiving them.
    fn removal_takes_effect() {
        let set = ListenerSet::new();
        let kept = Arc::new(RecordingListener::default());
        let removed = Arc::new(RecordingListener::default());
        let state = MachineState::new();

        let kept_dyn = Arc::clone(&kept) as Arc<dyn MachineListener>;
        let removed_dyn = Arc::clone(&removed) as Arc<dyn MachineListener>;
        set.add(Arc::clone(&kept_dyn), state);
        set.add(Arc::clone(&removed_dyn), state);
        set.remove(&removed_dyn);

        set.emit(&MachineEvent::StateChange {
            prev: state,
            current: state,
        });

        assert_eq!(kept.events().len(), 2);
        assert_eq!(removed.events().len(), 1);
    }

    #[test]
    /// Test that a listener which mutates the set during emission does not
    /// affect the in-flight dispatch.
    fn mutation_during_emission_is_safe() {
        struct SelfRemover {
            set: Arc<ListenerSet>,
            me: Mutex<Option<Arc<dyn MachineListener>>>,
        }

        impl MachineListener for SelfRemover {
            fn machine_event(&self, _event: &MachineEvent) {
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.set.remove(&me);
                }
            }
        }

        let set = Arc::new(ListenerSet::new());
        let remover = Arc::new(SelfRemover {
            set: Arc::clone(&set),
            me: Mutex::new(None),
        });
        let remover_dyn = Arc::clone(&remover) as Arc<dyn MachineListener>;
        let tail = Arc::new(RecordingListener::default());
        let state = MachineState::new();
        set.add(Arc::clone(&remover_dyn), state);
        set.add(Arc::clone(&tail) as Arc<dyn MachineListener>, state);
        *remover.me.lock().unwrap() = Some(remover_dyn);

        let event = MachineEvent::StateChange {
            prev: state,
            current: state,
        };
        set.emit(&event);
        // the remover dropped itself mid-emission; the tail still got the
        // event, and the next emission skips the remover
        set.emit(&event);
        assert_eq!(tail.events().len(), 3);
    }
}
