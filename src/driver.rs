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

//! Capability interfaces for device drivers.
//!
//! The goal of this module is to abstract away the details of how a given
//! device transport and firmware dialect work so that the controller can
//! focus on build orchestration. A driver is a composition of capabilities:
//! the core [`Driver`] trait plus optional capture, serial-ownership, and
//! onboard-parameter interfaces probed at runtime.

use std::{io, path::Path, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::command::CommandFault;

#[derive(Debug, Error)]
/// The set of failures a driver operation can report.
pub enum DriverError {
    /// The transport failed underneath the driver.
    #[error("driver I/O error: {0}")]
    Io(#[from] io::Error),
    /// No driver is attached to the controller.
    #[error("no driver attached")]
    NotAttached,
    /// The driver has not been initialized (or was uninitialized while the
    /// operation was in flight).
    #[error("driver not initialized")]
    NotInitialized,
    /// The lock guarding the driver was poisoned.
    #[error("driver lock poisoned")]
    Poison,
    /// The driver does not implement the requested capability.
    #[error("driver does not support {0}")]
    Unsupported(&'static str),
    /// A device-level fault with a firmware-supplied description.
    #[error("device fault: {0}")]
    Device(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
/// A position of the toolhead in machine coordinates, in millimetres.
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// The machine origin.
    #[must_use]
    pub const fn origin() -> Position {
        Position { x: 0.0, y: 0.0, z: 0.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
/// A snapshot of toolhead and build-platform temperatures, in Celsius.
pub struct Temperatures {
    /// Current temperature of the active tool.
    pub tool: f64,
    /// Target temperature of the active tool.
    pub tool_target: f64,
    /// Current temperature of the build platform.
    pub platform: f64,
    /// Target temperature of the build platform.
    pub platform_target: f64,
}

impl Temperatures {
    /// An all-cold snapshot.
    #[must_use]
    pub const fn cold() -> Temperatures {
        Temperatures {
            tool: 0.0,
            tool_target: 0.0,
            platform: 0.0,
            platform_target: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Responses reported by the device for on-device storage operations.
pub enum ResponseCode {
    Success,
    FailNoCard,
    FailInit,
    FailPartition,
    FailFs,
    FailRootDir,
    FailLocked,
    FailNoFile,
    FailGeneric,
}

impl ResponseCode {
    /// The fixed user-facing message for this response, or `None` for
    /// `Success`.
    #[must_use]
    pub fn user_message(self) -> Option<&'static str> {
        match self {
            ResponseCode::Success => None,
            ResponseCode::FailNoCard => Some(
                "No SD card was detected. Please make sure a working, formatted card is \
                 inserted in the machine's card slot and try again.",
            ),
            ResponseCode::FailInit => Some(
                "The SD card could not be initialized. Please make sure the card works properly.",
            ),
            ResponseCode::FailPartition => Some(
                "The SD card's partition table appears to be corrupted. Please reformat the \
                 card and try again.",
            ),
            ResponseCode::FailFs => Some(
                "The SD card's filesystem appears to be corrupted. Please reformat the card \
                 as FAT16 and try again.",
            ),
            ResponseCode::FailRootDir => Some(
                "The root directory on the SD card could not be opened. Please check the card \
                 for errors.",
            ),
            ResponseCode::FailLocked => Some(
                "The SD card cannot be written to because it is locked. Remove the card, \
                 switch the lock off, and try again.",
            ),
            ResponseCode::FailNoFile => Some("The named build file was not found on the SD card."),
            ResponseCode::FailGeneric => Some("An unknown SD card error occurred."),
        }
    }
}

/// Host-side file capture: redirects the command stream into a file on this
/// machine instead of executing it.
pub trait FileCapture {
    /// Start capturing to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture file cannot be created.
    fn begin_file_capture(&mut self, path: &Path) -> Result<(), DriverError>;

    /// Finish the capture and flush the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture cannot be finalized.
    fn end_file_capture(&mut self) -> Result<(), DriverError>;
}

/// On-device storage capture and playback.
pub trait SdCapture {
    /// Start capturing the command stream to the named file on the device's
    /// own storage.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures; device-level refusals
    /// come back as a non-`Success` [`ResponseCode`].
    fn begin_capture(&mut self, name: &str) -> Result<ResponseCode, DriverError>;

    /// Finish the capture, returning the number of bytes written on the
    /// device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot finalize the capture.
    fn end_capture(&mut self) -> Result<u64, DriverError>;

    /// Ask the device to replay a previously captured file from its own
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures.
    fn playback(&mut self, name: &str) -> Result<ResponseCode, DriverError>;
}

/// Drivers that own a serial port which must be released on detach.
pub trait SerialPortOwner {
    /// Release the serial port, if one is held.
    fn release_serial(&mut self);
}

/// Read-only access to parameters stored on the device itself.
pub trait OnboardParameters {
    /// The machine name stored on the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    fn machine_name(&mut self) -> Result<String, DriverError>;
}

/// Read-back of an accumulated build-time estimate, offered by estimation
/// and simulation drivers.
pub trait BuildEstimator {
    /// The estimated wall-clock duration of everything executed so far.
    fn estimated_build_time(&self) -> Duration;
}

/// The core device driver interface.
///
/// Exactly one command executes against a driver at a time; the machine
/// worker guarantees this. Commands reach the device through [`execute`],
/// which may raise [`CommandFault::Retry`] when the device's buffer is full
/// or a [`CommandFault::Stop`] when the program raises a halt.
///
/// [`execute`]: Driver::execute
pub trait Driver: Send {
    /// Bring the connection to the device up.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached or identified.
    fn initialize(&mut self) -> Result<(), DriverError>;

    /// Tear the connection down. Safe to call when not initialized.
    fn uninitialize(&mut self);

    /// Whether the driver currently holds a live, initialized connection.
    fn is_initialized(&self) -> bool;

    /// Release every resource the driver holds. The driver is unusable
    /// afterwards.
    fn dispose(&mut self) {
        self.uninitialize();
    }

    /// Reset the device to a known state.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the reset.
    fn reset(&mut self) -> Result<(), DriverError>;

    /// Stop the device; `hard` also clears the device-side command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop cannot be delivered.
    fn stop(&mut self, hard: bool) -> Result<(), DriverError>;

    /// Pause execution on the device itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the pause cannot be delivered.
    fn pause(&mut self) -> Result<(), DriverError>;

    /// Resume execution on the device itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the resume cannot be delivered.
    fn unpause(&mut self) -> Result<(), DriverError>;

    /// Whether the device has drained everything submitted to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    fn is_finished(&mut self) -> Result<bool, DriverError>;

    /// Surface any asynchronous device-side errors.
    ///
    /// # Errors
    ///
    /// Returns the pending device fault, if one is latched.
    fn check_errors(&mut self) -> Result<(), DriverError>;

    /// The command sink: submit one parsed command line to the device.
    ///
    /// # Errors
    ///
    /// Raises [`CommandFault::Retry`] when the device cannot accept the
    /// command yet, [`CommandFault::Stop`] for program-raised halts, and
    /// [`CommandFault::Driver`] for transport failures.
    fn execute(&mut self, line: &str) -> Result<(), CommandFault>;

    /// Ask the device where its toolhead currently is.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    fn current_position(&mut self) -> Result<Position, DriverError>;

    /// Forget any cached position; the next query goes to the device.
    fn invalidate_position(&mut self);

    /// Read the current tool and platform temperatures.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    fn read_temperature(&mut self) -> Result<Temperatures, DriverError>;

    /// Set the target temperature of the active tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    fn set_tool_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError>;

    /// Set the target temperature of the build platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    fn set_platform_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError>;

    /// Probe for host-side file capture support.
    fn as_file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        None
    }

    /// Probe for on-device storage capture support.
    fn as_sd_capture(&mut self) -> Option<&mut dyn SdCapture> {
        None
    }

    /// Probe for serial-port ownership.
    fn as_serial_port_owner(&mut self) -> Option<&mut dyn SerialPortOwner> {
        None
    }

    /// Probe for onboard parameter access.
    fn as_onboard_parameters(&mut self) -> Option<&mut dyn OnboardParameters> {
        None
    }

    /// Probe for a build-time estimator.
    fn as_estimator(&self) -> Option<&dyn BuildEstimator> {
        None
    }
}

/// Creates drivers from the opaque `driver` subtree of the machine
/// configuration.
///
/// This is the dependency-injection seam for hardware, in the same spirit
/// as swapping real transports for doubles when testing off-machine.
pub trait DriverFactory: Send + Sync {
    /// Build the main device driver from its configuration subtree.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration names an unknown transport or
    /// the transport cannot be constructed.
    fn driver(&self, config: &serde_json::Value) -> Result<Box<dyn Driver>, DriverError>;

    /// Build the simulator driver, if this factory offers one.
    fn simulator(&self) -> Option<Box<dyn Driver>> {
        None
    }
}

/// A driver that accepts commands and updates an internal geometry and
/// temperature model without touching hardware.
///
/// Doubles as the config-selected simulator stream and as the device for
/// the demo binary. Keeps a history of every executed line and a coarse
/// wall-clock estimate, so it also backs `estimate()`.
#[derive(Debug)]
pub struct SimulatorDriver {
    initialized: bool,
    executed: Vec<String>,
    position: Position,
    position_known: bool,
    temperatures: Temperatures,
    estimate: Duration,
}

/// Cost model for lines with no explicit duration of their own.
const SIMULATED_LINE_TIME: Duration = Duration::from_millis(50);

impl SimulatorDriver {
    /// Construct a cold, unattached simulator.
    #[must_use]
    pub fn new() -> SimulatorDriver {
        SimulatorDriver {
            initialized: false,
            executed: Vec::new(),
            position: Position::origin(),
            position_known: false,
            temperatures: Temperatures::cold(),
            estimate: Duration::ZERO,
        }
    }

    /// Every line executed so far, in order.
    #[must_use]
    pub fn history(&self) -> &[String] {
        &self.executed
    }

    /// Extract the numeric argument of a word like `X10.5` from a line.
    fn word(line: &str, letter: char) -> Option<f64> {
        line.split_whitespace()
            .filter_map(|w| w.strip_prefix(letter))
            .find_map(|rest| rest.parse().ok())
    }

    fn apply(&mut self, line: &str) {
        if line.starts_with("G0") || line.starts_with("G1") {
            if let Some(x) = SimulatorDriver::word(line, 'X') {
                self.position.x = x;
            }
            if let Some(y) = SimulatorDriver::word(line, 'Y') {
                self.position.y = y;
            }
            if let Some(z) = SimulatorDriver::word(line, 'Z') {
                self.position.z = z;
            }
            self.position_known = true;
        } else if line.starts_with("G4") {
            if let Some(ms) = SimulatorDriver::word(line, 'P') {
                self.estimate += Duration::from_millis(ms.max(0.0) as u64);
            }
        } else if line.starts_with("M104") {
            if let Some(s) = SimulatorDriver::word(line, 'S') {
                self.temperatures.tool_target = s;
                self.temperatures.tool = s;
            }
        } else if line.starts_with("M140") {
            if let Some(s) = SimulatorDriver::word(line, 'S') {
                self.temperatures.platform_target = s;
                self.temperatures.platform = s;
            }
        }
        self.estimate += SIMULATED_LINE_TIME;
    }
}

impl Default for SimulatorDriver {
    fn default() -> Self {
        SimulatorDriver::new()
    }
}

impl Driver for SimulatorDriver {
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = true;
        Ok(())
    }

    fn uninitialize(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        self.position = Position::origin();
        self.position_known = true;
        self.temperatures = Temperatures::cold();
        Ok(())
    }

    fn stop(&mut self, _hard: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn is_finished(&mut self) -> Result<bool, DriverError> {
        Ok(true)
    }

    fn check_errors(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn execute(&mut self, line: &str) -> Result<(), CommandFault> {
        self.apply(line);
        self.executed.push(line.to_owned());
        Ok(())
    }

    fn current_position(&mut self) -> Result<Position, DriverError> {
        Ok(self.position)
    }

    fn invalidate_position(&mut self) {
        self.position_known = false;
    }

    fn read_temperature(&mut self) -> Result<Temperatures, DriverError> {
        Ok(self.temperatures)
    }

    fn set_tool_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
        self.temperatures.tool_target = celsius;
        Ok(())
    }

    fn set_platform_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
        self.temperatures.platform_target = celsius;
        Ok(())
    }

    fn as_estimator(&self) -> Option<&dyn BuildEstimator> {
        Some(self)
    }
}

impl BuildEstimator for SimulatorDriver {
    fn estimated_build_time(&self) -> Duration {
        self.estimate
    }
}

#[cfg(test)]
/// Scripted driver doubles for exercising the worker and pipeline.
pub mod testing {
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::{Arc, Mutex},
        thread::sleep,
        time::Duration,
    };

    use super::*;
    use crate::command::StopKind;

    #[derive(Clone, Copy, Debug)]
    /// One scripted outcome for an `execute` call.
    pub enum ExecOutcome {
        Ok,
        Retry,
        Stop(StopKind),
        Fail,
    }

    #[derive(Debug, Default)]
    /// Everything a scripted driver records, shared with the test thread.
    pub struct DriverLog {
        pub executed: Vec<String>,
        pub execute_calls: usize,
        pub initialized: bool,
        pub init_calls: usize,
        pub pause_calls: usize,
        pub unpause_calls: usize,
        pub stop_calls: Vec<bool>,
        pub reset_calls: usize,
        pub tool_target: f64,
        pub platform_target: f64,
        pub position_invalidated: usize,
        pub captures_begun: Vec<String>,
        pub captures_ended: usize,
        pub file_captures_begun: Vec<PathBuf>,
        pub file_captures_ended: usize,
        pub playbacks: Vec<String>,
        pub serial_released: usize,
    }

    /// A driver whose `execute` outcomes are scripted per call, recording
    /// everything that happens to it. The log handle is shared so tests can
    /// inspect it while the worker owns the driver.
    pub struct ScriptedDriver {
        pub(crate) log: Arc<Mutex<DriverLog>>,
        pub(crate) script: Arc<Mutex<VecDeque<ExecOutcome>>>,
        pub init_ok: bool,
        pub execute_delay: Duration,
        pub sd_begin: ResponseCode,
        pub sd_playback: ResponseCode,
        pub finished: Arc<Mutex<bool>>,
    }

    impl Default for ScriptedDriver {
        fn default() -> Self {
            ScriptedDriver {
                log: Arc::default(),
                script: Arc::default(),
                init_ok: true,
                execute_delay: Duration::ZERO,
                sd_begin: ResponseCode::Success,
                sd_playback: ResponseCode::Success,
                finished: Arc::new(Mutex::new(true)),
            }
        }
    }

    impl ScriptedDriver {
        /// A handle to the shared log for later inspection.
        pub fn log_handle(&self) -> Arc<Mutex<DriverLog>> {
            Arc::clone(&self.log)
        }

        /// A locked snapshot of the log, for single-threaded tests.
        pub fn log(&self) -> std::sync::MutexGuard<'_, DriverLog> {
            self.log.lock().unwrap()
        }

        /// Script the outcomes of the next `execute` calls, in order. Calls
        /// beyond the script succeed.
        pub fn script(&self, outcomes: impl IntoIterator<Item = ExecOutcome>) {
            self.script.lock().unwrap().extend(outcomes);
        }
    }

    impl Driver for ScriptedDriver {
        fn initialize(&mut self) -> Result<(), DriverError> {
            let mut log = self.log.lock().unwrap();
            log.init_calls += 1;
            if self.init_ok {
                log.initialized = true;
                Ok(())
            } else {
                Err(DriverError::Device("scripted initialize failure".into()))
            }
        }

        fn uninitialize(&mut self) {
            self.log.lock().unwrap().initialized = false;
        }

        fn is_initialized(&self) -> bool {
            self.log.lock().unwrap().initialized
        }

        fn reset(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().reset_calls += 1;
            Ok(())
        }

        fn stop(&mut self, hard: bool) -> Result<(), DriverError> {
            self.log.lock().unwrap().stop_calls.push(hard);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().pause_calls += 1;
            Ok(())
        }

        fn unpause(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().unpause_calls += 1;
            Ok(())
        }

        fn is_finished(&mut self) -> Result<bool, DriverError> {
            Ok(*self.finished.lock().unwrap())
        }

        fn check_errors(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn execute(&mut self, line: &str) -> Result<(), CommandFault> {
            if !self.execute_delay.is_zero() {
                sleep(self.execute_delay);
            }
            self.log.lock().unwrap().execute_calls += 1;
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ExecOutcome::Ok);
            match outcome {
                ExecOutcome::Ok => {
                    self.log.lock().unwrap().executed.push(line.to_owned());
                    Ok(())
                }
                ExecOutcome::Retry => Err(CommandFault::Retry),
                ExecOutcome::Stop(kind) => Err(CommandFault::Stop {
                    kind,
                    message: format!("scripted {kind}"),
                }),
                ExecOutcome::Fail => Err(CommandFault::Driver(DriverError::Device(
                    "scripted execute failure".into(),
                ))),
            }
        }

        fn current_position(&mut self) -> Result<Position, DriverError> {
            Ok(Position::origin())
        }

        fn invalidate_position(&mut self) {
            self.log.lock().unwrap().position_invalidated += 1;
        }

        fn read_temperature(&mut self) -> Result<Temperatures, DriverError> {
            Ok(Temperatures::cold())
        }

        fn set_tool_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
            self.log.lock().unwrap().tool_target = celsius;
            Ok(())
        }

        fn set_platform_target_temperature(&mut self, celsius: f64) -> Result<(), DriverError> {
            self.log.lock().unwrap().platform_target = celsius;
            Ok(())
        }

        fn as_file_capture(&mut self) -> Option<&mut dyn FileCapture> {
            Some(self)
        }

        fn as_sd_capture(&mut self) -> Option<&mut dyn SdCapture> {
            Some(self)
        }

        fn as_serial_port_owner(&mut self) -> Option<&mut dyn SerialPortOwner> {
            Some(self)
        }

        fn as_onboard_parameters(&mut self) -> Option<&mut dyn OnboardParameters> {
            Some(self)
        }
    }

    impl FileCapture for ScriptedDriver {
        fn begin_file_capture(&mut self, path: &Path) -> Result<(), DriverError> {
            self.log
                .lock()
                .unwrap()
                .file_captures_begun
                .push(path.to_path_buf());
            Ok(())
        }

        fn end_file_capture(&mut self) -> Result<(), DriverError> {
            self.log.lock().unwrap().file_captures_ended += 1;
            Ok(())
        }
    }

    impl SdCapture for ScriptedDriver {
        fn begin_capture(&mut self, name: &str) -> Result<ResponseCode, DriverError> {
            self.log.lock().unwrap().captures_begun.push(name.to_owned());
            Ok(self.sd_begin)
        }

        fn end_capture(&mut self) -> Result<u64, DriverError> {
            let mut log = self.log.lock().unwrap();
            log.captures_ended += 1;
            Ok(log.executed.len() as u64 * 16)
        }

        fn playback(&mut self, name: &str) -> Result<ResponseCode, DriverError> {
            self.log.lock().unwrap().playbacks.push(name.to_owned());
            Ok(self.sd_playback)
        }
    }

    impl SerialPortOwner for ScriptedDriver {
        fn release_serial(&mut self) {
            self.log.lock().unwrap().serial_released += 1;
        }
    }

    impl OnboardParameters for ScriptedDriver {
        fn machine_name(&mut self) -> Result<String, DriverError> {
            Ok("scripted machine".to_owned())
        }
    }
}
