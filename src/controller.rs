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

//! The machine controller: the public command surface, and the state shared
//! between callers and the machine worker.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    command::{Command, LineParserFactory, ParserFactory, ParserTarget},
    config::{self, MachineConfig, Preferences},
    driver::{Driver, DriverError, DriverFactory},
    event::{ListenerSet, MachineEvent, MachineListener},
    prompt::{SilentPrompt, UserPrompt},
    request::{JobRequest, JobTarget, RequestQueue},
    source::{self, GCodeSource, StringSource},
    state::{self, MachineState, Phase, StateCell},
    worker::MachineWorker,
};

/// How long `disconnect` and `dispose` wait for the worker to react.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
/// The set of errors the controller surface can report.
pub enum ControllerError {
    /// The configuration was invalid.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The driver factory or a driver operation failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The machine state could not be read.
    #[error(transparent)]
    State(#[from] state::Error),
    /// A G-code source could not be read.
    #[error(transparent)]
    Source(#[from] source::Error),
    /// The requested operation is not implemented.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    /// A build was requested before any G-code source was set.
    #[error("no G-code source has been set")]
    NoSource,
    /// The worker thread could not be spawned.
    #[error("failed to spawn machine worker: {0}")]
    Spawn(std::io::Error),
    /// The command line was malformed.
    #[error("{0}")]
    Args(&'static str),
}

/// Everything shared between the controller surface, the worker, and the
/// pipeline.
///
/// The worker exclusively drives the machine, but external helpers read the
/// driver under the same mutex; they must tolerate a driver that is absent
/// or uninitialized across reconnect cycles.
pub(crate) struct Shared {
    pub state: StateCell,
    pub requests: RequestQueue,
    pub listeners: ListenerSet,
    pub driver: Mutex<Option<Box<dyn Driver>>>,
    pub simulator: Mutex<Option<Box<dyn Driver>>>,
    pub prompt: Arc<dyn UserPrompt>,
    pub parsers: Arc<dyn ParserFactory>,
    pub prefs: Preferences,
    pub warmup: StringSource,
    pub cooldown: StringSource,
    current_source: Mutex<Option<Arc<dyn GCodeSource>>>,
    target: Mutex<JobTarget>,
    machine_name: Mutex<Option<String>>,
    estimated_build_time: Mutex<Option<Duration>>,
    lines_processed: AtomicU64,
    lines_total: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    /// Whether the worker should keep serving requests.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tell the worker to wind down, and wake it so it notices.
    pub fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.state.wake();
    }

    /// Enqueue a request and wake the worker. Never blocks.
    pub fn schedule(&self, request: JobRequest) {
        debug!(request = %request, "scheduling request");
        self.requests.push(request);
        self.state.wake();
    }

    /// Whether any request is waiting to be drained.
    pub fn requests_pending(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Move the machine to `phase`, emitting a state-change event on
    /// success. Refused transitions are logged, not fatal; repeats are
    /// silent no-ops.
    pub fn transition(&self, phase: Phase) -> bool {
        match self.state.set_phase(phase) {
            Ok(Some((prev, current))) => {
                info!(from = ?prev.phase(), to = ?current.phase(), "machine state changed");
                self.emit(&MachineEvent::StateChange { prev, current });
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("refused state change: {e}");
                false
            }
        }
    }

    /// Flip the pause flag, emitting a state-change event on success.
    pub fn set_paused(&self, paused: bool) -> bool {
        match self.state.set_paused(paused) {
            Ok(Some((prev, current))) => {
                self.emit(&MachineEvent::StateChange { prev, current });
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("refused pause change: {e}");
                false
            }
        }
    }

    /// Deliver an event to every registered listener.
    pub fn emit(&self, event: &MachineEvent) {
        self.listeners.emit(event);
    }

    /// Run `f` against the live driver under the controller-level mutex.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::NotAttached` when no driver is present and
    /// `DriverError::Poison` when the lock is poisoned, besides whatever
    /// `f` itself reports.
    pub fn with_driver<R>(
        &self,
        f: impl FnOnce(&mut dyn Driver) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut guard = self.driver.lock().map_err(|_| DriverError::Poison)?;
        match guard.as_deref_mut() {
            Some(driver) => f(driver),
            None => Err(DriverError::NotAttached),
        }
    }

    /// Run `f` against the simulator driver, if one is attached.
    ///
    /// # Errors
    ///
    /// Same contract as [`with_driver`](Shared::with_driver).
    pub fn with_simulator<R>(
        &self,
        f: impl FnOnce(&mut dyn Driver) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut guard = self.simulator.lock().map_err(|_| DriverError::Poison)?;
        match guard.as_deref_mut() {
            Some(driver) => f(driver),
            None => Err(DriverError::NotAttached),
        }
    }

    /// Whether a simulator driver is attached.
    pub fn has_simulator(&self) -> bool {
        self.simulator
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// The target of the job currently in flight.
    pub fn current_target(&self) -> JobTarget {
        self.target
            .lock()
            .map(|guard| *guard)
            .unwrap_or(JobTarget::None)
    }

    /// Record the target of the job now in flight.
    pub fn set_target(&self, target: JobTarget) {
        if let Ok(mut guard) = self.target.lock() {
            *guard = target;
        }
    }

    /// Remember the name the device reported for itself.
    pub fn set_machine_name(&self, name: Option<String>) {
        if let Ok(mut guard) = self.machine_name.lock() {
            *guard = name;
        }
    }

    /// The cached build-time estimate, if one has been taken.
    pub fn estimated_total(&self) -> Option<Duration> {
        self.estimated_build_time
            .lock()
            .ok()
            .and_then(|guard| *guard)
    }

    /// Reset the progress counters at the start of a build.
    pub fn set_line_counts(&self, processed: u64, total: u64) {
        self.lines_processed.store(processed, Ordering::SeqCst);
        self.lines_total.store(total, Ordering::SeqCst);
    }

    /// Count one consumed source line.
    pub fn count_line(&self) {
        self.lines_processed.fetch_add(1, Ordering::SeqCst);
    }

    /// The progress counters as `(processed, total)`.
    pub fn line_counts(&self) -> (u64, u64) {
        (
            self.lines_processed.load(Ordering::SeqCst),
            self.lines_total.load(Ordering::SeqCst),
        )
    }
}

/// A single-machine build controller.
///
/// Owns the device and simulator drivers, one worker thread, and the
/// listener list. All command methods are non-blocking unless noted: they
/// enqueue a request and return; effects land when the worker drains the
/// queue, no later than the next line boundary of an in-flight build.
pub struct MachineController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: MachineConfig,
}

impl MachineController {
    /// Construct a controller with the default line parser and the headless
    /// prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver factory rejects the configuration or
    /// the worker thread cannot be spawned.
    pub fn new(
        config: MachineConfig,
        factory: &dyn DriverFactory,
    ) -> Result<MachineController, ControllerError> {
        MachineController::with_collaborators(
            config,
            factory,
            Arc::new(LineParserFactory),
            Arc::new(SilentPrompt),
        )
    }

    /// Construct a controller with explicit parser and prompt collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver factory rejects the configuration or
    /// the worker thread cannot be spawned.
    pub fn with_collaborators(
        config: MachineConfig,
        factory: &dyn DriverFactory,
        parsers: Arc<dyn ParserFactory>,
        prompt: Arc<dyn UserPrompt>,
    ) -> Result<MachineController, ControllerError> {
        let driver = factory.driver(&config.driver)?;
        let simulator = if config.preferences.simulator {
            factory.simulator()
        } else {
            None
        };

        let shared = Arc::new(Shared {
            state: StateCell::new(),
            requests: RequestQueue::new(),
            listeners: ListenerSet::new(),
            driver: Mutex::new(Some(driver)),
            simulator: Mutex::new(simulator),
            prompt,
            parsers,
            prefs: config.preferences,
            warmup: config.warmup_source(),
            cooldown: config.cooldown_source(),
            current_source: Mutex::new(None),
            target: Mutex::new(JobTarget::None),
            machine_name: Mutex::new(None),
            estimated_build_time: Mutex::new(None),
            lines_processed: AtomicU64::new(0),
            lines_total: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let worker = MachineWorker::spawn(Arc::clone(&shared), &config.name)
            .map_err(ControllerError::Spawn)?;

        Ok(MachineController {
            shared,
            worker: Mutex::new(Some(worker)),
            config,
        })
    }

    /// Attach and initialize the device. Re-creates the worker if a
    /// previous `dispose` terminated it.
    ///
    /// # Errors
    ///
    /// Returns an error only if a replacement worker cannot be spawned.
    pub fn connect(&self) -> Result<(), ControllerError> {
        self.ensure_worker()?;
        self.shared.schedule(JobRequest::Connect);
        Ok(())
    }

    /// Detach from the device, releasing its serial port. Blocks until the
    /// worker has carried the detach out (bounded by a grace period).
    ///
    /// # Errors
    ///
    /// Returns an error if the machine state cannot be read back.
    pub fn disconnect(&self) -> Result<(), ControllerError> {
        self.shared.schedule(JobRequest::Disconnect);
        let state = self
            .shared
            .state
            .wait_while(SHUTDOWN_GRACE, |s| s.is_connected())?;
        if state.is_connected() {
            warn!("worker did not detach within the grace period");
        }
        Ok(())
    }

    /// Return the device to a known state.
    pub fn reset(&self) {
        self.shared.schedule(JobRequest::Reset);
    }

    /// Pause the in-flight build, down to the device.
    pub fn pause(&self) {
        self.shared.schedule(JobRequest::Pause);
    }

    /// Resume a paused build.
    pub fn unpause(&self) {
        self.shared.schedule(JobRequest::Unpause);
    }

    /// Stop the in-flight build and let the device cool.
    pub fn stop(&self) {
        self.shared.schedule(JobRequest::Stop);
    }

    /// Build the current G-code source directly on the device.
    ///
    /// # Errors
    ///
    /// Returns `NoSource` if no source has been set.
    pub fn execute(&self) -> Result<(), ControllerError> {
        let source = self.current_source().ok_or(ControllerError::NoSource)?;
        self.shared.schedule(JobRequest::BuildDirect { source });
        Ok(())
    }

    /// Build the current G-code source against the simulator only.
    ///
    /// # Errors
    ///
    /// Returns `NoSource` if no source has been set, and `Unimplemented` if
    /// no simulator driver is attached.
    pub fn simulate(&self) -> Result<(), ControllerError> {
        if !self.shared.has_simulator() {
            return Err(ControllerError::Unimplemented(
                "simulation without a simulator driver",
            ));
        }
        let source = self.current_source().ok_or(ControllerError::NoSource)?;
        self.shared.schedule(JobRequest::Simulate { source });
        Ok(())
    }

    /// Capture the current source onto the device's own storage under
    /// `remote_name`.
    ///
    /// # Errors
    ///
    /// Returns `NoSource` if no source has been set.
    pub fn upload(&self, remote_name: &str) -> Result<(), ControllerError> {
        let source = self.current_source().ok_or(ControllerError::NoSource)?;
        self.shared.schedule(JobRequest::BuildToRemoteFile {
            source,
            remote_name: remote_name.to_owned(),
        });
        Ok(())
    }

    /// Replay a previously captured build from the device's storage.
    pub fn build_remote(&self, remote_name: &str) {
        self.shared.schedule(JobRequest::BuildRemote {
            remote_name: remote_name.to_owned(),
        });
    }

    /// Walk away from a remote build, leaving the machine to finish on its
    /// own; any other kind of build is stopped instead. Either way the
    /// worker winds down.
    pub fn disconnect_remote_build(&self) {
        self.shared.schedule(JobRequest::DisconnectRemoteBuild);
    }

    /// Capture the current source into a file on the host.
    ///
    /// # Errors
    ///
    /// Always returns `Unimplemented`. TODO: wire this to the file-capture
    /// pipeline path once a capture driver ships host-file support.
    pub fn build_to_file(&self, _path: &Path) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented(
            "building to an on-host file",
        ))
    }

    /// Execute a single ad-hoc command against the driver, retrying while
    /// the device asks for it and swallowing stop conditions.
    pub fn run_command(&self, command: Box<dyn Command>) {
        self.shared.schedule(JobRequest::RunCommand { command });
    }

    /// Select the G-code source that `execute`, `simulate`, `upload`, and
    /// `estimate` operate on. Invalidates any cached estimate.
    pub fn set_code_source(&self, source: Arc<dyn GCodeSource>) {
        if let Ok(mut guard) = self.shared.current_source.lock() {
            *guard = Some(source);
        }
        if let Ok(mut guard) = self.shared.estimated_build_time.lock() {
            *guard = None;
        }
    }

    /// Estimate the build time of the current source by replaying it
    /// against the simulator driver. The result is cached and reported in
    /// progress events.
    ///
    /// # Errors
    ///
    /// Returns `NoSource` if no source has been set and `Unimplemented` if
    /// no simulator driver (or no estimator capability) is attached.
    pub fn estimate(&self) -> Result<Duration, ControllerError> {
        let source = self.current_source().ok_or(ControllerError::NoSource)?;

        let mut guard = self
            .shared
            .simulator
            .lock()
            .map_err(|_| DriverError::Poison)?;
        let simulator = guard.as_deref_mut().ok_or(ControllerError::Unimplemented(
            "estimation without a simulator driver",
        ))?;

        let before = simulator
            .as_estimator()
            .ok_or(ControllerError::Unimplemented(
                "estimation with this simulator driver",
            ))?
            .estimated_build_time();

        let mut parser = self.shared.parsers.parser(ParserTarget::Simulator);
        let mut queue: VecDeque<Box<dyn Command>> = VecDeque::new();
        for segment in [
            &self.shared.warmup as &dyn GCodeSource,
            source.as_ref(),
            &self.shared.cooldown,
        ] {
            for line in segment.lines()? {
                let line = line.map_err(source::Error::Io)?;
                parser.parse(&line, &mut queue);
                while let Some(mut command) = queue.pop_front() {
                    // estimation ignores retry and stop semantics
                    let _ = command.run(&mut *simulator);
                }
            }
        }

        let after = simulator
            .as_estimator()
            .ok_or(ControllerError::Unimplemented(
                "estimation with this simulator driver",
            ))?
            .estimated_build_time();
        drop(guard);

        let estimate = after.saturating_sub(before);
        if let Ok(mut cached) = self.shared.estimated_build_time.lock() {
            *cached = Some(estimate);
        }
        Ok(estimate)
    }

    /// A snapshot of the current machine state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn machine_state(&self) -> Result<MachineState, state::Error> {
        self.shared.state.snapshot()
    }

    /// The configured name of this machine.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The name the device reported for itself, if it has been read.
    #[must_use]
    pub fn machine_name(&self) -> Option<String> {
        self.shared
            .machine_name
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// The configuration this controller was built from.
    #[must_use]
    pub fn model(&self) -> &MachineConfig {
        &self.config
    }

    /// Lines processed by the build currently (or most recently) in flight.
    #[must_use]
    pub fn lines_processed(&self) -> u64 {
        self.shared.line_counts().0
    }

    /// Whether a simulator-only build is in flight.
    #[must_use]
    pub fn is_simulating(&self) -> bool {
        let building = self
            .machine_state()
            .map(|s| s.is_building())
            .unwrap_or(false);
        building && self.shared.current_target() == JobTarget::Simulator
    }

    /// Whether the current job streams commands interactively rather than
    /// into a capture.
    #[must_use]
    pub fn is_interactive_target(&self) -> bool {
        matches!(
            self.shared.current_target(),
            JobTarget::Machine | JobTarget::Simulator
        )
    }

    /// Whether the driver holds a live, initialized connection. Tolerates
    /// the driver being absent mid-reconnect.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared
            .with_driver(|d| Ok(d.is_initialized()))
            .unwrap_or(false)
    }

    /// Whether the in-flight build is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.machine_state().map(|s| s.is_paused()).unwrap_or(false)
    }

    /// Run `f` with the live driver, or `None` if no driver is attached.
    pub fn with_driver<R>(&self, f: impl FnOnce(Option<&mut dyn Driver>) -> R) -> R {
        let mut guard = match self.shared.driver.lock() {
            Ok(guard) => guard,
            Err(_) => return f(None),
        };
        match guard.as_deref_mut() {
            Some(driver) => f(Some(driver)),
            None => f(None),
        }
    }

    /// Run `f` with the simulator driver, or `None` if there is none.
    pub fn with_simulator_driver<R>(&self, f: impl FnOnce(Option<&mut dyn Driver>) -> R) -> R {
        let mut guard = match self.shared.simulator.lock() {
            Ok(guard) => guard,
            Err(_) => return f(None),
        };
        match guard.as_deref_mut() {
            Some(driver) => f(Some(driver)),
            None => f(None),
        }
    }

    /// Register a listener. It immediately receives a current-state event.
    pub fn add_machine_state_listener(&self, listener: Arc<dyn MachineListener>) {
        let current = self.machine_state().unwrap_or_default();
        self.shared.listeners.add(listener, current);
    }

    /// Remove a previously registered listener.
    pub fn remove_machine_state_listener(&self, listener: &Arc<dyn MachineListener>) {
        self.shared.listeners.remove(listener);
    }

    /// Shut the worker down and release the drivers. Blocks up to a grace
    /// period while the worker winds down; `connect` revives the controller
    /// afterwards with a fresh worker.
    pub fn dispose(&self) {
        let worker_alive = self
            .worker
            .lock()
            .ok()
            .is_some_and(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()));
        if worker_alive {
            self.shared.schedule(JobRequest::Terminate);
        }

        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                self.shared.state.wake();
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("machine worker did not stop within the grace period");
            }
        }
        self.shared.stop_running();

        let _ = self.shared.with_driver(|d| {
            d.dispose();
            Ok(())
        });
        let _ = self.shared.with_simulator(|d| {
            d.dispose();
            Ok(())
        });
        self.shared.transition(Phase::NotAttached);
    }

    fn current_source(&self) -> Option<Arc<dyn GCodeSource>> {
        self.shared
            .current_source
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Respawn the worker if a previous `dispose` terminated it.
    fn ensure_worker(&self) -> Result<(), ControllerError> {
        let Ok(mut guard) = self.worker.lock() else {
            return Ok(());
        };
        let dead = guard.as_ref().map_or(true, JoinHandle::is_finished);
        if dead {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
            self.shared.running.store(true, Ordering::SeqCst);
            *guard = Some(
                MachineWorker::spawn(Arc::clone(&self.shared), &self.config.name)
                    .map_err(ControllerError::Spawn)?,
            );
            debug!("machine worker re-created");
        }
        Ok(())
    }
}

impl Drop for MachineController {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;
    use crate::{
        command::{LineCommand, StopKind},
        driver::testing::{ExecOutcome, ScriptedDriver},
        driver::{ResponseCode, SimulatorDriver},
        event::testing::RecordingListener,
        prompt::testing::ScriptedPrompt,
    };

    /// A factory that hands out pre-built doubles.
    struct TestFactory {
        driver: Mutex<Option<Box<dyn Driver>>>,
        simulator: Mutex<Option<Box<dyn Driver>>>,
    }

    impl TestFactory {
        fn new(driver: ScriptedDriver) -> TestFactory {
            TestFactory {
                driver: Mutex::new(Some(Box::new(driver))),
                simulator: Mutex::new(None),
            }
        }

        fn with_simulator(driver: ScriptedDriver, simulator: Box<dyn Driver>) -> TestFactory {
            TestFactory {
                driver: Mutex::new(Some(Box::new(driver))),
                simulator: Mutex::new(Some(simulator)),
            }
        }
    }

    impl DriverFactory for TestFactory {
        fn driver(&self, _config: &serde_json::Value) -> Result<Box<dyn Driver>, DriverError> {
            self.driver
                .lock()
                .unwrap()
                .take()
                .ok_or(DriverError::NotAttached)
        }

        fn simulator(&self) -> Option<Box<dyn Driver>> {
            self.simulator.lock().unwrap().take()
        }
    }

    fn config(warmup: &str, cooldown: &str) -> MachineConfig {
        MachineConfig {
            name: "test machine".into(),
            driver: serde_json::Value::Null,
            warmup: if warmup.is_empty() {
                None
            } else {
                Some(warmup.into())
            },
            cooldown: if cooldown.is_empty() {
                None
            } else {
                Some(cooldown.into())
            },
            preferences: Preferences::default(),
        }
    }

    fn sim_config(warmup: &str, cooldown: &str, show_simulator: bool) -> MachineConfig {
        let mut config = config(warmup, cooldown);
        config.preferences.simulator = true;
        config.preferences.show_simulator = show_simulator;
        config
    }

    /// Spin up a controller around a scripted driver, with a recording
    /// listener attached and a scripted prompt answering `answer`.
    fn harness(
        config: MachineConfig,
        factory: &TestFactory,
        answer: bool,
    ) -> (
        MachineController,
        Arc<RecordingListener>,
        Arc<ScriptedPrompt>,
    ) {
        let prompt = Arc::new(ScriptedPrompt::answering(answer));
        let controller = MachineController::with_collaborators(
            config,
            factory,
            Arc::new(LineParserFactory),
            Arc::clone(&prompt) as Arc<dyn UserPrompt>,
        )
        .unwrap();
        let listener = Arc::new(RecordingListener::default());
        controller.add_machine_state_listener(Arc::clone(&listener) as Arc<dyn MachineListener>);
        (controller, listener, prompt)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn connect_and_wait(controller: &MachineController) {
        controller.connect().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready()
        }));
    }

    fn numbered_source(count: usize) -> Arc<StringSource> {
        Arc::new(StringSource::from_lines(
            "job",
            (0..count).map(|i| format!("G1 X{i}")).collect(),
        ))
    }

    #[test]
    /// A full build streams warmup, source, and cooldown in order, counts
    /// every line, and settles back in ready.
    fn full_build_streams_segments() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, listener, _) = harness(config("M104 S200", "M104 S0"), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(Arc::new(StringSource::from_block(
            "job",
            "G1 X10\nG1 X20",
        )));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            log.lock().unwrap().executed.len() == 4
                && controller.machine_state().unwrap().is_ready()
        }));

        assert_eq!(
            log.lock().unwrap().executed,
            ["M104 S200", "G1 X10", "G1 X20", "M104 S0"]
        );
        assert_eq!(controller.lines_processed(), 4);
        assert_eq!(listener.progress_count(), 4);
        let last_progress = listener
            .events()
            .into_iter()
            .rev()
            .find_map(|e| match e {
                MachineEvent::Progress {
                    lines_processed,
                    lines_total,
                    ..
                } => Some((lines_processed, lines_total)),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_progress, (4, 4));
    }

    #[test]
    /// Pausing mid-build reaches the device exactly once, and no command is
    /// lost or duplicated across the pause.
    fn pause_resume_mid_build() {
        let driver = ScriptedDriver {
            execute_delay: Duration::from_millis(2),
            ..ScriptedDriver::default()
        };
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, listener, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(100));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            listener.progress_count() >= 10
        }));
        controller.pause();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.is_paused() && log.lock().unwrap().pause_calls == 1
        }));

        sleep(Duration::from_millis(200));
        let processed_while_paused = log.lock().unwrap().executed.len();
        sleep(Duration::from_millis(100));
        assert_eq!(log.lock().unwrap().executed.len(), processed_while_paused);

        controller.unpause();
        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().executed.len() == 100
                && controller.machine_state().unwrap().is_ready()
        }));

        let log = log.lock().unwrap();
        assert_eq!(log.pause_calls, 1);
        assert_eq!(log.unpause_calls, 1);
        let expected: Vec<String> = (0..100).map(|i| format!("G1 X{i}")).collect();
        assert_eq!(log.executed, expected);
    }

    #[test]
    /// Stopping a live build halts the device hard and re-checks the
    /// connection afterwards.
    fn stop_mid_build() {
        let driver = ScriptedDriver {
            execute_delay: Duration::from_millis(2),
            ..ScriptedDriver::default()
        };
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, listener, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(100));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            listener.progress_count() >= 10
        }));
        controller.stop();

        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready()
                && log.lock().unwrap().stop_calls.contains(&true)
        }));

        let log = log.lock().unwrap();
        assert!(log.stop_calls.contains(&true));
        assert_eq!(log.tool_target, 0.0);
        assert_eq!(log.platform_target, 0.0);
        assert!(listener.progress_count() < 100);
        // a stopped real build goes back through connecting to re-check the
        // device before resting
        let phases = listener.phases();
        assert!(phases.contains(&Phase::Stopping));
        assert!(phases
            .iter()
            .skip_while(|p| **p != Phase::Stopping)
            .any(|p| *p == Phase::Connecting));
    }

    #[test]
    /// An optional halt answered "no" ends the build cleanly without
    /// touching the remaining lines.
    fn optional_halt_declined() {
        let driver = ScriptedDriver::default();
        driver.script([
            ExecOutcome::Ok,
            ExecOutcome::Ok,
            ExecOutcome::Ok,
            ExecOutcome::Ok,
            ExecOutcome::Stop(StopKind::OptionalHalt),
        ]);
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, prompt) = harness(config("", ""), &factory, false);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(6));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready() && controller.lines_processed() == 5
        }));

        let log = log.lock().unwrap();
        assert_eq!(log.executed.len(), 4);
        assert!(prompt
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("optional halt")));
        assert_eq!(controller.lines_processed(), 5);
    }

    #[test]
    /// A command that asks for a retry is re-executed without consuming a
    /// new line, and the line is counted exactly once.
    fn retry_reissues_command() {
        let driver = ScriptedDriver::default();
        driver.script([ExecOutcome::Retry, ExecOutcome::Retry]);
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(Arc::new(StringSource::from_block(
            "job",
            "G1 X1\nG1 X2",
        )));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready()
                && log.lock().unwrap().executed.len() == 2
        }));

        let log = log.lock().unwrap();
        // line 1 was attempted three times, line 2 once
        assert_eq!(log.execute_calls, 4);
        assert_eq!(log.executed, ["G1 X1", "G1 X2"]);
        assert_eq!(controller.lines_processed(), 2);
    }

    #[test]
    /// A locked SD card refuses an upload: the user sees the fixed dialog,
    /// nothing is streamed, and the machine stops then settles in ready.
    fn locked_sd_card_refuses_upload() {
        let driver = ScriptedDriver {
            sd_begin: ResponseCode::FailLocked,
            ..ScriptedDriver::default()
        };
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, listener, prompt) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(3));
        controller.upload("x.s3g").unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            !log.lock().unwrap().captures_begun.is_empty()
                && controller.machine_state().unwrap().is_ready()
        }));

        let log = log.lock().unwrap();
        assert_eq!(log.captures_begun, ["x.s3g"]);
        assert_eq!(log.captures_ended, 0);
        assert!(log.executed.is_empty());
        assert!(prompt
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("locked")));
        assert!(listener.phases().contains(&Phase::Stopping));
    }

    #[test]
    /// A successful upload wraps the whole stream in begin/end capture.
    fn upload_captures_to_sd() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("M104 S200", ""), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(2));
        controller.upload("part.s3g").unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            log.lock().unwrap().captures_ended == 1
                && controller.machine_state().unwrap().is_ready()
        }));

        let log = log.lock().unwrap();
        assert_eq!(log.captures_begun, ["part.s3g"]);
        assert_eq!(log.executed, ["M104 S200", "G1 X0", "G1 X1"]);
    }

    #[test]
    /// With a simulator-only target the live driver receives no commands at
    /// all.
    fn simulator_build_touches_no_hardware() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let simulator = ScriptedDriver::default();
        let sim_log = simulator.log_handle();
        let factory = TestFactory::with_simulator(driver, Box::new(simulator));
        let (controller, _, _) = harness(sim_config("", "", false), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(5));
        controller.simulate().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            sim_log.lock().unwrap().executed.len() == 5
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready()
        }));

        assert!(log.lock().unwrap().executed.is_empty());
        assert_eq!(controller.lines_processed(), 5);
    }

    #[test]
    /// With a live target and the simulator shown, the simulator receives
    /// the same parsed stream as the device.
    fn live_build_mirrors_simulator() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let simulator = ScriptedDriver::default();
        let sim_log = simulator.log_handle();
        let factory = TestFactory::with_simulator(driver, Box::new(simulator));
        let (controller, _, _) = harness(sim_config("M104 S200", "M104 S0", true), &factory, true);

        connect_and_wait(&controller);
        controller.set_code_source(numbered_source(3));
        controller.execute().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            controller.machine_state().unwrap().is_ready()
                && log.lock().unwrap().executed.len() == 5
        }));

        assert_eq!(
            log.lock().unwrap().executed,
            sim_log.lock().unwrap().executed
        );
    }

    #[test]
    /// Repeated connects while attached are no-ops; the driver initializes
    /// once.
    fn repeated_connect_is_noop() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.connect().unwrap();
        controller.connect().unwrap();
        sleep(Duration::from_millis(100));

        assert_eq!(log.lock().unwrap().init_calls, 1);
        assert!(controller.machine_state().unwrap().is_ready());
    }

    #[test]
    /// Ad-hoc commands run against the driver from the ready state.
    fn run_command_executes() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.run_command(Box::new(LineCommand::new("M105")));

        assert!(wait_until(Duration::from_secs(2), || {
            log.lock().unwrap().executed == ["M105"]
        }));
    }

    #[test]
    /// Disconnecting releases the serial port and uninitializes the driver.
    fn disconnect_releases_serial() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        assert!(controller.is_initialized());

        controller.disconnect().unwrap();
        assert!(!controller.machine_state().unwrap().is_connected());
        assert!(!controller.is_initialized());
        assert!(log.lock().unwrap().serial_released >= 1);
    }

    #[test]
    /// The estimator replays the source against the simulator and caches
    /// the result.
    fn estimate_uses_simulator() {
        let driver = ScriptedDriver::default();
        let factory =
            TestFactory::with_simulator(driver, Box::new(SimulatorDriver::new()));
        let (controller, _, _) = harness(sim_config("", "", false), &factory, true);

        controller.set_code_source(Arc::new(StringSource::from_block(
            "job",
            "G1 X10\nG4 P2000\nG1 X20",
        )));
        let estimate = controller.estimate().unwrap();
        assert!(estimate >= Duration::from_secs(2));
    }

    #[test]
    /// The public file-capture surface is an explicit stub, but the
    /// pipeline path stays reachable through the request queue.
    fn file_capture_stub_and_queue_path() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        assert!(matches!(
            controller.build_to_file(Path::new("/tmp/out.gcode")),
            Err(ControllerError::Unimplemented(_))
        ));

        connect_and_wait(&controller);
        controller.shared.schedule(JobRequest::BuildToFile {
            source: numbered_source(2),
            path: "/tmp/out.gcode".into(),
        });

        assert!(wait_until(Duration::from_secs(2), || {
            log.lock().unwrap().file_captures_ended == 1
                && controller.machine_state().unwrap().is_ready()
        }));

        let log = log.lock().unwrap();
        assert_eq!(log.file_captures_begun.len(), 1);
        assert_eq!(log.executed, ["G1 X0", "G1 X1"]);
    }

    #[test]
    /// A remote build starts playback and polls the device until it
    /// reports completion.
    fn remote_build_polls_until_finished() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let finished = Arc::clone(&driver.finished);
        *finished.lock().unwrap() = false;
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.build_remote("part.s3g");

        assert!(wait_until(Duration::from_secs(2), || {
            !log.lock().unwrap().playbacks.is_empty()
        }));
        assert_eq!(
            controller.machine_state().unwrap().phase(),
            Phase::BuildingRemote
        );

        *finished.lock().unwrap() = true;
        assert!(wait_until(Duration::from_secs(3), || {
            controller.machine_state().unwrap().is_ready()
        }));
        assert_eq!(log.lock().unwrap().playbacks, ["part.s3g"]);
    }

    #[test]
    /// Walking away from a remote build leaves the machine in its remote
    /// phase and winds the worker down without halting the device.
    fn walk_away_from_remote_build() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let finished = Arc::clone(&driver.finished);
        *finished.lock().unwrap() = false;
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.build_remote("part.s3g");
        assert!(wait_until(Duration::from_secs(2), || {
            !log.lock().unwrap().playbacks.is_empty()
        }));

        controller.disconnect_remote_build();
        sleep(Duration::from_millis(200));

        // the machine keeps building from its own storage
        assert_eq!(
            controller.machine_state().unwrap().phase(),
            Phase::BuildingRemote
        );
        assert!(!log.lock().unwrap().stop_calls.contains(&true));
    }

    #[test]
    /// Dispose terminates the worker and a later connect revives the
    /// controller with a fresh one.
    fn dispose_then_reconnect() {
        let driver = ScriptedDriver::default();
        let log = driver.log_handle();
        let factory = TestFactory::new(driver);
        let (controller, _, _) = harness(config("", ""), &factory, true);

        connect_and_wait(&controller);
        controller.dispose();
        assert!(!controller.is_initialized());
        assert_eq!(
            controller.machine_state().unwrap().phase(),
            Phase::NotAttached
        );

        connect_and_wait(&controller);
        assert!(controller.is_initialized());
        assert!(log.lock().unwrap().init_calls >= 2);
    }
}
