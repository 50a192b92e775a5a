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

//! The machine worker: a dedicated thread that owns the drivers, drains
//! the request queue, and dispatches on the machine phase.

use std::{
    path::PathBuf,
    sync::Arc,
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    command::{Command, CommandFault},
    controller::Shared,
    pipeline::{build_remote, BuildError, BuildOutcome, BuildPipeline},
    request::{JobRequest, JobTarget},
    source::GCodeSource,
    state::Phase,
};

/// Tick length for the idle wait; any request or transition wakes the
/// worker sooner.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// Backoff between attempts of an ad-hoc command that keeps asking for a
/// retry.
const COMMAND_RETRY_TICK: Duration = Duration::from_millis(10);

/// Per-build bookkeeping owned by the worker thread.
pub(crate) struct BuildContext {
    /// The source the current (or next) build streams from.
    pub source: Option<Arc<dyn GCodeSource>>,
    /// Where the current job's commands go.
    pub target: JobTarget,
    /// The on-device file name for capture and playback jobs.
    pub remote_name: Option<String>,
    /// The host path for file-capture jobs.
    pub file_path: Option<PathBuf>,
    /// When the current build started.
    pub start: Option<Instant>,
    /// Whether periodic status polling runs during the build.
    pub polling_enabled: bool,
    /// How often status polling runs.
    pub poll_interval: Duration,
    /// When status was last polled.
    pub last_polled: Option<Instant>,
}

impl BuildContext {
    fn new() -> BuildContext {
        BuildContext {
            source: None,
            target: JobTarget::None,
            remote_name: None,
            file_path: None,
            start: None,
            polling_enabled: false,
            poll_interval: Duration::from_millis(1000),
            last_polled: None,
        }
    }

    /// Clear per-job fields once a build has ended, one way or another.
    fn finish_job(&mut self) {
        self.target = JobTarget::None;
        self.file_path = None;
        self.start = None;
        self.polling_enabled = false;
        self.last_polled = None;
    }
}

/// The per-controller worker. All request effects and all driver traffic
/// happen on this thread.
pub(crate) struct MachineWorker {
    shared: Arc<Shared>,
    ctx: BuildContext,
}

impl MachineWorker {
    /// Spawn the worker on its own named thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        machine_name: &str,
    ) -> std::io::Result<JoinHandle<()>> {
        Builder::new()
            .name(format!("{machine_name}-machine"))
            .spawn(move || {
                MachineWorker {
                    shared,
                    ctx: BuildContext::new(),
                }
                .run();
            })
    }

    fn run(mut self) {
        debug!("machine worker started");
        loop {
            drain_requests(&self.shared, &mut self.ctx);

            let state = match self.shared.state.snapshot() {
                Ok(state) => state,
                Err(e) => {
                    error!("machine state unreadable, worker exiting: {e}");
                    break;
                }
            };
            if !(self.shared.running() || state.phase() == Phase::Stopping) {
                break;
            }

            match state.phase() {
                Phase::Building => self.dispatch_build(),
                Phase::BuildingRemote => self.dispatch_remote(),
                Phase::Connecting => self.connect(),
                Phase::Stopping => self.halt(),
                Phase::Reset => self.reset(),
                Phase::NotAttached => {
                    self.release_serial();
                    self.idle();
                }
                Phase::Ready => self.idle(),
            }
        }
        debug!("machine worker exiting");
    }

    /// Wait for work, waking early on any request or transition.
    fn idle(&self) {
        if self.shared.requests_pending() || !self.shared.running() {
            return;
        }
        if let Err(e) = self.shared.state.wait(IDLE_TICK) {
            error!("idle wait failed: {e}");
        }
    }

    /// Run the host-driven build selected by the context and convert its
    /// outcome into a terminal phase.
    fn dispatch_build(&mut self) {
        let target = self.ctx.target;
        let result = BuildPipeline::new(&self.shared, &mut self.ctx).run();
        self.settle_build(target, result);
    }

    fn dispatch_remote(&mut self) {
        let result = build_remote(&self.shared, &mut self.ctx);
        self.settle_build(JobTarget::RemoteFile, result);
    }

    /// Convert a finished pipeline run into the machine's next phase:
    /// `Ready` for clean and simulated outcomes, `Connecting` after a
    /// failed or aborted real build so the device state gets re-checked.
    fn settle_build(&mut self, target: JobTarget, result: Result<BuildOutcome, BuildError>) {
        let real = matches!(
            target,
            JobTarget::Machine | JobTarget::RemoteFile | JobTarget::File
        );
        match result {
            Ok(BuildOutcome::Complete) => {
                info!("build complete");
                self.shared.transition(self.rest_phase());
            }
            Ok(BuildOutcome::PhaseChanged) => {
                // another phase owns the machine; the loop dispatches it
            }
            Err(BuildError::Aborted) => {
                info!("build aborted");
                let phase = self
                    .shared
                    .state
                    .snapshot()
                    .map(|s| s.phase())
                    .unwrap_or(Phase::Stopping);
                if phase == Phase::Reset {
                    // the reset branch takes it from here
                } else if real {
                    self.shared.transition(Phase::Connecting);
                } else {
                    self.shared.transition(self.rest_phase());
                }
            }
            Err(BuildError::Interrupted) => {
                info!("build interrupted by shutdown");
            }
            Err(BuildError::SdResponse(code)) => {
                warn!(?code, "on-device storage refused the build");
                self.shared.transition(Phase::Stopping);
            }
            Err(e) => {
                error!("build failed: {e}");
                if real {
                    self.shared.transition(Phase::Connecting);
                } else {
                    self.shared.transition(self.rest_phase());
                }
            }
        }
        self.ctx.finish_job();
        self.shared.set_target(JobTarget::None);
    }

    /// Where the machine comes to rest after a build: `Ready` when a live
    /// driver is attached, `NotAttached` after a detached simulation.
    fn rest_phase(&self) -> Phase {
        let initialized = self
            .shared
            .with_driver(|d| Ok(d.is_initialized()))
            .unwrap_or(false);
        if initialized {
            Phase::Ready
        } else {
            Phase::NotAttached
        }
    }

    /// Initialize the driver, read the onboard machine name, and settle in
    /// `Ready`; fall back to `NotAttached` on failure.
    fn connect(&mut self) {
        let result = self.shared.with_driver(|d| {
            d.initialize()?;
            Ok(d.as_onboard_parameters().and_then(|p| p.machine_name().ok()))
        });
        match result {
            Ok(onboard_name) => {
                if let Some(name) = onboard_name {
                    info!(name = name.as_str(), "device identified itself");
                    self.shared.set_machine_name(Some(name));
                }
                self.shared.transition(Phase::Ready);
            }
            Err(e) => {
                error!("driver initialization failed: {e}");
                self.shared.transition(Phase::NotAttached);
            }
        }
    }

    /// Halt the device hard and settle back in `Ready`.
    fn halt(&mut self) {
        if let Err(e) = self.shared.with_driver(|d| d.stop(true)) {
            warn!("could not halt device: {e}");
        }
        self.shared.transition(Phase::Ready);
    }

    /// Reset the device, refresh the onboard name, and settle in `Ready`.
    fn reset(&mut self) {
        let result = self.shared.with_driver(|d| {
            d.reset()?;
            Ok(d.as_onboard_parameters().and_then(|p| p.machine_name().ok()))
        });
        match result {
            Ok(onboard_name) => {
                if let Some(name) = onboard_name {
                    self.shared.set_machine_name(Some(name));
                }
            }
            Err(e) => error!("device reset failed: {e}"),
        }
        self.shared.transition(Phase::Ready);
    }

    /// Give the serial port back while nothing is attached.
    fn release_serial(&self) {
        let _ = self.shared.with_driver(|d| {
            if let Some(owner) = d.as_serial_port_owner() {
                owner.release_serial();
            }
            Ok(())
        });
    }
}

/// Apply every pending request in submission order. Called at the top of
/// the worker loop and between pipeline lines.
pub(crate) fn drain_requests(shared: &Shared, ctx: &mut BuildContext) {
    while let Some(request) = shared.requests.pop() {
        debug!(request = %request, "applying request");
        apply_request(shared, ctx, request);
    }
}

/// The request dispatch table. Requests whose preconditions do not hold
/// are ignored (with a log line), which makes repeated requests harmless.
fn apply_request(shared: &Shared, ctx: &mut BuildContext, request: JobRequest) {
    let Ok(state) = shared.state.snapshot() else {
        error!("machine state unreadable, dropping request");
        return;
    };

    match request {
        JobRequest::Connect => {
            if state.phase() == Phase::NotAttached {
                shared.transition(Phase::Connecting);
            } else {
                debug!("ignoring connect: already attached");
            }
        }
        JobRequest::Reset => {
            if state.is_connected() {
                shared.transition(Phase::Reset);
            } else {
                debug!("ignoring reset: not connected");
            }
        }
        JobRequest::Simulate { source } => {
            if matches!(state.phase(), Phase::Ready | Phase::NotAttached) {
                start_build(shared, ctx, JobTarget::Simulator, Some(source), None, None);
            } else {
                warn!("ignoring simulate request while busy");
            }
        }
        JobRequest::BuildDirect { source } => {
            if state.is_ready() {
                start_build(shared, ctx, JobTarget::Machine, Some(source), None, None);
            } else {
                warn!("ignoring build request: machine not ready");
            }
        }
        JobRequest::BuildToFile { source, path } => {
            if state.is_ready() {
                start_build(
                    shared,
                    ctx,
                    JobTarget::File,
                    Some(source),
                    None,
                    Some(path),
                );
            } else {
                warn!("ignoring file-capture request: machine not ready");
            }
        }
        JobRequest::BuildToRemoteFile { source, remote_name } => {
            if state.is_ready() {
                start_build(
                    shared,
                    ctx,
                    JobTarget::RemoteFile,
                    Some(source),
                    Some(remote_name),
                    None,
                );
            } else {
                warn!("ignoring upload request: machine not ready");
            }
        }
        JobRequest::BuildRemote { remote_name } => {
            if state.is_ready() {
                ctx.remote_name = Some(remote_name);
                shared.transition(Phase::BuildingRemote);
            } else {
                warn!("ignoring remote-build request: machine not ready");
            }
        }
        JobRequest::Pause => {
            if state.is_building() && !state.is_paused() {
                shared.set_paused(true);
            }
        }
        JobRequest::Unpause => {
            if state.is_building() && state.is_paused() {
                shared.set_paused(false);
            }
        }
        JobRequest::Stop => {
            // let the device cool regardless of what it was doing
            let cooled = shared.with_driver(|d| {
                d.set_tool_target_temperature(0.0)?;
                d.set_platform_target_temperature(0.0)
            });
            if let Err(e) = cooled {
                warn!("could not zero target temperatures on stop: {e}");
            }
            if state.is_building() {
                shared.transition(Phase::Stopping);
            }
        }
        JobRequest::Disconnect => {
            let _ = shared.with_driver(|d| {
                d.uninitialize();
                if let Some(owner) = d.as_serial_port_owner() {
                    owner.release_serial();
                }
                Ok(())
            });
            shared.transition(Phase::NotAttached);
        }
        JobRequest::DisconnectRemoteBuild => match state.phase() {
            Phase::BuildingRemote => {
                // walk away; the machine keeps building from its own storage
                info!("detaching from remote build");
                shared.stop_running();
            }
            _ if state.is_building() => {
                shared.transition(Phase::Stopping);
                shared.stop_running();
            }
            _ => debug!("ignoring remote-build disconnect: no build in flight"),
        },
        JobRequest::RunCommand { command } => run_command(shared, command),
        JobRequest::Terminate => shared.stop_running(),
    }
}

fn start_build(
    shared: &Shared,
    ctx: &mut BuildContext,
    target: JobTarget,
    source: Option<Arc<dyn GCodeSource>>,
    remote_name: Option<String>,
    file_path: Option<PathBuf>,
) {
    ctx.source = source;
    ctx.target = target;
    ctx.remote_name = remote_name;
    ctx.file_path = file_path;
    shared.set_target(target);
    shared.transition(Phase::Building);
}

/// Execute one ad-hoc command against the driver, retrying while the device
/// asks for it and swallowing stop conditions.
fn run_command(shared: &Shared, mut command: Box<dyn Command>) {
    loop {
        let outcome = shared.with_driver(|d| Ok(command.run(d)));
        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(CommandFault::Retry)) => {
                if !shared.running() {
                    return;
                }
                std::thread::sleep(COMMAND_RETRY_TICK);
            }
            Ok(Err(CommandFault::Stop { message, .. })) => {
                info!(message = message.as_str(), "ad-hoc command raised a stop; ignoring");
                return;
            }
            Ok(Err(CommandFault::Driver(e))) => {
                error!("ad-hoc command failed: {e}");
                return;
            }
            Err(e) => {
                warn!("cannot run command without a driver: {e}");
                return;
            }
        }
    }
}
