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

//! The ordered command pipeline that feeds a build to the device.
//!
//! A build runs three segments in order (warmup, user source, cooldown),
//! each through the same per-line routine: parse into the machine and
//! simulator queues, dispatch with retry and halt-dialog semantics, honour
//! pause/stop, poll status, publish progress, and drain freshly scheduled
//! requests so user intents take effect between lines.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    command::{Command, CommandFault, ParserTarget, StopKind},
    controller::Shared,
    driver::{DriverError, ResponseCode},
    event::MachineEvent,
    request::JobTarget,
    source::{self, GCodeSource},
    state::{self, Phase},
    worker::{drain_requests, BuildContext},
};

/// How often the pipeline re-checks the device while waiting for it to
/// drain its buffer at the end of a segment.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// How often the remote-build loop re-checks the device.
const REMOTE_POLL: Duration = Duration::from_secs(1);

/// Tick length for the pause wait; a wake arrives sooner via the state
/// cell's condition variable.
const PAUSE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
/// The ways a build can end other than by completing.
pub enum BuildError {
    /// The worker is shutting down mid-build.
    #[error("build interrupted by shutdown")]
    Interrupted,
    /// A user stop or reset was observed mid-build.
    #[error("build aborted by user")]
    Aborted,
    /// A build was requested with no source selected.
    #[error("no G-code source selected")]
    NoSource,
    /// A capture build was requested without a capture name or path.
    #[error("no capture name was provided")]
    MissingName,
    /// On-device storage refused a capture or playback operation.
    #[error("on-device storage refused the operation")]
    SdResponse(ResponseCode),
    /// The driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The source could not be read.
    #[error(transparent)]
    Source(#[from] source::Error),
    /// The state cell was poisoned.
    #[error(transparent)]
    State(#[from] state::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How a completed pipeline run ended.
pub enum BuildOutcome {
    /// Every segment ran (or a program halt ended the build cleanly).
    Complete,
    /// The machine left the building phase; another phase owns the machine
    /// now and the worker loop should dispatch it.
    PhaseChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How one segment ended.
enum SegmentOutcome {
    /// The segment ran to the end of its source.
    Ran,
    /// A program halt ended the whole build; skip remaining segments.
    Halted,
    /// The machine left the building phase.
    PhaseChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The result of draining the machine command queue for one line.
enum QueueOutcome {
    /// Every command for the line ran.
    Drained,
    /// The head command must be re-run on the next iteration.
    Retry,
    /// A program halt ended the build.
    Halt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Whether the per-line control checks let the segment continue.
enum Flow {
    Continue,
    Ended(SegmentOutcome),
}

/// One build run against a worker's context. Constructed per dispatch and
/// discarded afterwards.
pub(crate) struct BuildPipeline<'a> {
    shared: &'a Shared,
    ctx: &'a mut BuildContext,
}

impl<'a> BuildPipeline<'a> {
    pub(crate) fn new(shared: &'a Shared, ctx: &'a mut BuildContext) -> BuildPipeline<'a> {
        BuildPipeline { shared, ctx }
    }

    /// Run the build selected by the context's target.
    pub(crate) fn run(&mut self) -> Result<BuildOutcome, BuildError> {
        match self.ctx.target {
            JobTarget::Machine | JobTarget::Simulator => self.build_all(),
            JobTarget::File => self.build_to_file(),
            JobTarget::RemoteFile => self.build_to_sd(),
            JobTarget::None => {
                warn!("entered building phase with no job target");
                Ok(BuildOutcome::Complete)
            }
        }
    }

    /// Whether this build only feeds the simulator; the live driver must
    /// receive nothing at all.
    fn simulating(&self) -> bool {
        self.ctx.target == JobTarget::Simulator
    }

    /// Whether parsed lines are mirrored onto the simulator stream.
    fn simulator_active(&self) -> bool {
        if self.simulating() {
            return true;
        }
        let prefs = self.shared.prefs;
        prefs.simulator && prefs.show_simulator && self.shared.has_simulator()
    }

    /// Build warmup, user source, and cooldown through the same routine.
    fn build_all(&mut self) -> Result<BuildOutcome, BuildError> {
        let source = self.ctx.source.clone().ok_or(BuildError::NoSource)?;
        let warmup = self.shared.warmup.clone();
        let cooldown = self.shared.cooldown.clone();

        let total = warmup.line_count() + source.line_count() + cooldown.line_count();
        self.shared.set_line_counts(0, total as u64);

        self.ctx.start = Some(Instant::now());
        self.ctx.polling_enabled = true;
        self.ctx.poll_interval = Duration::from_millis(self.shared.prefs.poll_interval_ms);
        self.ctx.last_polled = None;

        if !self.simulating() {
            // reconcile the host's idea of the toolhead with the device's
            match self.shared.with_driver(|d| d.current_position()) {
                Ok(position) => debug!(?position, "position reconciled before build"),
                Err(e) => warn!("could not reconcile position before build: {e}"),
            }
        }

        let mut outcome = BuildOutcome::Complete;
        for segment in [&warmup as &dyn GCodeSource, source.as_ref(), &cooldown] {
            match self.run_segment(segment)? {
                SegmentOutcome::Ran => (),
                SegmentOutcome::Halted => break,
                SegmentOutcome::PhaseChanged => {
                    outcome = BuildOutcome::PhaseChanged;
                    break;
                }
            }
        }

        if !self.simulating() {
            let _ = self.shared.with_driver(|d| {
                d.invalidate_position();
                Ok(())
            });
        }

        Ok(outcome)
    }

    /// Run one segment through the per-line loop.
    #[allow(clippy::too_many_lines)]
    fn run_segment(&mut self, segment: &dyn GCodeSource) -> Result<SegmentOutcome, BuildError> {
        debug!(
            segment = segment.name(),
            lines = segment.line_count(),
            "building segment"
        );

        let simulating = self.simulating();
        let feed_simulator = self.simulator_active();

        let mut machine_parser = self.shared.parsers.parser(ParserTarget::Machine);
        let mut simulator_parser = self.shared.parsers.parser(ParserTarget::Simulator);
        let mut machine_queue: VecDeque<Box<dyn Command>> = VecDeque::new();
        let mut simulator_queue: VecDeque<Box<dyn Command>> = VecDeque::new();

        let mut lines = segment.lines()?;
        let mut retrying = false;

        loop {
            if !self.shared.running() {
                return Err(BuildError::Interrupted);
            }

            if !retrying {
                let Some(line) = lines.next() else { break };
                let line = line.map_err(source::Error::Io)?;
                self.shared.count_line();
                if !simulating {
                    machine_parser.parse(&line, &mut machine_queue);
                }
                if feed_simulator {
                    simulator_parser.parse(&line, &mut simulator_queue);
                }
            }
            retrying = false;

            if feed_simulator {
                self.run_simulator_queue(&mut simulator_queue);
            }

            if !simulating {
                match self.run_machine_queue(&mut machine_queue)? {
                    QueueOutcome::Drained => (),
                    QueueOutcome::Retry => retrying = true,
                    QueueOutcome::Halt => return Ok(SegmentOutcome::Halted),
                }

                // asynchronous device faults are logged; the build goes on
                if let Err(e) = self.shared.with_driver(|d| d.check_errors()) {
                    error!("device reported an error mid-build: {e}");
                }
            }

            match self.honour_state(simulating)? {
                Flow::Continue => (),
                Flow::Ended(outcome) => return Ok(outcome),
            }

            self.poll_status(simulating);
            self.emit_progress();

            // let pause/stop/ad-hoc commands take effect between lines
            drain_requests(self.shared, self.ctx);
            match self.honour_state(simulating)? {
                Flow::Continue => (),
                Flow::Ended(outcome) => return Ok(outcome),
            }
        }

        // the device may still be chewing through its buffer
        if !simulating {
            loop {
                if !self.shared.running() {
                    return Err(BuildError::Interrupted);
                }
                drain_requests(self.shared, self.ctx);
                match self.honour_state(simulating)? {
                    Flow::Continue => (),
                    Flow::Ended(outcome) => return Ok(outcome),
                }
                match self.shared.with_driver(|d| d.is_finished()) {
                    Ok(true) => break,
                    Ok(false) => (),
                    Err(e) => {
                        warn!("could not query completion, assuming drained: {e}");
                        break;
                    }
                }
                self.shared.state.wait(DRAIN_POLL)?;
            }
        }

        Ok(SegmentOutcome::Ran)
    }

    /// Run every queued simulator command, swallowing retries and treating
    /// stop conditions as no-ops.
    fn run_simulator_queue(&mut self, queue: &mut VecDeque<Box<dyn Command>>) {
        while let Some(mut command) = queue.pop_front() {
            let result = self.shared.with_simulator(|d| Ok(command.run(d)));
            match result {
                Ok(Ok(()) | Err(CommandFault::Retry | CommandFault::Stop { .. })) => (),
                Ok(Err(CommandFault::Driver(e))) => {
                    warn!("simulator rejected a command: {e}");
                }
                Err(_) => {
                    // no simulator attached; drop the stream
                    queue.clear();
                    return;
                }
            }
        }
    }

    /// Dispatch the machine queue for the current line using peek-then-remove:
    /// a command is only popped once it has run to completion, so a `Retry`
    /// leaves it at the head for the next iteration.
    fn run_machine_queue(
        &mut self,
        queue: &mut VecDeque<Box<dyn Command>>,
    ) -> Result<QueueOutcome, BuildError> {
        loop {
            let Some(command) = queue.front_mut() else {
                return Ok(QueueOutcome::Drained);
            };

            let outcome = self.shared.with_driver(|d| Ok(command.run(d)))?;
            match outcome {
                Ok(()) => {
                    queue.pop_front();
                }
                Err(CommandFault::Retry) => return Ok(QueueOutcome::Retry),
                Err(CommandFault::Stop { kind, message }) => match kind {
                    StopKind::OptionalHalt => {
                        if self.shared.prompt.confirm(&message) {
                            queue.pop_front();
                        } else {
                            return Ok(QueueOutcome::Halt);
                        }
                    }
                    StopKind::UnconditionalHalt
                    | StopKind::ProgramEnd
                    | StopKind::ProgramRewind => {
                        self.shared.prompt.info(&message);
                        return Ok(QueueOutcome::Halt);
                    }
                },
                Err(CommandFault::Driver(e)) => return Err(e.into()),
            }
        }
    }

    /// Honour pause, stop, reset, and phase departure, in that order.
    fn honour_state(&mut self, simulating: bool) -> Result<Flow, BuildError> {
        self.pause_episode(simulating)?;

        let state = self.shared.state.snapshot()?;
        if matches!(state.phase(), Phase::Stopping | Phase::Reset) {
            if !simulating {
                if let Err(e) = self.shared.with_driver(|d| d.stop(true)) {
                    error!("failed to halt device during abort: {e}");
                }
            }
            return Err(BuildError::Aborted);
        }
        if state.phase() != Phase::Building {
            return Ok(Flow::Ended(SegmentOutcome::PhaseChanged));
        }
        if !self.shared.running() {
            return Err(BuildError::Interrupted);
        }
        Ok(Flow::Continue)
    }

    /// If the build is paused, push the pause down into the device and wait
    /// for the resume, still draining requests so the resume (or a stop) can
    /// arrive at all.
    fn pause_episode(&mut self, simulating: bool) -> Result<(), BuildError> {
        let state = self.shared.state.snapshot()?;
        if !state.is_paused() {
            return Ok(());
        }

        if !simulating {
            if let Err(e) = self.shared.with_driver(|d| d.pause()) {
                warn!("could not pause device: {e}");
            }
        }
        info!("build paused");

        loop {
            drain_requests(self.shared, self.ctx);
            let state = self.shared.state.snapshot()?;
            if !self.shared.running() || !state.is_paused() || state.phase() != Phase::Building {
                break;
            }
            self.shared.state.wait(PAUSE_TICK)?;
        }

        if !simulating {
            if let Err(e) = self.shared.with_driver(|d| d.unpause()) {
                warn!("could not unpause device: {e}");
            }
        }
        info!("build resumed");
        Ok(())
    }

    /// Periodic status polling: read temperatures and publish a tool-status
    /// event, when monitoring is enabled.
    fn poll_status(&mut self, simulating: bool) {
        if simulating || !self.ctx.polling_enabled || !self.shared.prefs.monitor_temp {
            return;
        }
        let due = self
            .ctx
            .last_polled
            .map_or(true, |t| t.elapsed() >= self.ctx.poll_interval);
        if !due {
            return;
        }

        match self.shared.with_driver(|d| d.read_temperature()) {
            Ok(temperatures) => self.shared.emit(&MachineEvent::ToolStatus { temperatures }),
            Err(e) => warn!("status poll failed: {e}"),
        }
        self.ctx.last_polled = Some(Instant::now());
    }

    /// Publish one progress event for the line just handled.
    fn emit_progress(&self) {
        let elapsed_ms = self
            .ctx
            .start
            .map_or(0, |s| u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX));
        let estimated_total_ms = self
            .shared
            .estimated_total()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let (lines_processed, lines_total) = self.shared.line_counts();
        self.shared.emit(&MachineEvent::Progress {
            elapsed_ms,
            estimated_total_ms,
            lines_processed,
            lines_total,
        });
    }

    /// Capture the build onto the device's own storage instead of running
    /// it: begin capture, stream the segments, close the capture.
    fn build_to_sd(&mut self) -> Result<BuildOutcome, BuildError> {
        let name = self.ctx.remote_name.clone().ok_or(BuildError::MissingName)?;

        let code = self.shared.with_driver(|d| {
            d.as_sd_capture()
                .ok_or(DriverError::Unsupported("on-device capture"))?
                .begin_capture(&name)
        })?;
        if code != ResponseCode::Success {
            if let Some(message) = code.user_message() {
                self.shared.prompt.info(message);
            }
            return Err(BuildError::SdResponse(code));
        }

        let result = self.build_all();

        match self.shared.with_driver(|d| {
            d.as_sd_capture()
                .ok_or(DriverError::Unsupported("on-device capture"))?
                .end_capture()
        }) {
            Ok(bytes) => info!(bytes, name = name.as_str(), "on-device capture closed"),
            Err(e) => warn!("failed to close on-device capture: {e}"),
        }

        result
    }

    /// Capture the build into a file on the host.
    fn build_to_file(&mut self) -> Result<BuildOutcome, BuildError> {
        let path = self.ctx.file_path.clone().ok_or(BuildError::MissingName)?;

        self.shared.with_driver(|d| {
            d.as_file_capture()
                .ok_or(DriverError::Unsupported("file capture"))?
                .begin_file_capture(&path)
        })?;

        let result = self.build_all();

        match self.shared.with_driver(|d| {
            d.as_file_capture()
                .ok_or(DriverError::Unsupported("file capture"))?
                .end_file_capture()
        }) {
            Ok(()) => info!(path = %path.display(), "file capture closed"),
            Err(e) => warn!("failed to close file capture: {e}"),
        }

        result
    }
}

/// Drive a remote build: ask the device to replay a captured file from its
/// own storage, then babysit it until it finishes, honouring pause and stop.
pub(crate) fn build_remote(
    shared: &Shared,
    ctx: &mut BuildContext,
) -> Result<BuildOutcome, BuildError> {
    let name = ctx.remote_name.clone().ok_or(BuildError::MissingName)?;

    let code = shared.with_driver(|d| {
        d.as_sd_capture()
            .ok_or(DriverError::Unsupported("on-device playback"))?
            .playback(&name)
    })?;
    if code != ResponseCode::Success {
        if let Some(message) = code.user_message() {
            shared.prompt.info(message);
        }
        return Err(BuildError::SdResponse(code));
    }
    info!(name = name.as_str(), "remote build started");

    loop {
        if !shared.running() {
            // a remote-build disconnect walks away and leaves the machine
            // running on its own
            return Ok(BuildOutcome::PhaseChanged);
        }

        drain_requests(shared, ctx);
        let state = shared.state.snapshot()?;
        match state.phase() {
            Phase::BuildingRemote => (),
            // the worker loop halts or resets the device from here
            _ => return Ok(BuildOutcome::PhaseChanged),
        }

        if state.is_paused() {
            if let Err(e) = shared.with_driver(|d| d.pause()) {
                warn!("could not pause device: {e}");
            }
            loop {
                drain_requests(shared, ctx);
                let state = shared.state.snapshot()?;
                if !shared.running()
                    || !state.is_paused()
                    || state.phase() != Phase::BuildingRemote
                {
                    break;
                }
                shared.state.wait(PAUSE_TICK)?;
            }
            if let Err(e) = shared.with_driver(|d| d.unpause()) {
                warn!("could not unpause device: {e}");
            }
            continue;
        }

        match shared.with_driver(|d| d.is_finished()) {
            Ok(true) => return Ok(BuildOutcome::Complete),
            Ok(false) => (),
            Err(e) => {
                error!("lost contact with remote build: {e}");
                return Err(e.into());
            }
        }

        shared.state.wait(REMOTE_POLL)?;
    }
}
