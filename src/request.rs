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

//! Intents submitted to the machine worker, and the queue carrying them.

use std::{fmt::Display, path::PathBuf, sync::Arc};

use crossbeam_queue::SegQueue;

use crate::{command::Command, source::GCodeSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Where the commands of the current job are sent.
pub enum JobTarget {
    /// No job is in flight.
    None,
    /// Straight to the live device.
    Machine,
    /// To the simulator only; the live device receives nothing.
    Simulator,
    /// Captured onto the device's own storage.
    RemoteFile,
    /// Captured into a file on the host.
    File,
}

/// An intent submitted by an external caller, drained by the machine worker
/// in submission order.
pub enum JobRequest {
    /// Attach and initialize the device.
    Connect,
    /// Return the device to a known state.
    Reset,
    /// Pause the in-flight build, down to the device.
    Pause,
    /// Resume a paused build.
    Unpause,
    /// Stop the in-flight build and let the device cool.
    Stop,
    /// Detach from the device, releasing its serial port.
    Disconnect,
    /// Walk away from a remote build, leaving the machine running on its
    /// own; stops any other kind of build.
    DisconnectRemoteBuild,
    /// Build the given source against the simulator only.
    Simulate {
        /// The G-code to simulate.
        source: Arc<dyn GCodeSource>,
    },
    /// Build the given source directly on the device.
    BuildDirect {
        /// The G-code to build.
        source: Arc<dyn GCodeSource>,
    },
    /// Capture the build into a file on the host.
    BuildToFile {
        /// The G-code to build.
        source: Arc<dyn GCodeSource>,
        /// Where on the host to write the capture.
        path: PathBuf,
    },
    /// Capture the build onto the device's own storage.
    BuildToRemoteFile {
        /// The G-code to build.
        source: Arc<dyn GCodeSource>,
        /// The file name to create on the device.
        remote_name: String,
    },
    /// Replay a previously captured build from the device's storage.
    BuildRemote {
        /// The file name on the device.
        remote_name: String,
    },
    /// Execute a single ad-hoc command against the driver.
    RunCommand {
        /// The command to execute.
        command: Box<dyn Command>,
    },
    /// Shut the worker down. Enqueued by `dispose`.
    Terminate,
}

impl Display for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRequest::Connect => write!(f, "connect"),
            JobRequest::Reset => write!(f, "reset"),
            JobRequest::Pause => write!(f, "pause"),
            JobRequest::Unpause => write!(f, "unpause"),
            JobRequest::Stop => write!(f, "stop"),
            JobRequest::Disconnect => write!(f, "disconnect"),
            JobRequest::DisconnectRemoteBuild => write!(f, "disconnect remote build"),
            JobRequest::Simulate { source } => write!(f, "simulate {}", source.name()),
            JobRequest::BuildDirect { source } => write!(f, "build {}", source.name()),
            JobRequest::BuildToFile { source, path } => {
                write!(f, "build {} to file {}", source.name(), path.display())
            }
            JobRequest::BuildToRemoteFile { source, remote_name } => {
                write!(f, "upload {} as {remote_name}", source.name())
            }
            JobRequest::BuildRemote { remote_name } => {
                write!(f, "remote build {remote_name}")
            }
            JobRequest::RunCommand { command } => write!(f, "run {}", command.describe()),
            JobRequest::Terminate => write!(f, "terminate"),
        }
    }
}

/// An unbounded multi-producer single-consumer FIFO of requests.
///
/// `push` never blocks and never fails; draining order equals enqueue
/// order. Waking the worker is the caller's concern (the controller pairs
/// every push with a wake on the state cell).
pub struct RequestQueue(SegQueue<JobRequest>);

impl RequestQueue {
    #[must_use]
    /// Construct an empty queue.
    pub fn new() -> RequestQueue {
        RequestQueue(SegQueue::new())
    }

    /// Enqueue a request. Non-blocking, always succeeds.
    pub fn push(&self, request: JobRequest) {
        self.0.push(request);
    }

    /// Take the oldest pending request, if any.
    pub fn pop(&self) -> Option<JobRequest> {
        self.0.pop()
    }

    /// Whether no requests are pending.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        RequestQueue::new()
    }
}
