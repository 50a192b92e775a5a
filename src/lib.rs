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

//! printhost drives a 3D-printer-class device through a stream of G-code
//! while staying responsive to asynchronous user intents: connect, pause,
//! resume, stop, reset, ad-hoc commands, disconnect.
//!
//! One [`MachineController`] owns one device. Commands to the controller
//! enqueue requests; a dedicated worker thread drains them, walks the
//! machine state machine, and streams builds through the ordered command
//! pipeline to the device driver (or the simulator, or a capture target).

#![warn(clippy::pedantic)]

pub mod command;
pub mod config;
pub mod controller;
pub mod driver;
pub mod event;
pub mod pipeline;
pub mod prompt;
pub mod request;
pub mod source;
pub mod state;
mod worker;

pub use command::{Command, CommandFault, GCodeParser, ParserFactory, StopKind};
pub use config::MachineConfig;
pub use controller::{ControllerError, MachineController};
pub use driver::{Driver, DriverError, DriverFactory, ResponseCode};
pub use event::{MachineEvent, MachineListener};
pub use prompt::UserPrompt;
pub use request::JobTarget;
pub use source::{FileSource, GCodeSource, StringSource};
pub use state::{MachineState, Phase};
