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

//! Units of work executed against a driver, and the parser seam that
//! produces them from G-code text.

use std::{collections::VecDeque, fmt::Display};

use thiserror::Error;

use crate::driver::{Driver, DriverError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The reasons a command may terminate the current build segment.
pub enum StopKind {
    /// The program demanded an immediate, unconditional halt (M0).
    UnconditionalHalt,
    /// The program reached its end marker (M2).
    ProgramEnd,
    /// The program requested an optional stop; the user decides whether to
    /// continue (M1).
    OptionalHalt,
    /// The program asked to rewind to its start (M30). Rewind is not
    /// implemented; the segment ends instead.
    ProgramRewind,
}

impl Display for StopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopKind::UnconditionalHalt => write!(f, "unconditional halt"),
            StopKind::ProgramEnd => write!(f, "program end"),
            StopKind::OptionalHalt => write!(f, "optional halt"),
            StopKind::ProgramRewind => write!(f, "program rewind"),
        }
    }
}

#[derive(Debug, Error)]
/// Control-flow signals raised while running a command against a driver.
///
/// `Retry` and `Stop` are not errors at the controller level; the pipeline
/// turns them into re-execution and halt-dialog behaviour respectively.
pub enum CommandFault {
    /// The device cannot accept the command right now; the same command must
    /// be submitted again.
    #[error("device busy, command must be retried")]
    Retry,
    /// The command raised a stop condition with a user-visible message.
    #[error("stop condition ({kind}): {message}")]
    Stop {
        /// What flavour of stop was raised; drives the dialog policy.
        kind: StopKind,
        /// The user-visible reason for the stop.
        message: String,
    },
    /// The driver failed outright.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// A unit of work executable against a driver.
///
/// `run` either succeeds, raises [`CommandFault::Retry`] (the pipeline
/// re-runs the same command on its next iteration without consuming a new
/// line), or raises [`CommandFault::Stop`].
pub trait Command: Send {
    /// Execute this command against `driver`.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandFault`] per the contract above.
    fn run(&mut self, driver: &mut dyn Driver) -> Result<(), CommandFault>;

    /// A short human-readable description for logs.
    fn describe(&self) -> String {
        "opaque command".to_owned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Which stream a parser instance feeds.
pub enum ParserTarget {
    /// The live device driver (or a capture redirection of it).
    Machine,
    /// The simulator stream.
    Simulator,
}

/// Turns one line of G-code text into an ordered sequence of commands.
///
/// The controller core treats parsing as opaque; dialect-aware parsers live
/// outside this crate and are supplied through a [`ParserFactory`].
pub trait GCodeParser: Send {
    /// Parse `line`, appending any produced commands to `queue` in order.
    fn parse(&mut self, line: &str, queue: &mut VecDeque<Box<dyn Command>>);
}

/// Produces one parser per build stream. The pipeline asks for a fresh pair
/// (machine, simulator) at the start of every segment.
pub trait ParserFactory: Send + Sync {
    /// Construct a parser feeding the given target.
    fn parser(&self, target: ParserTarget) -> Box<dyn GCodeParser>;
}

/// The default line-passthrough parser.
///
/// Strips blank lines and comments (both `;` and parenthesised forms) and
/// emits a single [`LineCommand`] per remaining line. Enough to drive a
/// dialect-agnostic device or the simulator; firmware-specific parsers
/// replace this through the factory seam.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineParser;

impl LineParser {
    fn strip(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut depth = 0usize;
        for c in line.chars() {
            match c {
                ';' if depth == 0 => break,
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => out.push(c),
                _ => (),
            }
        }
        out.trim().to_owned()
    }
}

impl GCodeParser for LineParser {
    fn parse(&mut self, line: &str, queue: &mut VecDeque<Box<dyn Command>>) {
        let stripped = LineParser::strip(line);
        if !stripped.is_empty() {
            queue.push_back(Box::new(LineCommand { line: stripped }));
        }
    }
}

/// A factory handing out [`LineParser`] instances for both streams.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineParserFactory;

impl ParserFactory for LineParserFactory {
    fn parser(&self, _target: ParserTarget) -> Box<dyn GCodeParser> {
        Box::new(LineParser)
    }
}

/// A command that forwards one pre-stripped G-code line to the driver's
/// command sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineCommand {
    line: String,
}

impl LineCommand {
    /// Construct a command around an already-stripped line of G-code.
    pub fn new(line: impl Into<String>) -> LineCommand {
        LineCommand { line: line.into() }
    }
}

impl Command for LineCommand {
    fn run(&mut self, driver: &mut dyn Driver) -> Result<(), CommandFault> {
        driver.execute(&self.line)
    }

    fn describe(&self) -> String {
        self.line.clone()
    }
}
