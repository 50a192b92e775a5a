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

//! Loading and validating machine configurations.

use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::StringSource;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
/// A configuration for one machine controller.
///
/// The `driver` subtree is opaque to the controller core; it is handed
/// verbatim to the [`DriverFactory`](crate::driver::DriverFactory) that
/// constructs the transport.
pub struct MachineConfig {
    /// The human-readable name of the machine.
    pub name: String,
    /// Opaque driver configuration, interpreted by the driver factory.
    #[serde(default)]
    pub driver: serde_json::Value,
    /// G-code run before every build, one command per line.
    #[serde(default)]
    pub warmup: Option<String>,
    /// G-code run after every build, one command per line.
    #[serde(default)]
    pub cooldown: Option<String>,
    /// Runtime preferences consulted by the worker and pipeline.
    #[serde(default)]
    pub preferences: Preferences,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
/// Runtime preferences for a controller.
pub struct Preferences {
    /// Whether to construct the simulator driver at all.
    #[serde(default)]
    pub simulator: bool,
    /// Whether live builds also feed the simulator stream.
    #[serde(default)]
    pub show_simulator: bool,
    /// Whether status polling reads temperatures during builds.
    #[serde(default = "default_monitor_temp")]
    pub monitor_temp: bool,
    /// How often status polling runs, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_monitor_temp() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            simulator: false,
            show_simulator: false,
            monitor_temp: default_monitor_temp(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Error)]
/// The set of errors that can occur when loading a configuration.
pub enum Error {
    /// The configuration was malformed and could not be parsed into a
    /// `MachineConfig` object.
    #[error("failed to parse JSON for configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    /// An I/O error occurred while reading the configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The machine name was empty.
    #[error("machine name must not be empty")]
    EmptyName,
    /// The status-poll interval was zero.
    #[error("poll interval must be at least 1 ms")]
    BadPollInterval,
}

impl MachineConfig {
    /// Construct a new `MachineConfig` by parsing some readable source.
    /// Will also check the configuration to determine that there are no
    /// logical inconsistencies in its definition.
    ///
    /// # Errors
    ///
    /// This function will return errors in line with the definition of
    /// `Error` in this module.
    pub fn parse(source: &mut impl Read) -> Result<MachineConfig, Error> {
        let mut text = String::new();
        source.read_to_string(&mut text)?;
        let config: MachineConfig = serde_json::from_str(&text)?;

        if config.name.trim().is_empty() {
            return Err(Error::EmptyName);
        }
        if config.preferences.poll_interval_ms == 0 {
            return Err(Error::BadPollInterval);
        }

        Ok(config)
    }

    /// The warmup block as a source, empty if none was configured.
    #[must_use]
    pub fn warmup_source(&self) -> StringSource {
        StringSource::from_block("warmup", self.warmup.as_deref().unwrap_or(""))
    }

    /// The cooldown block as a source, empty if none was configured.
    #[must_use]
    pub fn cooldown_source(&self) -> StringSource {
        StringSource::from_block("cooldown", self.cooldown.as_deref().unwrap_or(""))
    }
}
