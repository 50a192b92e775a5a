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

use std::{fs::File, io::BufReader, sync::Arc, thread::sleep, time::Duration};

use tracing_subscriber::EnvFilter;

use printhost::{
    config::{self, MachineConfig},
    driver::{Driver, DriverError, DriverFactory, SimulatorDriver},
    ControllerError, FileSource, GCodeSource, MachineController, MachineEvent, MachineListener,
};

/// A factory that builds simulator drivers for both slots, so the
/// controller can be exercised with no hardware on the bench.
struct SimulatedHardware;

impl DriverFactory for SimulatedHardware {
    fn driver(&self, _config: &serde_json::Value) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(SimulatorDriver::new()))
    }

    fn simulator(&self) -> Option<Box<dyn Driver>> {
        Some(Box::new(SimulatorDriver::new()))
    }
}

/// A listener that narrates build progress on the console.
struct ConsoleProgress;

impl MachineListener for ConsoleProgress {
    fn machine_event(&self, event: &MachineEvent) {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        match event {
            MachineEvent::StateChange { current, .. } => {
                println!("[{stamp}] state: {:?}", current.phase());
            }
            MachineEvent::Progress {
                lines_processed,
                lines_total,
                elapsed_ms,
                ..
            } => {
                println!(
                    "[{stamp}] line {lines_processed}/{lines_total} ({:.1}s elapsed)",
                    *elapsed_ms as f64 / 1000.0
                );
            }
            MachineEvent::ToolStatus { temperatures } => {
                println!(
                    "[{stamp}] tool {:.0}C/{:.0}C platform {:.0}C/{:.0}C",
                    temperatures.tool,
                    temperatures.tool_target,
                    temperatures.platform,
                    temperatures.platform_target
                );
            }
        }
    }
}

/// The main function for the `printhost` demo driver.
///
/// # Arguments
///
/// The first argument to this executable (via `std::env::args`) is the path
/// to a machine configuration JSON file.
///
/// The second argument is the path to a G-code file to build against the
/// simulator.
fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args
        .first()
        .ok_or(ControllerError::Args("no configuration JSON path given"))?;
    let gcode_path = args
        .get(1)
        .ok_or(ControllerError::Args("no G-code path given"))?;

    let config_file = File::open(config_path).map_err(config::Error::Io)?;
    let config = MachineConfig::parse(&mut BufReader::new(config_file))?;
    println!("=== printhost: {} ===", config.name);

    let expected = {
        let source = FileSource::open(gcode_path)?;
        config.warmup_source().line_count()
            + source.line_count()
            + config.cooldown_source().line_count()
    };

    let controller = MachineController::new(config, &SimulatedHardware)?;
    controller.add_machine_state_listener(Arc::new(ConsoleProgress));

    controller.connect()?;
    while !controller.machine_state()?.is_ready() {
        sleep(Duration::from_millis(20));
    }

    controller.set_code_source(Arc::new(FileSource::open(gcode_path)?));
    match controller.estimate() {
        Ok(estimate) => println!("estimated build time: {:.1}s", estimate.as_secs_f64()),
        Err(e) => println!("no estimate available: {e}"),
    }

    controller.execute()?;
    while !(controller.machine_state()?.is_ready()
        && controller.lines_processed() >= expected as u64)
    {
        sleep(Duration::from_millis(50));
    }

    println!("build finished: {} lines", controller.lines_processed());
    controller.dispose();
    Ok(())
}
