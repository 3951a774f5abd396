use anyhow::anyhow;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info};
use std::path::Path;

use crate::config::SimulationConfig;

mod config;
mod simulation;
mod time_driver;

const USAGE: &str = "usage: wifi-medium-simulator <config.toml>\n       wifi-medium-simulator <stations> <packets/s> <packets> <null|csma>";

fn parse_args(args: &[String]) -> anyhow::Result<SimulationConfig> {
    match args {
        [path] => SimulationConfig::load(Path::new(path)),
        [_, _, _, _] => SimulationConfig::from_positional(args),
        _ => Err(anyhow!(USAGE)),
    }
}

fn embassy_init(spawner: Spawner, config: SimulationConfig) {
    let _ = spawner.spawn(simulation::network_task(spawner, config));
}

fn main() -> anyhow::Result<()> {
    // Logging setup; RUST_LOG overrides the defaults.
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("wifi_medium_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;

    info!("Starting up");
    time_driver::set_time_scale_percent(config.time_scale_percent);

    // Leak the executor to satisfy the 'static lifetime required by run()
    let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
    executor.run(|spawner| embassy_init(spawner, config))
}
