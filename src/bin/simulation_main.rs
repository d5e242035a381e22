// simulation_main.rs
use crossing_arbiter::{SimResult, SimulationConfig, SimulationHost};
use std::time::Duration;
use tokio::time::interval;

/// Seconds of simulated traffic before the demo shuts down.
const RUN_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> SimResult<()> {
    env_logger::init();

    let config = SimulationConfig::from_env()?;
    let host = SimulationHost::start(config)?;

    let mut spawner = interval(Duration::from_secs(1));
    for second in 0..RUN_SECONDS {
        spawner.tick().await;
        host.spawn_random_vehicle()?;

        if second % 10 == 9 {
            match serde_json::to_string_pretty(&host.stats()) {
                Ok(json) => println!("{}", json),
                Err(e) => log::warn!("Could not serialise stats: {}", e),
            }
        }
    }

    host.shutdown().await;
    Ok(())
}
