// config.rs
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{SimError, SimResult};
use crate::models::vehicle::VehicleClass;

/// Environment variable the simulation binary reads its config path from.
pub const CONFIG_PATH_ENV: &str = "CROSSING_CONFIG";

/// Arbiter and congestion-monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Lanes with a vehicle at the stop line needed to enter ROTATE.
    pub congestion_enter_lanes: usize,
    /// ROTATE falls back to FIFO below this many congested lanes.
    pub congestion_exit_lanes: usize,
    pub monitor_period_ms: u64,
    /// Upper bound on a single permit acquisition attempt.
    pub permit_wait_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            congestion_enter_lanes: 3,
            congestion_exit_lanes: 2,
            monitor_period_ms: 5_000,
            permit_wait_ms: 100,
        }
    }
}

impl ArbiterConfig {
    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn permit_wait(&self) -> Duration {
        Duration::from_millis(self.permit_wait_ms)
    }
}

/// Distances used by the following model, in road units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowingConfig {
    pub queueing_safety_distance: f64,
    pub braking_distance: f64,
    /// Trailing distance at which an emergency vehicle behind forces a yield.
    pub yield_distance: f64,
    pub lane_width: f64,
    /// Distance from the stop line to the centre of the intersection box.
    pub box_half_width: f64,
    pub normal_radius: f64,
    pub emergency_radius: f64,
    pub public_transport_radius: f64,
    pub heavy_radius: f64,
}

impl Default for FollowingConfig {
    fn default() -> Self {
        Self {
            queueing_safety_distance: 8.0,
            braking_distance: 25.0,
            yield_distance: 60.0,
            lane_width: 6.0,
            box_half_width: 20.0,
            normal_radius: 2.0,
            emergency_radius: 1.75,
            public_transport_radius: 2.5,
            heavy_radius: 2.75,
        }
    }
}

impl FollowingConfig {
    pub fn radius(&self, class: VehicleClass) -> f64 {
        match class {
            VehicleClass::Normal => self.normal_radius,
            VehicleClass::Emergency => self.emergency_radius,
            VehicleClass::PublicTransport => self.public_transport_radius,
            VehicleClass::Heavy => self.heavy_radius,
        }
    }
}

/// Per-vehicle control loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub tick_ms: u64,
    /// Distance from the entry point to the stop line.
    pub stop_line: f64,
    /// Vehicles register with their approach queue within this distance of the stop line.
    pub queue_zone: f64,
    pub queue_spacing: f64,
    /// Avenue vehicles must be in sub-lane 0 this far before the stop line.
    pub merge_distance: f64,
    /// Road units per second for a class with speed multiplier 1.0.
    pub base_speed: f64,
    pub min_stop_dwell_ms: u64,
    pub crossing_duration_ms: u64,
    pub crossing_length: f64,
    pub lane_change_ticks: u32,
    pub yield_speed_factor: f64,
    pub retry_backoff_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            stop_line: 200.0,
            queue_zone: 120.0,
            queue_spacing: 12.0,
            merge_distance: 80.0,
            base_speed: 12.0,
            min_stop_dwell_ms: 500,
            crossing_duration_ms: 2_500,
            crossing_length: 60.0,
            lane_change_ticks: 4,
            yield_speed_factor: 0.3,
            retry_backoff_ms: 100,
        }
    }
}

impl AgentConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn min_stop_dwell(&self) -> Duration {
        Duration::from_millis(self.min_stop_dwell_ms)
    }

    pub fn crossing_duration(&self) -> Duration {
        Duration::from_millis(self.crossing_duration_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn merge_point(&self) -> f64 {
        self.stop_line - self.merge_distance
    }

    pub fn queue_entry_point(&self) -> f64 {
        self.stop_line - self.queue_zone
    }
}

/// Fixed-period signal cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// When false every group reads GREEN and only the arbiter gates crossings.
    pub enabled: bool,
    pub green_units: u64,
    pub yellow_units: u64,
    pub unit_ms: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            green_units: 8,
            yellow_units: 1,
            unit_ms: 1_000,
        }
    }
}

impl PhaseConfig {
    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long shutdown waits for agents before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 2_000,
        }
    }
}

impl HostConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Complete simulation configuration. Every field falls back to its default
/// when missing from the JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub arbiter: ArbiterConfig,
    pub following: FollowingConfig,
    pub agent: AgentConfig,
    pub phases: PhaseConfig,
    pub host: HostConfig,
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> SimResult<Self> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Loads from `CROSSING_CONFIG` when set, defaults otherwise.
    pub fn from_env() -> SimResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        let a = &self.arbiter;
        if a.congestion_exit_lanes > a.congestion_enter_lanes {
            return Err(SimError::InvalidConfig(format!(
                "congestion exit threshold {} exceeds enter threshold {}",
                a.congestion_exit_lanes, a.congestion_enter_lanes
            )));
        }
        if a.monitor_period_ms == 0 || a.permit_wait_ms == 0 {
            return Err(SimError::InvalidConfig(
                "arbiter periods must be non-zero".into(),
            ));
        }

        let f = &self.following;
        if f.queueing_safety_distance <= 0.0 || f.braking_distance <= f.queueing_safety_distance {
            return Err(SimError::InvalidConfig(format!(
                "braking distance {} must exceed queueing safety distance {}",
                f.braking_distance, f.queueing_safety_distance
            )));
        }

        let ag = &self.agent;
        if ag.tick_ms == 0 || ag.base_speed <= 0.0 {
            return Err(SimError::InvalidConfig(
                "agent tick and base speed must be positive".into(),
            ));
        }
        if ag.queue_spacing < f.queueing_safety_distance {
            return Err(SimError::InvalidConfig(format!(
                "queue spacing {} is below the queueing safety distance {}",
                ag.queue_spacing, f.queueing_safety_distance
            )));
        }
        if ag.queue_zone >= ag.stop_line || ag.merge_distance >= ag.stop_line {
            return Err(SimError::InvalidConfig(
                "queue zone and merge distance must lie within the approach".into(),
            ));
        }
        if !(0.0..=1.0).contains(&ag.yield_speed_factor) {
            return Err(SimError::InvalidConfig(
                "yield speed factor must be within [0, 1]".into(),
            ));
        }

        let p = &self.phases;
        if p.enabled && (p.green_units == 0 || p.unit_ms == 0) {
            return Err(SimError::InvalidConfig(
                "phase green time and unit must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config =
            SimulationConfig::from_json_str(r#"{ "arbiter": { "permit_wait_ms": 250 } }"#).unwrap();
        assert_eq!(config.arbiter.permit_wait_ms, 250);
        assert_eq!(config.arbiter.congestion_enter_lanes, 3);
        assert_eq!(config.agent.stop_line, 200.0);
    }

    #[test]
    fn inverted_congestion_thresholds_are_rejected() {
        let result = SimulationConfig::from_json_str(
            r#"{ "arbiter": { "congestion_enter_lanes": 2, "congestion_exit_lanes": 4 } }"#,
        );
        assert!(matches!(result, Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = SimulationConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(SimError::ConfigParse(_))));
    }
}
