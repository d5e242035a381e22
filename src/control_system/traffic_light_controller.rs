use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::PhaseConfig;
use crate::models::lane::PhaseGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhaseState {
    Green,
    Yellow,
    Red,
}

#[derive(Debug)]
struct PhaseCycle {
    current_index: usize,
    elapsed_in_phase: u64,
    in_yellow: bool,
    emergency_override: Option<PhaseGroup>,
}

/// Round-robin light cycle: one group green, then yellow, then the next group.
///
/// Lives outside the arbiter; agents read it to decide whether they may ask
/// for the permit at all.
#[derive(Debug)]
pub struct TrafficPhaseController {
    config: PhaseConfig,
    cycle: Mutex<PhaseCycle>,
}

impl TrafficPhaseController {
    pub fn new(config: PhaseConfig) -> Self {
        Self {
            config,
            cycle: Mutex::new(PhaseCycle {
                current_index: 0,
                elapsed_in_phase: 0,
                in_yellow: false,
                emergency_override: None,
            }),
        }
    }

    fn cycle(&self) -> MutexGuard<'_, PhaseCycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_state(&self, group: PhaseGroup) -> PhaseState {
        if !self.config.enabled {
            return PhaseState::Green;
        }
        let cycle = self.cycle();
        if let Some(forced) = cycle.emergency_override {
            return if forced == group {
                PhaseState::Green
            } else {
                PhaseState::Red
            };
        }
        if PhaseGroup::CYCLE[cycle.current_index] != group {
            PhaseState::Red
        } else if cycle.in_yellow {
            PhaseState::Yellow
        } else {
            PhaseState::Green
        }
    }

    /// Forces `group` green and freezes the cycle. Only one group can be
    /// forced at a time; later requests are refused until it is cleared.
    pub fn prioritize(&self, group: PhaseGroup) -> bool {
        let mut cycle = self.cycle();
        match cycle.emergency_override {
            Some(current) => current == group,
            None => {
                cycle.emergency_override = Some(group);
                log::info!("Emergency override: {:?} forced green", group);
                true
            }
        }
    }

    pub fn clear_priority(&self, group: PhaseGroup) {
        let mut cycle = self.cycle();
        if cycle.emergency_override == Some(group) {
            cycle.emergency_override = None;
            log::info!(
                "Clearing emergency override for {:?}, cycle resumes at {:?}",
                group,
                PhaseGroup::CYCLE[cycle.current_index]
            );
        }
    }

    /// Moves the cycle forward by one time unit.
    pub fn advance(&self) {
        let mut cycle = self.cycle();
        if cycle.emergency_override.is_some() {
            // Do not cycle phases during emergency override.
            return;
        }
        cycle.elapsed_in_phase += 1;

        if !cycle.in_yellow && cycle.elapsed_in_phase >= self.config.green_units {
            cycle.elapsed_in_phase = 0;
            if self.config.yellow_units > 0 {
                cycle.in_yellow = true;
                return;
            }
        } else if !(cycle.in_yellow && cycle.elapsed_in_phase >= self.config.yellow_units) {
            return;
        }

        cycle.elapsed_in_phase = 0;
        cycle.in_yellow = false;
        cycle.current_index = (cycle.current_index + 1) % PhaseGroup::CYCLE.len();
        log::debug!(
            "Switching to phase {}: green for {:?}",
            cycle.current_index,
            PhaseGroup::CYCLE[cycle.current_index]
        );
    }

    /// Advances once per configured unit until shutdown.
    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.unit());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.config.enabled {
                            self.advance();
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("Traffic phase controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TrafficPhaseController {
        TrafficPhaseController::new(PhaseConfig::default())
    }

    #[test]
    fn one_group_is_green_at_a_time() {
        let phases = controller();
        for _ in 0..40 {
            let green = PhaseGroup::CYCLE
                .iter()
                .filter(|g| phases.current_state(**g) != PhaseState::Red)
                .count();
            assert_eq!(green, 1);
            phases.advance();
        }
    }

    #[test]
    fn green_then_yellow_then_next_group() {
        let phases = controller();
        assert_eq!(phases.current_state(PhaseGroup::NorthStreet), PhaseState::Green);
        for _ in 0..8 {
            phases.advance();
        }
        assert_eq!(phases.current_state(PhaseGroup::NorthStreet), PhaseState::Yellow);
        phases.advance();
        assert_eq!(phases.current_state(PhaseGroup::NorthStreet), PhaseState::Red);
        assert_eq!(phases.current_state(PhaseGroup::UpperAvenue), PhaseState::Green);
    }

    #[test]
    fn override_freezes_the_cycle_until_cleared() {
        let phases = controller();
        assert!(phases.prioritize(PhaseGroup::LowerAvenue));
        assert!(!phases.prioritize(PhaseGroup::SouthStreet));
        for _ in 0..20 {
            phases.advance();
        }
        assert_eq!(phases.current_state(PhaseGroup::LowerAvenue), PhaseState::Green);
        assert_eq!(phases.current_state(PhaseGroup::NorthStreet), PhaseState::Red);

        phases.clear_priority(PhaseGroup::SouthStreet);
        assert_eq!(phases.current_state(PhaseGroup::LowerAvenue), PhaseState::Green);
        phases.clear_priority(PhaseGroup::LowerAvenue);
        assert_eq!(phases.current_state(PhaseGroup::NorthStreet), PhaseState::Green);
    }

    #[test]
    fn disabled_controller_is_always_green() {
        let phases = TrafficPhaseController::new(PhaseConfig {
            enabled: false,
            ..PhaseConfig::default()
        });
        assert!(PhaseGroup::CYCLE
            .iter()
            .all(|g| phases.current_state(*g) == PhaseState::Green));
    }
}
