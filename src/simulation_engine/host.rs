use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

use crate::config::SimulationConfig;
use crate::control_system::arbiter::{IntersectionArbiter, PurgeOutcome};
use crate::control_system::traffic_light_controller::TrafficPhaseController;
use crate::error::{SimError, SimResult};
use crate::models::lane::LaneId;
use crate::models::time::SimClock;
use crate::models::vehicle::{SpawnRequest, Vehicle, VehicleClass, VehicleId, VehicleSnapshot};
use crate::monitoring::congestion_monitor::spawn_congestion_monitor;
use crate::monitoring::stats::ArbiterStats;
use crate::simulation_engine::agent::{AgentContext, AgentSignals, VehicleAgent};
use crate::simulation_engine::following::FollowingModel;
use crate::simulation_engine::registry::VehicleRegistry;

#[derive(Debug)]
struct AgentHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns the background tasks and every vehicle agent.
///
/// `start` must be called from inside a tokio runtime.
#[derive(Debug)]
pub struct SimulationHost {
    config: SimulationConfig,
    ctx: AgentContext,
    next_id: AtomicU64,
    agents: Mutex<HashMap<VehicleId, AgentHandle>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    ticks: watch::Receiver<u64>,
    shutdown: watch::Sender<bool>,
}

impl SimulationHost {
    /// Validates the config and starts the tick driver, the phase controller
    /// and the congestion monitor.
    pub fn start(config: SimulationConfig) -> SimResult<Self> {
        config.validate()?;

        let clock = SimClock::start();
        let arbiter = Arc::new(IntersectionArbiter::new(config.arbiter.clone(), clock));
        let phases = Arc::new(TrafficPhaseController::new(config.phases.clone()));
        let following = Arc::new(FollowingModel::new(
            config.following.clone(),
            config.agent.stop_line,
        ));
        let ctx = AgentContext {
            arbiter: Arc::clone(&arbiter),
            phases: Arc::clone(&phases),
            registry: Arc::new(VehicleRegistry::new()),
            following,
            config: config.agent.clone(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tick_tx, ticks) = watch::channel(0u64);

        let background = vec![
            spawn_tick_driver(tick_tx, config.agent.tick(), shutdown_rx.clone()),
            Arc::clone(&phases).run(shutdown_rx.clone()),
            spawn_congestion_monitor(arbiter, config.arbiter.monitor_period(), shutdown_rx),
        ];

        log::info!(
            "Simulation host started: tick {:?}, phases {}",
            config.agent.tick(),
            if config.phases.enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            ctx,
            next_id: AtomicU64::new(1),
            agents: Mutex::new(HashMap::new()),
            background: Mutex::new(background),
            ticks,
            shutdown,
        })
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<VehicleId, AgentHandle>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &Arc<IntersectionArbiter> {
        &self.ctx.arbiter
    }

    pub fn phases(&self) -> &Arc<TrafficPhaseController> {
        &self.ctx.phases
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Creates a vehicle in sub-lane 0 of its approach and starts its agent.
    pub fn spawn_vehicle(&self, request: SpawnRequest) -> SimResult<VehicleId> {
        self.spawn_in_sub_lane(request, 0)
    }

    pub fn spawn_in_sub_lane(
        &self,
        request: SpawnRequest,
        lane_index: u8,
    ) -> SimResult<VehicleId> {
        if self.is_shut_down() {
            return Err(SimError::ShutDown);
        }
        if !request.lane.allows(request.maneuver) {
            return Err(SimError::InvalidManeuver {
                lane: request.lane,
                maneuver: request.maneuver,
            });
        }

        let id = VehicleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let vehicle = Vehicle::new(id, request);
        let agent = VehicleAgent::new(vehicle, lane_index, self.ctx.clone());

        let (cancel, cancel_rx) = watch::channel(false);
        let signals = AgentSignals {
            ticks: self.ticks.clone(),
            cancel: cancel_rx,
            shutdown: self.shutdown.subscribe(),
        };
        let join = tokio::spawn(agent.run(signals));

        let mut agents = self.agents();
        agents.retain(|_, handle| !handle.join.is_finished());
        agents.insert(id, AgentHandle { cancel, join });
        drop(agents);

        log::info!(
            "Spawned vehicle {:?} {} on {:?} (sub-lane {}) to go {:?}",
            request.class,
            id,
            request.lane,
            lane_index,
            request.maneuver
        );
        Ok(id)
    }

    /// Random class (normal 50%, heavy 20%, public transport 20%, emergency
    /// 10%), random lane, a maneuver that lane accepts and a random sub-lane.
    pub fn spawn_random_vehicle(&self) -> SimResult<VehicleId> {
        let (request, lane_index) = {
            let mut rng = rand::rng();
            let roll: f64 = rng.random_range(0.0..1.0);
            let class = if roll < 0.50 {
                VehicleClass::Normal
            } else if roll < 0.70 {
                VehicleClass::Heavy
            } else if roll < 0.90 {
                VehicleClass::PublicTransport
            } else {
                VehicleClass::Emergency
            };
            let lane = LaneId::ALL[rng.random_range(0..LaneId::ALL.len())];
            let maneuvers = lane.allowed_maneuvers();
            let maneuver = maneuvers[rng.random_range(0..maneuvers.len())];
            let lane_index = rng.random_range(0..lane.lane_count());
            (
                SpawnRequest {
                    class,
                    lane,
                    maneuver,
                },
                lane_index,
            )
        };
        self.spawn_in_sub_lane(request, lane_index)
    }

    pub fn vehicle(&self, id: VehicleId) -> Option<VehicleSnapshot> {
        self.ctx.registry.get(id)
    }

    pub fn vehicles(&self) -> Vec<VehicleSnapshot> {
        self.ctx.registry.snapshot()
    }

    pub fn stats(&self) -> ArbiterStats {
        self.ctx.arbiter.stats()
    }

    /// Agents still running.
    pub fn active_agents(&self) -> usize {
        self.agents()
            .values()
            .filter(|handle| !handle.join.is_finished())
            .count()
    }

    /// Asks the agent to stop at its next wake-up. Its cleanup runs when the
    /// agent is dropped.
    pub fn cancel_vehicle(&self, id: VehicleId) -> SimResult<()> {
        match self.agents().get(&id) {
            Some(handle) => {
                handle.cancel.send_replace(true);
                Ok(())
            }
            None => Err(SimError::UnknownVehicle(id)),
        }
    }

    /// Aborts the agent outright and purges the vehicle right away, without
    /// waiting for the aborted task to be dropped.
    pub fn despawn(&self, id: VehicleId) -> SimResult<PurgeOutcome> {
        let handle = self.agents().remove(&id).ok_or(SimError::UnknownVehicle(id))?;
        handle.join.abort();
        self.ctx.registry.remove(id);
        Ok(self.ctx.arbiter.purge(id))
    }

    /// Signals every task to stop, waits up to the grace period, then aborts
    /// whatever is still running.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let mut handles: Vec<JoinHandle<()>> = self
            .agents()
            .drain()
            .map(|(_, handle)| handle.join)
            .collect();
        handles.extend(
            self.background
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..),
        );

        let deadline = Instant::now() + self.config.host.shutdown_grace();
        let mut forced = 0;
        for mut handle in handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                forced += 1;
            }
        }

        log::info!(
            "Simulation host shut down ({} tasks aborted), final state: {}",
            forced,
            self.ctx.arbiter.stats().summary()
        );
    }
}

/// Bumps the tick counter once per period; agents step on every change.
fn spawn_tick_driver(
    ticks: watch::Sender<u64>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ticks.send_modify(|n| *n += 1);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
