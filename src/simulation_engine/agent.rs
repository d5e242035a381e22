use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::control_system::arbiter::IntersectionArbiter;
use crate::control_system::traffic_light_controller::{PhaseState, TrafficPhaseController};
use crate::models::vehicle::{LifecycleState, Vehicle, VehicleSnapshot};
use crate::simulation_engine::following::FollowingModel;
use crate::simulation_engine::registry::VehicleRegistry;

/// Shared collaborators every agent needs.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub arbiter: Arc<IntersectionArbiter>,
    pub phases: Arc<TrafficPhaseController>,
    pub registry: Arc<VehicleRegistry>,
    pub following: Arc<FollowingModel>,
    pub config: AgentConfig,
}

/// Signals an agent listens to besides its own state machine.
#[derive(Debug, Clone)]
pub struct AgentSignals {
    pub ticks: watch::Receiver<u64>,
    pub cancel: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy)]
struct LaneChange {
    target: u8,
    ticks_left: u32,
}

#[derive(Debug, Clone, Copy)]
struct YieldEpisode {
    resume: LifecycleState,
    from_lane: u8,
}

/// Distances closer than this count as arrived.
const POSITION_EPSILON: f64 = 1e-6;

enum Wake {
    Idle,
    Step,
    Stop(&'static str),
}

/// Control loop of one vehicle.
///
/// Owns the vehicle's kinematic state and publishes a snapshot after every
/// step. Dropping the agent, whether it finished, was cancelled or its task
/// was aborted, purges the vehicle from the arbiter and the registry.
#[derive(Debug)]
pub struct VehicleAgent {
    vehicle: Vehicle,
    ctx: AgentContext,
    state: LifecycleState,
    position: f64,
    speed: f64,
    lane_index: u8,
    on_shoulder: bool,
    registered: bool,
    stop_reached: Option<Instant>,
    crossing_started: Option<Instant>,
    retry_at: Option<Instant>,
    lane_change: Option<LaneChange>,
    yielding: Option<YieldEpisode>,
    last_step: Instant,
}

impl VehicleAgent {
    pub fn new(vehicle: Vehicle, lane_index: u8, ctx: AgentContext) -> Self {
        let agent = Self {
            vehicle,
            ctx,
            state: LifecycleState::Spawning,
            position: 0.0,
            speed: 0.0,
            lane_index: lane_index.min(vehicle.lane.lane_count().saturating_sub(1)),
            on_shoulder: false,
            registered: false,
            stop_reached: None,
            crossing_started: None,
            retry_at: None,
            lane_change: None,
            yielding: None,
            last_step: Instant::now(),
        };
        agent.publish();
        agent
    }

    pub fn vehicle(&self) -> &Vehicle {
        &self.vehicle
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            id: self.vehicle.id,
            class: self.vehicle.class,
            lane: self.vehicle.lane,
            lane_index: self.lane_index,
            position: self.position,
            speed: self.speed,
            state: self.state,
            on_shoulder: self.on_shoulder,
            exit_heading: self.vehicle.maneuver.exit_heading(self.vehicle.lane.heading()),
        }
    }

    fn publish(&self) {
        self.ctx.registry.publish(self.snapshot());
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            log::debug!("{} {:?} -> {:?}", self.vehicle.id, self.state, next);
            self.state = next;
        }
    }

    /// Runs until the vehicle completes, is cancelled, or the host shuts down.
    pub async fn run(mut self, mut signals: AgentSignals) {
        let arbiter = Arc::clone(&self.ctx.arbiter);
        let max_dt = self.ctx.config.tick().as_secs_f64() * 4.0;
        self.last_step = Instant::now();

        loop {
            if self.state == LifecycleState::Completed {
                break;
            }
            if *signals.cancel.borrow() || *signals.shutdown.borrow() {
                log::info!("{} stopped in {:?}", self.vehicle.id, self.state);
                break;
            }
            let waiting = self.state == LifecycleState::WaitingTurn;

            let wake = tokio::select! {
                biased;
                changed = signals.cancel.changed() => match changed {
                    Ok(()) if !*signals.cancel.borrow() => Wake::Idle,
                    _ => Wake::Stop("cancelled"),
                },
                changed = signals.shutdown.changed() => match changed {
                    Ok(()) if !*signals.shutdown.borrow() => Wake::Idle,
                    _ => Wake::Stop("shut down"),
                },
                changed = signals.ticks.changed() => match changed {
                    Ok(()) => Wake::Step,
                    Err(_) => Wake::Stop("tick driver gone"),
                },
                _ = arbiter.turn_changed(), if waiting => {
                    self.retry_at = None;
                    Wake::Step
                }
            };

            match wake {
                Wake::Idle => {}
                Wake::Step => {
                    let now = Instant::now();
                    let dt = (now - self.last_step).as_secs_f64().min(max_dt);
                    self.last_step = now;
                    self.step(dt).await;
                }
                Wake::Stop(reason) => {
                    log::info!("{} {} in {:?}", self.vehicle.id, reason, self.state);
                    break;
                }
            }
        }
    }

    /// One control step of `dt` seconds.
    pub async fn step(&mut self, dt: f64) {
        let active = self.ctx.registry.snapshot();

        if self.should_yield(&active) {
            self.begin_yield(&active);
            self.publish();
            return;
        }

        match self.state {
            LifecycleState::Spawning => self.try_enter_road(&active),
            LifecycleState::Cruising => self.cruise(dt, &active),
            LifecycleState::ChangingLane => self.change_lane(dt, &active),
            LifecycleState::Yielding => self.yield_step(dt, &active),
            LifecycleState::Approaching => self.approach(dt, &active),
            LifecycleState::InQueue => self.hold_in_queue(dt, &active),
            LifecycleState::AtStop => self.dwell_at_stop(),
            LifecycleState::WaitingTurn => self.wait_for_turn().await,
            LifecycleState::Crossing => self.cross(&active),
            LifecycleState::Completed => {}
        }

        if self.state != LifecycleState::Completed {
            self.publish();
        }
    }

    fn cruise_speed(&self) -> f64 {
        self.ctx.config.base_speed * self.vehicle.class.speed_multiplier()
    }

    /// Moves forward at the safe speed, never past `limit`. Tries the full
    /// step, then half of it, then stays put.
    fn advance(&mut self, dt: f64, limit: f64, speed: f64, active: &[VehicleSnapshot]) {
        let me = self.snapshot();
        let following = &self.ctx.following;
        let speed = match following.detect_vehicle_ahead(&me, active) {
            Some(ahead) => following.safe_speed(speed, ahead.distance),
            None => speed,
        };
        let remaining = limit - self.position;
        let step = if remaining < POSITION_EPSILON {
            0.0
        } else {
            (speed * dt).min(remaining)
        };
        if step <= 0.0 || dt <= 0.0 {
            self.speed = 0.0;
            return;
        }

        for candidate in [(self.position + step).min(limit), self.position + step / 2.0] {
            if following.can_move(&me, candidate, active) {
                self.speed = (candidate - self.position) / dt;
                self.position = candidate;
                return;
            }
        }
        self.speed = 0.0;
    }

    fn try_enter_road(&mut self, active: &[VehicleSnapshot]) {
        let entry_state = if self.vehicle.lane.is_highway() {
            LifecycleState::Cruising
        } else {
            LifecycleState::Approaching
        };
        let entering = VehicleSnapshot {
            state: entry_state,
            ..self.snapshot()
        };
        let earlier_waiting = active.iter().any(|other| {
            other.state == LifecycleState::Spawning
                && other.lane == entering.lane
                && other.lane_index == entering.lane_index
                && other.id < entering.id
        });
        if !earlier_waiting && self.ctx.following.can_move(&entering, 0.0, active) {
            self.position = 0.0;
            self.transition(entry_state);
        }
    }

    /// Avenue cruising: overtake a slower leader in sub-lane 0, fall back to
    /// sub-lane 0 when clear, and hold at the merge point until merged.
    fn cruise(&mut self, dt: f64, active: &[VehicleSnapshot]) {
        let merge_point = self.ctx.config.merge_point();
        let me = self.snapshot();
        let following = Arc::clone(&self.ctx.following);
        let braking = following.config().braking_distance;

        let target = if self.lane_index == 0 {
            let blocked_by_slower = following
                .detect_vehicle_ahead(&me, active)
                .is_some_and(|ahead| ahead.distance < braking && ahead.speed < self.cruise_speed());
            (blocked_by_slower && self.position + braking < merge_point).then_some(1)
        } else {
            let in_lane_zero = VehicleSnapshot { lane_index: 0, ..me };
            let lane_zero_free = following
                .detect_vehicle_ahead(&in_lane_zero, active)
                .map_or(true, |ahead| ahead.distance >= braking);
            (lane_zero_free || self.position + braking >= merge_point).then_some(0)
        };

        if let Some(target) = target {
            if following.can_enter_lane(&me, target, active) {
                self.lane_change = Some(LaneChange {
                    target,
                    ticks_left: self.ctx.config.lane_change_ticks,
                });
                self.transition(LifecycleState::ChangingLane);
            }
        }

        self.advance(dt, merge_point, self.cruise_speed(), active);
        let merged = self.lane_change.is_none() && self.lane_index == 0;
        if merged && self.position >= merge_point - POSITION_EPSILON {
            self.transition(LifecycleState::Approaching);
        }
    }

    fn change_lane(&mut self, dt: f64, active: &[VehicleSnapshot]) {
        let merge_point = self.ctx.config.merge_point();
        self.advance(dt, merge_point, self.cruise_speed(), active);

        let Some(mut change) = self.lane_change else {
            self.transition(LifecycleState::Cruising);
            return;
        };
        change.ticks_left = change.ticks_left.saturating_sub(1);
        if change.ticks_left > 0 {
            self.lane_change = Some(change);
            return;
        }

        self.lane_change = None;
        let me = self.snapshot();
        if self.ctx.following.can_enter_lane(&me, change.target, active) {
            self.lane_index = change.target;
        }
        self.transition(LifecycleState::Cruising);
    }

    fn should_yield(&self, active: &[VehicleSnapshot]) -> bool {
        let eligible = matches!(
            self.state,
            LifecycleState::Cruising
                | LifecycleState::Approaching
                | LifecycleState::InQueue
                | LifecycleState::AtStop
                | LifecycleState::WaitingTurn
        );
        eligible
            && self
                .ctx
                .following
                .detect_emergency_behind(&self.snapshot(), active)
                .is_some()
    }

    /// Moves one sub-lane outward if there is one and it is clear, otherwise
    /// pulls onto the shoulder.
    fn begin_yield(&mut self, active: &[VehicleSnapshot]) {
        let me = self.snapshot();
        let outward = self.lane_index + 1;
        self.yielding = Some(YieldEpisode {
            resume: self.state,
            from_lane: self.lane_index,
        });
        if outward < self.vehicle.lane.lane_count()
            && self.ctx.following.can_enter_lane(&me, outward, active)
        {
            self.lane_index = outward;
        } else {
            self.on_shoulder = true;
        }
        log::info!(
            "{} yields to an emergency vehicle ({})",
            self.vehicle.id,
            if self.on_shoulder { "shoulder" } else { "outer lane" }
        );
        self.transition(LifecycleState::Yielding);
    }

    fn yield_step(&mut self, dt: f64, active: &[VehicleSnapshot]) {
        let Some(episode) = self.yielding else {
            self.on_shoulder = false;
            self.transition(LifecycleState::Approaching);
            return;
        };

        let back_in_lane = VehicleSnapshot {
            lane_index: episode.from_lane,
            on_shoulder: false,
            ..self.snapshot()
        };
        let following = Arc::clone(&self.ctx.following);
        let clear_behind = following
            .detect_emergency_behind(&back_in_lane, active)
            .is_none();
        if clear_behind && following.can_enter_lane(&back_in_lane, episode.from_lane, active) {
            self.lane_index = episode.from_lane;
            self.on_shoulder = false;
            self.yielding = None;
            self.transition(episode.resume);
            return;
        }

        if episode.resume == LifecycleState::Cruising {
            let speed = self.cruise_speed() * self.ctx.config.yield_speed_factor;
            self.advance(dt, self.ctx.config.merge_point(), speed, active);
        } else {
            self.speed = 0.0;
        }
    }

    fn approach(&mut self, dt: f64, active: &[VehicleSnapshot]) {
        let entry = self.ctx.config.queue_entry_point();
        if !self.registered && self.position >= entry - POSITION_EPSILON {
            let v = self.vehicle;
            self.ctx.arbiter.register(v.id, v.lane, v.class);
            self.registered = true;
            self.transition(LifecycleState::InQueue);
            return;
        }
        self.advance(dt, entry, self.cruise_speed(), active);
    }

    /// Closes up to `stop_line - position * spacing`; the head becomes AT_STOP
    /// once it reaches the stop line.
    fn hold_in_queue(&mut self, dt: f64, active: &[VehicleSnapshot]) {
        let v = self.vehicle;
        let Some(index) = self.ctx.arbiter.queue(v.lane).position_of(v.id) else {
            log::warn!("{} lost its queue record, leaving the approach", v.id);
            self.transition(LifecycleState::Completed);
            self.publish();
            return;
        };

        let stop_line = self.ctx.config.stop_line;
        let target = stop_line - index as f64 * self.ctx.config.queue_spacing;
        self.advance(dt, target, self.cruise_speed(), active);

        if index == 0
            && self.position >= stop_line - POSITION_EPSILON
            && self.ctx.arbiter.mark_at_stop(v.id, v.lane)
        {
            self.speed = 0.0;
            self.stop_reached = Some(Instant::now());
            self.transition(LifecycleState::AtStop);
        }
    }

    fn dwell_at_stop(&mut self) {
        self.speed = 0.0;
        let dwelled = self
            .stop_reached
            .is_some_and(|at| at.elapsed() >= self.ctx.config.min_stop_dwell());
        if dwelled {
            self.transition(LifecycleState::WaitingTurn);
        }
    }

    /// Asks for the permit. After a denial, tick wake-ups hold off until the
    /// retry backoff passes; a turn change wakes the agent straight away.
    async fn wait_for_turn(&mut self) {
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return;
        }
        let v = self.vehicle;
        let group = v.lane.phase_group();
        if v.class.is_emergency() {
            self.ctx.phases.prioritize(group);
        } else if self.ctx.phases.current_state(group) != PhaseState::Green {
            return;
        }

        if self.ctx.arbiter.request_crossing(v.id, v.lane).await {
            self.retry_at = None;
            self.crossing_started = Some(Instant::now());
            self.transition(LifecycleState::Crossing);
        } else {
            self.retry_at = Some(Instant::now() + self.ctx.config.retry_backoff());
        }
    }

    fn crossing_duration(&self) -> Duration {
        self.ctx
            .config
            .crossing_duration()
            .mul_f64(self.vehicle.maneuver.duration_factor())
    }

    /// Follows the crossing path over the maneuver's duration. Only other
    /// crossing vehicles can hold it back.
    fn cross(&mut self, active: &[VehicleSnapshot]) {
        let started = *self.crossing_started.get_or_insert_with(Instant::now);
        let total = self.crossing_duration().as_secs_f64().max(f64::EPSILON);
        let progress = (started.elapsed().as_secs_f64() / total).min(1.0);
        let stop_line = self.ctx.config.stop_line;
        let candidate = stop_line + progress * self.ctx.config.crossing_length;

        let crossing: Vec<VehicleSnapshot> = active
            .iter()
            .filter(|other| other.state == LifecycleState::Crossing)
            .copied()
            .collect();
        if self.ctx.following.can_move(&self.snapshot(), candidate, &crossing) {
            self.speed = self.ctx.config.crossing_length / total;
            self.position = candidate;
        } else {
            self.speed = 0.0;
        }

        if progress >= 1.0 {
            self.complete();
        }
    }

    /// Publishes COMPLETED before handing the permit back, so no observer
    /// ever sees two vehicles crossing at once.
    fn complete(&mut self) {
        let v = self.vehicle;
        self.transition(LifecycleState::Completed);
        self.publish();
        self.ctx.arbiter.release_crossing(v.id);
        if v.class.is_emergency() {
            self.ctx.phases.clear_priority(v.lane.phase_group());
        }
        log::info!(
            "{} ({:?}) completed {:?} from {:?}",
            v.id,
            v.class,
            v.maneuver,
            v.lane
        );
    }
}

impl Drop for VehicleAgent {
    fn drop(&mut self) {
        let v = self.vehicle;
        self.ctx.registry.remove(v.id);
        self.ctx.arbiter.purge(v.id);
        if v.class.is_emergency() {
            self.ctx.phases.clear_priority(v.lane.phase_group());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::models::lane::LaneId;
    use crate::models::time::SimClock;
    use crate::models::vehicle::{Maneuver, SpawnRequest, VehicleClass, VehicleId};

    fn avenue_agent(lane_index: u8) -> VehicleAgent {
        let config = SimulationConfig::default();
        let ctx = AgentContext {
            arbiter: Arc::new(IntersectionArbiter::new(
                config.arbiter.clone(),
                SimClock::start(),
            )),
            phases: Arc::new(TrafficPhaseController::new(config.phases.clone())),
            registry: Arc::new(VehicleRegistry::new()),
            following: Arc::new(FollowingModel::new(
                config.following.clone(),
                config.agent.stop_line,
            )),
            config: config.agent,
        };
        let vehicle = Vehicle::new(
            VehicleId(1),
            SpawnRequest {
                class: VehicleClass::Normal,
                lane: LaneId::East,
                maneuver: Maneuver::Straight,
            },
        );
        VehicleAgent::new(vehicle, lane_index, ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn holds_at_the_merge_point_until_sub_lane_zero_clears() {
        let mut agent = avenue_agent(1);
        let merge_point = agent.ctx.config.merge_point();
        agent.state = LifecycleState::Cruising;
        agent.position = merge_point - 1.0;

        let blocker = VehicleSnapshot {
            id: VehicleId(2),
            lane_index: 0,
            position: merge_point - 2.0,
            speed: 0.0,
            state: LifecycleState::InQueue,
            ..agent.snapshot()
        };
        agent.ctx.registry.publish(blocker);

        for _ in 0..20 {
            agent.step(0.05).await;
        }
        assert_eq!(agent.state, LifecycleState::Cruising);
        assert_eq!(agent.lane_index, 1);
        assert!((agent.position - merge_point).abs() < POSITION_EPSILON);
        assert_eq!(agent.speed, 0.0);

        agent.ctx.registry.remove(VehicleId(2));
        let mut states = Vec::new();
        for _ in 0..10 {
            agent.step(0.05).await;
            states.push(agent.state);
            if agent.state == LifecycleState::Approaching {
                break;
            }
        }
        assert!(states.contains(&LifecycleState::ChangingLane));
        assert_eq!(agent.state, LifecycleState::Approaching);
        assert_eq!(agent.lane_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_u_turn_does_not_register_again() {
        let mut agent = avenue_agent(0);
        agent.state = LifecycleState::Approaching;
        agent.position = agent.ctx.config.queue_entry_point();
        agent.step(0.05).await;
        assert_eq!(agent.state, LifecycleState::InQueue);
        assert_eq!(agent.ctx.arbiter.queue(LaneId::East).size(), 1);

        // Back on an approach after its turn, the registered flag keeps it out.
        agent.ctx.arbiter.queue(LaneId::East).remove(VehicleId(1));
        agent.state = LifecycleState::Approaching;
        agent.step(0.05).await;
        assert!(agent.ctx.arbiter.queue(LaneId::East).is_empty());
    }
}
