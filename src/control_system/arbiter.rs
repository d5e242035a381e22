use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::ArbiterConfig;
use crate::control_system::emergency::EmergencyProtocol;
use crate::models::lane::LaneId;
use crate::models::time::{SimClock, Timestamp};
use crate::models::vehicle::{VehicleClass, VehicleId};
use crate::monitoring::stats::ArbiterStats;
use crate::simulation_engine::approach_queue::{ApproachQueue, QueueRecord};

/// Arbitration policy currently in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrossingMode {
    Fifo,
    Rotate,
    Emergency,
}

impl fmt::Display for CrossingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrossingMode::Fifo => "FIFO",
            CrossingMode::Rotate => "ROTATE",
            CrossingMode::Emergency => "EMERGENCY",
        };
        f.write_str(name)
    }
}

/// Right-of-way order across lanes; the smallest key goes first.
///
/// Class priority descending, at-stop before still-moving, then stop time and
/// arrival time ascending. Lane index and vehicle id make the order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobalOrderingKey {
    priority: Reverse<u8>,
    at_stop_line: Reverse<bool>,
    stop_arrival: Timestamp,
    arrival: Timestamp,
    lane_index: usize,
    vehicle_id: VehicleId,
}

impl GlobalOrderingKey {
    pub fn new(lane: LaneId, record: &QueueRecord) -> Self {
        Self {
            priority: Reverse(record.class.priority()),
            at_stop_line: Reverse(record.at_stop_line),
            stop_arrival: record.stop_arrival.unwrap_or(Timestamp::MAX),
            arrival: record.arrival,
            lane_index: lane.index(),
            vehicle_id: record.vehicle_id,
        }
    }
}

/// One entry of the rebuilt global ordering, as exposed in stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalOrderEntry {
    pub lane: LaneId,
    pub vehicle_id: VehicleId,
    pub class: VehicleClass,
    pub at_stop_line: bool,
    pub arrival: Timestamp,
    pub stop_arrival: Option<Timestamp>,
}

/// What a purge actually had to clean up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    pub dequeued_from: Option<LaneId>,
    pub released_permit: bool,
    pub ended_emergency: bool,
}

impl PurgeOutcome {
    pub fn is_noop(&self) -> bool {
        self.dequeued_from.is_none() && !self.released_permit && !self.ended_emergency
    }
}

/// Current occupant of the critical section. Dropping it hands the permit back.
#[derive(Debug)]
struct CrossingHolder {
    lane: LaneId,
    vehicle_id: VehicleId,
    _permit: OwnedSemaphorePermit,
}

/// Every field that changes together lives here, behind one lock.
#[derive(Debug)]
struct ArbiterState {
    mode: CrossingMode,
    rotation_pointer: usize,
    emergency: EmergencyProtocol,
    holder: Option<CrossingHolder>,
    grants_total: u64,
    orphans_recovered: u64,
}

#[derive(Debug)]
enum Denial {
    NotHeadAtStop,
    EmergencyLane(Option<LaneId>),
    NotRotationLane(LaneId),
    NotFirstInOrder(Option<VehicleId>),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NotHeadAtStop => f.write_str("not the head at the stop line"),
            Denial::EmergencyLane(Some(lane)) => write!(f, "emergency on {:?}", lane),
            Denial::EmergencyLane(None) => f.write_str("emergency lane unknown"),
            Denial::NotRotationLane(lane) => write!(f, "rotation favours {:?}", lane),
            Denial::NotFirstInOrder(Some(first)) => write!(f, "{} goes first", first),
            Denial::NotFirstInOrder(None) => f.write_str("nobody is first in order"),
        }
    }
}

/// Central mutual-exclusion authority for the intersection.
///
/// Lock order is always arbiter state first, then a lane queue.
#[derive(Debug)]
pub struct IntersectionArbiter {
    config: ArbiterConfig,
    clock: SimClock,
    queues: Vec<ApproachQueue>,
    permit: Arc<Semaphore>,
    state: Mutex<ArbiterState>,
    turn_changed: Notify,
}

impl IntersectionArbiter {
    pub fn new(config: ArbiterConfig, clock: SimClock) -> Self {
        Self {
            config,
            clock,
            queues: LaneId::ALL.into_iter().map(ApproachQueue::new).collect(),
            permit: Arc::new(Semaphore::new(1)),
            state: Mutex::new(ArbiterState {
                mode: CrossingMode::Fifo,
                rotation_pointer: 0,
                emergency: EmergencyProtocol::default(),
                holder: None,
                grants_total: 0,
                orphans_recovered: 0,
            }),
            turn_changed: Notify::new(),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn queue(&self, lane: LaneId) -> &ApproachQueue {
        &self.queues[lane.index()]
    }

    fn lock_state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves on the next release, purge or mode change.
    pub fn turn_changed(&self) -> Notified<'_> {
        self.turn_changed.notified()
    }

    pub fn mode(&self) -> CrossingMode {
        self.lock_state().mode
    }

    pub fn permit_available(&self) -> bool {
        self.permit.available_permits() == 1
    }

    pub fn current_holder(&self) -> Option<VehicleId> {
        self.lock_state().holder.as_ref().map(|h| h.vehicle_id)
    }

    /// Adds the vehicle to its lane's queue. Refused when it is already queued
    /// anywhere or currently holds the permit, so a vehicle coming back round
    /// after a U-turn never owns two records.
    pub fn register(&self, vehicle_id: VehicleId, lane: LaneId, class: VehicleClass) -> bool {
        let state = self.lock_state();
        if state.holder.as_ref().is_some_and(|h| h.vehicle_id == vehicle_id) {
            log::debug!("{} holds the permit, registration refused", vehicle_id);
            return false;
        }
        if self.queues.iter().any(|q| q.contains(vehicle_id)) {
            log::debug!("{} is already queued, registration ignored", vehicle_id);
            return false;
        }
        let queued = self.queue(lane).enqueue(vehicle_id, class, self.clock.now());
        if queued {
            log::debug!("{} ({:?}) joined the {:?} queue", vehicle_id, class, lane);
        }
        queued
    }

    /// Records that the vehicle is standing at the stop line. The first
    /// emergency vehicle to do so starts an emergency episode.
    pub fn mark_at_stop(&self, vehicle_id: VehicleId, lane: LaneId) -> bool {
        let mut state = self.lock_state();
        let Some(record) = self.queue(lane).mark_at_stop(vehicle_id, self.clock.now()) else {
            return false;
        };
        if record.class.is_emergency() {
            self.activate_emergency_locked(&mut state, lane, vehicle_id);
        }
        self.evaluate_locked(&mut state);
        drop(state);
        self.turn_changed.notify_waiters();
        true
    }

    /// Starts an emergency episode for `vehicle_id` unless one is already running.
    pub fn activate_emergency(&self, lane: LaneId, vehicle_id: VehicleId) -> bool {
        let mut state = self.lock_state();
        let started = self.activate_emergency_locked(&mut state, lane, vehicle_id);
        drop(state);
        if started {
            self.turn_changed.notify_waiters();
        }
        started
    }

    /// Re-evaluates FIFO <-> ROTATE under the same lock as every grant.
    pub fn evaluate_congestion(&self) -> CrossingMode {
        let mut state = self.lock_state();
        let before = state.mode;
        self.evaluate_locked(&mut state);
        let after = state.mode;
        drop(state);
        if before != after {
            self.turn_changed.notify_waiters();
        }
        after
    }

    /// Tries to take the crossing permit for the head of `lane`.
    ///
    /// Eligibility is checked, the permit is awaited for at most the configured
    /// wait, then eligibility is checked again before the head record is popped.
    /// Any failure answers `false` with the permit left free; callers poll again.
    pub async fn request_crossing(&self, vehicle_id: VehicleId, lane: LaneId) -> bool {
        {
            let mut state = self.lock_state();
            self.evaluate_locked(&mut state);
            if let Err(denial) = self.check_grant(&state, vehicle_id, lane) {
                log::debug!("{} denied in {} mode: {}", vehicle_id, state.mode, denial);
                return false;
            }
        }

        let acquire = Arc::clone(&self.permit).acquire_owned();
        let permit = match timeout(self.config.permit_wait(), acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return false,
            Err(_) => {
                log::debug!("{} timed out waiting for the crossing permit", vehicle_id);
                return false;
            }
        };

        let mut state = self.lock_state();
        self.evaluate_locked(&mut state);
        if let Err(denial) = self.check_grant(&state, vehicle_id, lane) {
            log::debug!("{} lost eligibility while waiting: {}", vehicle_id, denial);
            return false;
        }
        if self.queue(lane).dequeue_head_if(vehicle_id).is_none() {
            return false;
        }

        state.holder = Some(CrossingHolder {
            lane,
            vehicle_id,
            _permit: permit,
        });
        state.grants_total += 1;
        log::info!(
            "Crossing granted to {} from {:?} ({} mode)",
            vehicle_id,
            lane,
            state.mode
        );
        true
    }

    /// Hands the permit back. A no-op for anyone but the current holder.
    pub fn release_crossing(&self, vehicle_id: VehicleId) -> bool {
        let mut state = self.lock_state();
        if !state.holder.as_ref().is_some_and(|h| h.vehicle_id == vehicle_id) {
            log::debug!("{} released a permit it does not hold", vehicle_id);
            return false;
        }
        let holder = state.holder.take();
        self.after_release_locked(&mut state, vehicle_id);
        if let Some(holder) = &holder {
            log::info!("{} cleared the intersection from {:?}", vehicle_id, holder.lane);
        }
        drop(holder);
        drop(state);
        self.turn_changed.notify_waiters();
        true
    }

    /// Removes every trace of `vehicle_id`: queue records, the permit, the
    /// emergency episode. Safe to call at any time and any number of times.
    pub fn purge(&self, vehicle_id: VehicleId) -> PurgeOutcome {
        let mut state = self.lock_state();
        let mut outcome = PurgeOutcome::default();

        for queue in &self.queues {
            if queue.remove(vehicle_id).is_some() {
                outcome.dequeued_from = Some(queue.lane());
            }
        }

        let holder = if state.holder.as_ref().is_some_and(|h| h.vehicle_id == vehicle_id) {
            outcome.released_permit = true;
            state.holder.take()
        } else {
            None
        };

        if state.emergency.is_episode_vehicle(vehicle_id) {
            outcome.ended_emergency = true;
            self.rollback_emergency_locked(&mut state, vehicle_id);
        } else if outcome.released_permit {
            self.advance_rotation_locked(&mut state);
        }
        self.evaluate_locked(&mut state);

        if !outcome.is_noop() {
            state.orphans_recovered += 1;
            log::warn!("Recovered orphaned state of {}: {:?}", vehicle_id, outcome);
        }
        drop(holder);
        drop(state);

        if !outcome.is_noop() {
            self.turn_changed.notify_waiters();
        }
        outcome
    }

    /// Every queued vehicle, sorted by right-of-way.
    pub fn global_order(&self) -> Vec<GlobalOrderEntry> {
        let mut keyed: Vec<(GlobalOrderingKey, GlobalOrderEntry)> = self
            .queues
            .iter()
            .flat_map(|q| {
                let lane = q.lane();
                q.snapshot().into_iter().map(move |r| {
                    (
                        GlobalOrderingKey::new(lane, &r),
                        GlobalOrderEntry {
                            lane,
                            vehicle_id: r.vehicle_id,
                            class: r.class,
                            at_stop_line: r.at_stop_line,
                            arrival: r.arrival,
                            stop_arrival: r.stop_arrival,
                        },
                    )
                })
            })
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn stats(&self) -> ArbiterStats {
        let state = self.lock_state();
        let mut waiting_by_lane = BTreeMap::new();
        let mut vehicle_at_stop = BTreeMap::new();
        for queue in &self.queues {
            waiting_by_lane.insert(queue.lane(), queue.size());
            vehicle_at_stop.insert(queue.lane(), queue.head_at_stop().map(|r| r.vehicle_id));
        }
        let congested_lanes = vehicle_at_stop.values().filter(|v| v.is_some()).count();

        ArbiterStats {
            mode: state.mode,
            total_waiting: waiting_by_lane.values().sum(),
            waiting_by_lane,
            vehicle_at_stop,
            congested_lanes,
            rotation_lane: (state.mode == CrossingMode::Rotate)
                .then(|| LaneId::ROTATION_ORDER[state.rotation_pointer]),
            emergency_active: state.emergency.is_active(),
            emergency_lane: state.emergency.lane(),
            emergency_vehicle_id: state.emergency.vehicle_id(),
            emergency_episodes: state.emergency.episodes_started(),
            current_holder: state.holder.as_ref().map(|h| h.vehicle_id),
            permit_available: state.holder.is_none(),
            grants_total: state.grants_total,
            orphans_recovered: state.orphans_recovered,
            global_order: self.global_order(),
        }
    }

    fn check_grant(
        &self,
        state: &ArbiterState,
        vehicle_id: VehicleId,
        lane: LaneId,
    ) -> Result<(), Denial> {
        if self.queue(lane).head_at_stop().map(|r| r.vehicle_id) != Some(vehicle_id) {
            return Err(Denial::NotHeadAtStop);
        }
        match state.mode {
            CrossingMode::Emergency => match state.emergency.lane() {
                Some(emergency_lane) if emergency_lane == lane => Ok(()),
                other => Err(Denial::EmergencyLane(other)),
            },
            CrossingMode::Rotate => {
                let favoured = LaneId::ROTATION_ORDER[state.rotation_pointer];
                if favoured == lane {
                    Ok(())
                } else {
                    Err(Denial::NotRotationLane(favoured))
                }
            }
            CrossingMode::Fifo => {
                let first = self.fifo_winner().map(|(_, id)| id);
                if first == Some(vehicle_id) {
                    Ok(())
                } else {
                    Err(Denial::NotFirstInOrder(first))
                }
            }
        }
    }

    /// Lane head with the smallest ordering key among those at the stop line.
    fn fifo_winner(&self) -> Option<(LaneId, VehicleId)> {
        self.queues
            .iter()
            .filter_map(|q| {
                q.head_at_stop()
                    .map(|r| (GlobalOrderingKey::new(q.lane(), &r), q.lane(), r.vehicle_id))
            })
            .min_by_key(|(key, _, _)| *key)
            .map(|(_, lane, id)| (lane, id))
    }

    fn lanes_at_stop(&self) -> Vec<LaneId> {
        self.queues
            .iter()
            .filter(|q| q.head_at_stop().is_some())
            .map(|q| q.lane())
            .collect()
    }

    /// First rotation slot, starting at `start`, whose lane has a head at the stop line.
    fn rotation_slot_from(start: usize, at_stop: &[LaneId]) -> Option<usize> {
        let len = LaneId::ROTATION_ORDER.len();
        (0..len)
            .map(|step| (start + step) % len)
            .find(|slot| at_stop.contains(&LaneId::ROTATION_ORDER[*slot]))
    }

    fn activate_emergency_locked(
        &self,
        state: &mut ArbiterState,
        lane: LaneId,
        vehicle_id: VehicleId,
    ) -> bool {
        if !state.emergency.activate(lane, vehicle_id) {
            return false;
        }
        if state.mode != CrossingMode::Emergency {
            log::info!("Arbiter mode {} -> {}", state.mode, CrossingMode::Emergency);
            state.mode = CrossingMode::Emergency;
        }
        true
    }

    fn evaluate_locked(&self, state: &mut ArbiterState) {
        if state.mode == CrossingMode::Emergency {
            return;
        }
        let at_stop = self.lanes_at_stop();
        let congested = at_stop.len();

        match state.mode {
            CrossingMode::Fifo if congested >= self.config.congestion_enter_lanes => {
                // Rotation starts with whoever FIFO would have served next.
                let start = self
                    .fifo_winner()
                    .and_then(|(lane, _)| {
                        LaneId::ROTATION_ORDER.iter().position(|l| *l == lane)
                    })
                    .unwrap_or(0);
                state.rotation_pointer = Self::rotation_slot_from(start, &at_stop).unwrap_or(0);
                state.mode = CrossingMode::Rotate;
                log::info!(
                    "Congestion on {} lanes, arbiter mode FIFO -> ROTATE starting at {:?}",
                    congested,
                    LaneId::ROTATION_ORDER[state.rotation_pointer]
                );
            }
            CrossingMode::Rotate if congested < self.config.congestion_exit_lanes => {
                state.mode = CrossingMode::Fifo;
                log::info!(
                    "Congestion cleared ({} lanes), arbiter mode ROTATE -> FIFO with {} queued",
                    congested,
                    self.queues.iter().map(ApproachQueue::size).sum::<usize>()
                );
            }
            CrossingMode::Rotate => {
                let favoured = LaneId::ROTATION_ORDER[state.rotation_pointer];
                if !at_stop.contains(&favoured) {
                    if let Some(slot) = Self::rotation_slot_from(state.rotation_pointer, &at_stop) {
                        state.rotation_pointer = slot;
                    }
                }
            }
            _ => {}
        }
    }

    fn advance_rotation_locked(&self, state: &mut ArbiterState) {
        if state.mode != CrossingMode::Rotate {
            return;
        }
        let at_stop = self.lanes_at_stop();
        let next = (state.rotation_pointer + 1) % LaneId::ROTATION_ORDER.len();
        state.rotation_pointer = Self::rotation_slot_from(next, &at_stop).unwrap_or(next);
    }

    fn after_release_locked(&self, state: &mut ArbiterState, vehicle_id: VehicleId) {
        if state.emergency.is_episode_vehicle(vehicle_id) {
            self.rollback_emergency_locked(state, vehicle_id);
        } else {
            self.advance_rotation_locked(state);
        }
        self.evaluate_locked(state);
    }

    /// Ends the episode, then either chains into the next emergency vehicle
    /// already waiting at a stop line or re-derives the mode from congestion.
    fn rollback_emergency_locked(&self, state: &mut ArbiterState, vehicle_id: VehicleId) {
        if state.emergency.deactivate(vehicle_id).is_none() {
            return;
        }

        let next_emergency = self
            .queues
            .iter()
            .filter_map(|q| {
                q.head_at_stop()
                    .filter(|r| r.class.is_emergency())
                    .map(|r| (GlobalOrderingKey::new(q.lane(), &r), q.lane(), r.vehicle_id))
            })
            .min_by_key(|(key, _, _)| *key);

        if let Some((_, lane, next_id)) = next_emergency {
            state.emergency.activate(lane, next_id);
            return;
        }

        state.mode = CrossingMode::Fifo;
        self.evaluate_locked(state);
        log::info!("Emergency episode over, arbiter resumes in {} mode", state.mode);
    }
}
