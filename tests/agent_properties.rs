// tests/agent_properties.rs
use crossing_arbiter::config::{PhaseConfig, SimulationConfig};
use crossing_arbiter::models::lane::LaneId;
use crossing_arbiter::models::vehicle::{
    LifecycleState, Maneuver, SpawnRequest, VehicleClass, VehicleId, VehicleSnapshot,
};
use crossing_arbiter::{SimError, SimulationHost};
use std::time::Duration;
use tokio::time::sleep;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Phases off so only the arbiter gates crossings.
fn host() -> SimulationHost {
    init_logger();
    let config = SimulationConfig {
        phases: PhaseConfig {
            enabled: false,
            ..PhaseConfig::default()
        },
        ..SimulationConfig::default()
    };
    SimulationHost::start(config).unwrap()
}

fn request(class: VehicleClass, lane: LaneId, maneuver: Maneuver) -> SpawnRequest {
    SpawnRequest {
        class,
        lane,
        maneuver,
    }
}

async fn wait_for_state(host: &SimulationHost, id: VehicleId, state: LifecycleState) {
    for _ in 0..4_000 {
        if host.vehicle(id).map(|v| v.state) == Some(state) {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never reached {:?}", id, state);
}

/// Samples every vehicle until a condition holds, checking mutual exclusion
/// and following gaps on every sample.
struct Recorder {
    safety: f64,
    seen: Vec<VehicleSnapshot>,
}

impl Recorder {
    fn new(host: &SimulationHost) -> Self {
        Self {
            safety: host.config().following.queueing_safety_distance,
            seen: Vec::new(),
        }
    }

    async fn run_until(
        &mut self,
        host: &SimulationHost,
        what: &str,
        mut done: impl FnMut(&SimulationHost) -> bool,
    ) {
        for _ in 0..8_000 {
            let vehicles = host.vehicles();
            let crossing = vehicles
                .iter()
                .filter(|v| v.state == LifecycleState::Crossing)
                .count();
            assert!(crossing <= 1, "{} vehicles crossing at once", crossing);
            assert_following_gaps(&vehicles, self.safety);
            self.seen.extend(vehicles);
            if done(host) {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn run_to_completion(&mut self, host: &SimulationHost) {
        self.run_until(host, "every vehicle to finish", |h| h.vehicles().is_empty())
            .await;
    }

    fn saw(&self, id: VehicleId, check: impl Fn(&VehicleSnapshot) -> bool) -> bool {
        self.seen.iter().any(|v| v.id == id && check(v))
    }

    fn first_to_cross(&self) -> Option<VehicleId> {
        self.seen
            .iter()
            .find(|v| v.state == LifecycleState::Crossing)
            .map(|v| v.id)
    }
}

fn assert_following_gaps(vehicles: &[VehicleSnapshot], safety: f64) {
    for a in vehicles {
        for b in vehicles {
            let same_track = a.id < b.id
                && a.lane == b.lane
                && a.lane_index == b.lane_index
                && a.state.is_on_road()
                && b.state.is_on_road()
                && !a.on_shoulder
                && !b.on_shoulder;
            if same_track {
                let gap = (a.position - b.position).abs();
                assert!(
                    gap >= safety - 1e-6,
                    "{} and {} only {:.3} apart on {:?}",
                    a.id,
                    b.id,
                    gap,
                    a.lane
                );
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn at_most_one_vehicle_crosses_and_queues_keep_their_gaps() {
    let host = host();
    let plan = [
        request(VehicleClass::Normal, LaneId::NorthRight, Maneuver::Straight),
        request(VehicleClass::Heavy, LaneId::NorthRight, Maneuver::Right),
        request(VehicleClass::PublicTransport, LaneId::SouthLeft, Maneuver::Left),
        request(VehicleClass::Normal, LaneId::SouthLeft, Maneuver::UTurn),
        request(VehicleClass::Normal, LaneId::NorthLeft, Maneuver::Left),
        request(VehicleClass::Heavy, LaneId::SouthRight, Maneuver::Straight),
        request(VehicleClass::Normal, LaneId::NorthRight, Maneuver::Straight),
    ];
    let ids: Vec<VehicleId> = plan
        .into_iter()
        .map(|spawn| host.spawn_vehicle(spawn).unwrap())
        .collect();

    let mut recorder = Recorder::new(&host);
    recorder.run_to_completion(&host).await;

    for id in ids {
        assert!(recorder.saw(id, |v| v.state == LifecycleState::Crossing));
    }
    let stats = host.stats();
    assert_eq!(stats.grants_total, plan.len() as u64);
    assert_eq!(stats.total_waiting, 0);
    assert!(stats.permit_available);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_vehicle_waits_off_road_until_the_entry_clears() {
    let host = host();
    let first = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::SouthRight, Maneuver::Right))
        .unwrap();
    let second = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::SouthRight, Maneuver::Right))
        .unwrap();

    wait_for_state(&host, first, LifecycleState::Approaching).await;
    assert_eq!(
        host.vehicle(second).map(|v| v.state),
        Some(LifecycleState::Spawning)
    );
    wait_for_state(&host, second, LifecycleState::Approaching).await;
    let gap = host.vehicle(first).unwrap().position - host.vehicle(second).unwrap().position;
    assert!(gap >= host.config().following.queueing_safety_distance);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_waiting_vehicle_removes_it_from_its_queue() {
    let host = host();
    // A standing emergency episode elsewhere keeps NorthRight waiting forever.
    host.arbiter().activate_emergency(LaneId::East, VehicleId(9_999));
    let id = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::NorthRight, Maneuver::Straight))
        .unwrap();
    wait_for_state(&host, id, LifecycleState::WaitingTurn).await;
    assert_eq!(host.arbiter().queue(LaneId::NorthRight).position_of(id), Some(0));

    host.cancel_vehicle(id).unwrap();
    sleep(Duration::from_millis(150)).await;

    assert!(host.vehicle(id).is_none());
    assert!(host.arbiter().queue(LaneId::NorthRight).is_empty());
    assert!(host.arbiter().permit_available());
    assert_eq!(host.stats().orphans_recovered, 1);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_crossing_vehicle_frees_the_permit() {
    let host = host();
    let id = host
        .spawn_vehicle(request(VehicleClass::Heavy, LaneId::West, Maneuver::UTurn))
        .unwrap();
    wait_for_state(&host, id, LifecycleState::Crossing).await;
    assert_eq!(host.arbiter().current_holder(), Some(id));

    host.cancel_vehicle(id).unwrap();
    sleep(Duration::from_millis(150)).await;

    assert!(host.vehicle(id).is_none());
    assert!(host.arbiter().permit_available());
    assert_eq!(host.arbiter().current_holder(), None);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn despawn_releases_the_permit_immediately() {
    let host = host();
    let id = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::East, Maneuver::Straight))
        .unwrap();
    wait_for_state(&host, id, LifecycleState::Crossing).await;

    let outcome = host.despawn(id).unwrap();
    assert!(outcome.released_permit);
    assert!(host.arbiter().permit_available());
    assert!(host.despawn(id).is_err());
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restricted_lane_rejects_the_wrong_maneuver() {
    let host = host();
    let result = host.spawn_vehicle(request(
        VehicleClass::Normal,
        LaneId::NorthLeft,
        Maneuver::Straight,
    ));
    assert!(matches!(result, Err(SimError::InvalidManeuver { .. })));
    assert!(host.vehicles().is_empty());
    assert!(matches!(
        host.cancel_vehicle(VehicleId(42)),
        Err(SimError::UnknownVehicle(_))
    ));
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_agent_and_frees_the_intersection() {
    let host = host();
    for _ in 0..12 {
        host.spawn_random_vehicle().unwrap();
    }
    sleep(Duration::from_secs(25)).await;

    host.shutdown().await;
    assert_eq!(host.active_agents(), 0);
    assert!(host.vehicles().is_empty());
    let stats = host.stats();
    assert_eq!(stats.total_waiting, 0);
    assert!(stats.permit_available);
    assert!(!stats.emergency_active);
    assert!(matches!(host.spawn_random_vehicle(), Err(SimError::ShutDown)));
}

#[tokio::test(start_paused = true)]
async fn street_queue_pulls_onto_the_shoulder_for_an_emergency_vehicle() {
    let host = host();
    let queue = host.arbiter().queue(LaneId::NorthRight);
    // A standing episode elsewhere keeps the street queue at its stop line.
    let blocker = VehicleId(9_999);
    host.arbiter().activate_emergency(LaneId::East, blocker);
    let normals: Vec<VehicleId> = (0..5)
        .map(|_| {
            host.spawn_vehicle(request(
                VehicleClass::Normal,
                LaneId::NorthRight,
                Maneuver::Straight,
            ))
            .unwrap()
        })
        .collect();

    let mut recorder = Recorder::new(&host);
    recorder
        .run_until(&host, "the street queue to form", |h| {
            h.vehicle(normals[0]).map(|v| v.state) == Some(LifecycleState::WaitingTurn)
                && h.arbiter().queue(LaneId::NorthRight).size() == normals.len()
        })
        .await;

    let ambulance = host
        .spawn_vehicle(request(
            VehicleClass::Emergency,
            LaneId::NorthRight,
            Maneuver::Straight,
        ))
        .unwrap();
    recorder
        .run_until(&host, "the ambulance to reach the stop line", |h| {
            h.vehicle(ambulance).map(|v| v.state) == Some(LifecycleState::WaitingTurn)
        })
        .await;

    assert_eq!(queue.position_of(ambulance), Some(0));
    assert_eq!(queue.size(), normals.len() + 1);
    for id in &normals {
        assert!(
            recorder.saw(*id, |v| v.state == LifecycleState::Yielding && v.on_shoulder),
            "{} never pulled over",
            id
        );
    }

    let outcome = host.arbiter().purge(blocker);
    assert!(outcome.ended_emergency);
    assert_eq!(host.stats().emergency_vehicle_id, Some(ambulance));

    recorder.run_to_completion(&host).await;
    assert_eq!(recorder.first_to_cross(), Some(ambulance));
    let stats = host.stats();
    assert_eq!(stats.grants_total, normals.len() as u64 + 1);
    assert_eq!(stats.total_waiting, 0);
    assert!(!stats.emergency_active);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn avenue_vehicle_moves_to_the_outer_lane_for_an_emergency_vehicle() {
    let host = host();
    let heavy = host
        .spawn_vehicle(request(VehicleClass::Heavy, LaneId::East, Maneuver::Straight))
        .unwrap();
    let ambulance = host
        .spawn_vehicle(request(VehicleClass::Emergency, LaneId::East, Maneuver::Left))
        .unwrap();

    let mut recorder = Recorder::new(&host);
    recorder.run_to_completion(&host).await;

    assert!(recorder.saw(heavy, |v| {
        v.state == LifecycleState::Yielding && v.lane_index == 1 && !v.on_shoulder
    }));
    assert!(recorder.saw(heavy, |v| {
        v.state == LifecycleState::Approaching && v.lane_index == 0
    }));
    assert_eq!(recorder.first_to_cross(), Some(ambulance));
    assert_eq!(host.stats().grants_total, 2);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn faster_avenue_vehicle_overtakes_and_merges_back_before_the_stop_line() {
    let host = host();
    let heavy = host
        .spawn_vehicle(request(VehicleClass::Heavy, LaneId::West, Maneuver::Straight))
        .unwrap();
    let car = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::West, Maneuver::Right))
        .unwrap();

    let mut recorder = Recorder::new(&host);
    recorder.run_to_completion(&host).await;

    assert!(recorder.saw(car, |v| v.state == LifecycleState::ChangingLane));
    assert!(recorder.saw(car, |v| {
        v.state == LifecycleState::Cruising && v.lane_index == 1
    }));
    assert!(recorder.saw(car, |v| {
        v.state == LifecycleState::Approaching && v.lane_index == 0
    }));
    assert!(!recorder.saw(heavy, |v| v.lane_index == 1));
    assert_eq!(recorder.first_to_cross(), Some(car));
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn u_turn_vehicle_cannot_queue_again_while_it_crosses() {
    let host = host();
    let id = host
        .spawn_vehicle(request(VehicleClass::Normal, LaneId::West, Maneuver::UTurn))
        .unwrap();
    wait_for_state(&host, id, LifecycleState::Crossing).await;

    // Coming back round on the opposite avenue, or the same one, is refused.
    assert!(!host.arbiter().register(id, LaneId::East, VehicleClass::Normal));
    assert!(!host.arbiter().register(id, LaneId::West, VehicleClass::Normal));
    assert_eq!(host.stats().total_waiting, 0);

    let mut recorder = Recorder::new(&host);
    recorder.run_to_completion(&host).await;
    let stats = host.stats();
    assert_eq!(stats.grants_total, 1);
    assert_eq!(stats.total_waiting, 0);
    assert!(stats.permit_available);
    host.shutdown().await;
}
