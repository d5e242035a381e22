use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::lane::LaneId;
use crate::models::time::Timestamp;
use crate::models::vehicle::{VehicleClass, VehicleId};

/// One waiting vehicle in an approach queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueRecord {
    pub vehicle_id: VehicleId,
    pub class: VehicleClass,
    pub arrival: Timestamp,
    pub at_stop_line: bool,
    pub stop_arrival: Option<Timestamp>,
}

/// Per-lane waiting line.
///
/// Every operation takes the lane's own lock, so two callers can never both
/// see themselves as head, while different lanes proceed in parallel.
#[derive(Debug)]
pub struct ApproachQueue {
    lane: LaneId,
    records: Mutex<VecDeque<QueueRecord>>,
}

impl ApproachQueue {
    pub fn new(lane: LaneId) -> Self {
        Self {
            lane,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<QueueRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts in arrival order. Emergency vehicles go ahead of every
    /// non-emergency record but behind earlier emergency records.
    ///
    /// Returns `false` without touching the queue if the vehicle is already queued.
    pub fn enqueue(&self, vehicle_id: VehicleId, class: VehicleClass, arrival: Timestamp) -> bool {
        let mut records = self.records();
        if records.iter().any(|r| r.vehicle_id == vehicle_id) {
            return false;
        }

        let record = QueueRecord {
            vehicle_id,
            class,
            arrival,
            at_stop_line: false,
            stop_arrival: None,
        };

        if class.is_emergency() {
            let slot = records
                .iter()
                .position(|r| !r.class.is_emergency())
                .unwrap_or(records.len());
            records.insert(slot, record);
        } else {
            records.push_back(record);
        }
        true
    }

    /// Flags the vehicle as standing at the stop line. The flag never reverts
    /// and the first stop time is kept on repeated calls.
    pub fn mark_at_stop(&self, vehicle_id: VehicleId, now: Timestamp) -> Option<QueueRecord> {
        let mut records = self.records();
        let record = records.iter_mut().find(|r| r.vehicle_id == vehicle_id)?;
        if !record.at_stop_line {
            record.at_stop_line = true;
            record.stop_arrival = Some(now);
        }
        Some(*record)
    }

    pub fn dequeue_head(&self) -> Option<QueueRecord> {
        self.records().pop_front()
    }

    /// Pops the head only if it is `vehicle_id`.
    pub fn dequeue_head_if(&self, vehicle_id: VehicleId) -> Option<QueueRecord> {
        let mut records = self.records();
        match records.front() {
            Some(head) if head.vehicle_id == vehicle_id => records.pop_front(),
            _ => None,
        }
    }

    /// 0-based position, `None` when the vehicle is not queued here.
    pub fn position_of(&self, vehicle_id: VehicleId) -> Option<usize> {
        self.records()
            .iter()
            .position(|r| r.vehicle_id == vehicle_id)
    }

    pub fn size(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn head(&self) -> Option<QueueRecord> {
        self.records().front().copied()
    }

    /// Head record, only if it is standing at the stop line.
    pub fn head_at_stop(&self) -> Option<QueueRecord> {
        self.head().filter(|r| r.at_stop_line)
    }

    pub fn contains(&self, vehicle_id: VehicleId) -> bool {
        self.position_of(vehicle_id).is_some()
    }

    pub fn remove(&self, vehicle_id: VehicleId) -> Option<QueueRecord> {
        let mut records = self.records();
        let index = records.iter().position(|r| r.vehicle_id == vehicle_id)?;
        records.remove(index)
    }

    pub fn snapshot(&self) -> Vec<QueueRecord> {
        self.records().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> ApproachQueue {
        ApproachQueue::new(LaneId::NorthRight)
    }

    #[test]
    fn enqueue_keeps_arrival_order_and_rejects_duplicates() {
        let q = queue();
        assert!(q.enqueue(VehicleId(1), VehicleClass::Normal, Timestamp(10)));
        assert!(q.enqueue(VehicleId(2), VehicleClass::Heavy, Timestamp(20)));
        assert!(!q.enqueue(VehicleId(1), VehicleClass::Normal, Timestamp(30)));

        assert_eq!(q.size(), 2);
        assert_eq!(q.position_of(VehicleId(1)), Some(0));
        assert_eq!(q.position_of(VehicleId(2)), Some(1));
        assert_eq!(q.position_of(VehicleId(9)), None);
    }

    #[test]
    fn emergency_jumps_normal_traffic_but_not_earlier_emergencies() {
        let q = queue();
        q.enqueue(VehicleId(1), VehicleClass::Normal, Timestamp(1));
        q.enqueue(VehicleId(2), VehicleClass::Emergency, Timestamp(2));
        q.enqueue(VehicleId(3), VehicleClass::PublicTransport, Timestamp(3));
        q.enqueue(VehicleId(4), VehicleClass::Emergency, Timestamp(4));

        let order: Vec<u64> = q.snapshot().iter().map(|r| r.vehicle_id.0).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn stop_flag_is_monotonic() {
        let q = queue();
        q.enqueue(VehicleId(1), VehicleClass::Normal, Timestamp(1));

        let first = q.mark_at_stop(VehicleId(1), Timestamp(5)).unwrap();
        let again = q.mark_at_stop(VehicleId(1), Timestamp(9)).unwrap();
        assert!(first.at_stop_line);
        assert_eq!(again.stop_arrival, Some(Timestamp(5)));
        assert!(q.mark_at_stop(VehicleId(7), Timestamp(9)).is_none());
    }

    #[test]
    fn conditional_dequeue_only_pops_the_named_head() {
        let q = queue();
        q.enqueue(VehicleId(1), VehicleClass::Normal, Timestamp(1));
        q.enqueue(VehicleId(2), VehicleClass::Normal, Timestamp(2));

        assert!(q.dequeue_head_if(VehicleId(2)).is_none());
        assert_eq!(q.dequeue_head_if(VehicleId(1)).map(|r| r.vehicle_id), Some(VehicleId(1)));
        assert_eq!(q.head().map(|r| r.vehicle_id), Some(VehicleId(2)));
        assert!(q.remove(VehicleId(2)).is_some());
        assert!(q.is_empty());
        assert!(q.dequeue_head().is_none());
    }
}
