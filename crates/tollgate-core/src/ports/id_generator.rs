//! IdGenerator port - ULID ベースの ID 生成
//!
//! The timestamp half of every ULID comes from the `Clock`, so a
//! `ManualClock` in tests yields ids in the same order as their creation
//! times.

use std::sync::Arc;

use crate::domain::{AttemptId, ReservationId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn reservation_id(&self) -> ReservationId;

    fn attempt_id(&self) -> AttemptId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn reservation_id(&self) -> ReservationId {
        ReservationId::from(self.next())
    }

    fn attempt_id(&self) -> AttemptId {
        AttemptId::from(self.next())
    }
}
