//! Strongly-typed identifiers.
//!
//! All ids are ULIDs wrapped in `Id<T>`, where `T` is a zero-sized marker.
//! ULIDs sort by creation time, which the task store relies on for
//! oldest-first claiming, and can be minted by several worker processes
//! without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` is never stored; it only keeps `TaskId` and `ReservationId` from
/// being mixed up at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the prefixed display form (`task-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reservation {}

impl IdMarker for Reservation {
    fn prefix() -> &'static str {
        "rsv-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

/// Identifier of a queued task.
pub type TaskId = Id<Task>;

/// Identifier of a budget reservation.
pub type ReservationId = Id<Reservation>;

/// Identifier of one execution attempt of a task.
pub type AttemptId = Id<Attempt>;

/// Identity of a claim holder (one worker).
///
/// Holders are named rather than generated so that log lines and audit
/// records stay readable: `worker-0`, `worker-1`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn worker(index: usize) -> Self {
        Self(format!("worker-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let rsv = ReservationId::from_ulid(Ulid::new());
        let attempt = AttemptId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(rsv.to_string().starts_with("rsv-"));
        assert!(attempt.to_string().starts_with("attempt-"));
        // let _: TaskId = rsv; // <- does not compile
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn parses_prefixed_and_bare_forms() {
        let ulid = Ulid::new();
        let id = TaskId::from_ulid(ulid);

        let prefixed: TaskId = id.to_string().parse().unwrap();
        let bare: TaskId = ulid.to_string().parse().unwrap();

        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn serializes_as_plain_ulid_string() {
        let id = TaskId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));

        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn worker_holder_names() {
        assert_eq!(HolderId::worker(3).as_str(), "worker-3");
    }
}
