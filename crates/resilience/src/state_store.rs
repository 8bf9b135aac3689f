// crates/resilience/src/state_store.rs
//! Pluggable storage for circuit breaker state
//!
//! A breaker keeps two values: its [`Status`] and the clock reading of the
//! most recent failure. The default [`InMemoryStateStore`] keeps them local
//! to the breaker. [`MapBackedStateStore`] writes them into a shared
//! concurrent map under `<prefix>_STATE` and `<prefix>_LAST_FAILURE`, so
//! several breakers can share one map as long as their prefixes differ.

use crate::error::{ResilienceError, ResilienceResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const STATE_SUFFIX: &str = "_STATE";
const LAST_FAILURE_SUFFIX: &str = "_LAST_FAILURE";

/// Circuit breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Calls flow through to the primary action
    #[default]
    Alive,
    /// Calls go straight to the fallback
    Broken,
}

/// Snapshot of a breaker's stored state
///
/// `last_failure_millis` is only meaningful when `status` is `Broken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakerState {
    pub status: Status,
    pub last_failure_millis: u64,
}

/// Storage for a breaker's status and last failure time
///
/// Each read and write is individually atomic; the breaker does not lock
/// across a read followed by a write.
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Stored status, `Alive` if never set
    fn status(&self) -> Status;

    fn set_status(&self, status: Status);

    /// Stored failure time in clock millis, 0 if never set
    fn last_failure(&self) -> u64;

    fn set_last_failure(&self, millis: u64);

    /// Reads both fields
    fn snapshot(&self) -> BreakerState {
        BreakerState {
            status: self.status(),
            last_failure_millis: self.last_failure(),
        }
    }
}

/// State held in process memory, owned by a single breaker
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    broken: AtomicBool,
    last_failure: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn status(&self) -> Status {
        if self.broken.load(Ordering::Acquire) {
            Status::Broken
        } else {
            Status::Alive
        }
    }

    fn set_status(&self, status: Status) {
        self.broken.store(status == Status::Broken, Ordering::Release);
    }

    fn last_failure(&self) -> u64 {
        self.last_failure.load(Ordering::Acquire)
    }

    fn set_last_failure(&self, millis: u64) {
        self.last_failure.store(millis, Ordering::Release);
    }
}

/// Value stored in a shared state map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Status(Status),
    Millis(u64),
}

/// Concurrent map that several breakers can share
pub type StateMap = Arc<DashMap<String, StoredValue>>;

/// Creates an empty shared state map
pub fn new_state_map() -> StateMap {
    Arc::new(DashMap::new())
}

/// State persisted into a shared map under a key prefix
///
/// Prefix collisions between stores are not detected.
#[derive(Debug, Clone)]
pub struct MapBackedStateStore {
    map: StateMap,
    state_key: String,
    last_failure_key: String,
}

impl MapBackedStateStore {
    /// Creates a store writing under `<prefix>_STATE` and `<prefix>_LAST_FAILURE`
    pub fn new(map: StateMap, prefix: impl Into<String>) -> ResilienceResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ResilienceError::InvalidArgument(
                "state store key prefix must not be empty".to_string(),
            ));
        }

        Ok(Self {
            map,
            state_key: format!("{prefix}{STATE_SUFFIX}"),
            last_failure_key: format!("{prefix}{LAST_FAILURE_SUFFIX}"),
        })
    }

    /// Key holding the status
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Key holding the last failure time
    pub fn last_failure_key(&self) -> &str {
        &self.last_failure_key
    }

    /// The shared backing map
    pub fn map(&self) -> &StateMap {
        &self.map
    }
}

impl StateStore for MapBackedStateStore {
    fn status(&self) -> Status {
        match self.map.get(&self.state_key).map(|entry| *entry.value()) {
            None => Status::default(),
            Some(StoredValue::Status(status)) => status,
            Some(other) => {
                log::warn!(
                    "Unexpected value {:?} under {}, treating as {:?}",
                    other,
                    self.state_key,
                    Status::default()
                );
                Status::default()
            }
        }
    }

    fn set_status(&self, status: Status) {
        self.map
            .insert(self.state_key.clone(), StoredValue::Status(status));
    }

    fn last_failure(&self) -> u64 {
        match self.map.get(&self.last_failure_key).map(|entry| *entry.value()) {
            None => 0,
            Some(StoredValue::Millis(millis)) => millis,
            Some(other) => {
                log::warn!(
                    "Unexpected value {:?} under {}, treating as 0",
                    other,
                    self.last_failure_key
                );
                0
            }
        }
    }

    fn set_last_failure(&self, millis: u64) {
        self.map
            .insert(self.last_failure_key.clone(), StoredValue::Millis(millis));
    }
}
