//! Latest-value-wins store shared between the acquisition loop and readers.

use indexmap::IndexMap;
use log::warn;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::registry::ParameterId;

/// Consistent copy of every cached value at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Values in registry order; `None` means no data yet
    pub values: IndexMap<ParameterId, Option<f64>>,
    /// Completed acquisition cycles when the copy was taken
    pub cycles: u64,
}

impl Snapshot {
    pub fn get(&self, id: ParameterId) -> Option<f64> {
        self.values.get(&id).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, Option<f64>)> + '_ {
        self.values.iter().map(|(id, value)| (*id, *value))
    }
}

pub struct ValueCache {
    values: RwLock<IndexMap<ParameterId, Option<f64>>>,
    cycles: AtomicU64,
}

impl ValueCache {
    /// Create a cache holding every id, all absent
    pub fn new(ids: impl IntoIterator<Item = ParameterId>) -> Self {
        Self {
            values: RwLock::new(ids.into_iter().map(|id| (id, None)).collect()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Overwrite the value of one parameter
    pub fn publish(&self, id: ParameterId, value: f64) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        match values.get_mut(&id) {
            Some(slot) => *slot = Some(value),
            None => warn!("Ignoring value for unregistered parameter {id}"),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            values: values.clone(),
            cycles: self.cycles.load(Ordering::Acquire),
        }
    }

    pub(crate) fn complete_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }
}
