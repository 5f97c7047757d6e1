//! Concurrent batch buffer keyed by delivery tag.
//!
//! Backed by a [`DashMap`], so inserts from the delivery path rarely contend
//! with each other or with a flush working through its snapshot. No lock is
//! held across an `.await`.
//!
//! Inserts share a gate that [`BatchBuffer::snapshot`] takes exclusively, so a
//! snapshot never holds a later tag while missing an earlier one inserted
//! before it. A cumulative ack of the highest tag in a snapshot relies on
//! this.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use crate::broker::DeliveryTag;
use crate::decoder::Record;

#[derive(Default)]
pub struct BatchBuffer {
    entries: DashMap<DeliveryTag, Record>,
    gate: RwLock<()>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `tag`, returning the previous record.
    pub fn insert(&self, tag: DeliveryTag, record: Record) -> Option<Record> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.entries.insert(tag, record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Copy of every entry, ordered by tag. The live buffer is left untouched
    /// and may keep changing while the copy is processed.
    pub fn snapshot(&self) -> Vec<(DeliveryTag, Record)> {
        let gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        drop(gate);
        entries.sort_unstable_by_key(|(tag, _)| *tag);
        entries
    }

    /// Remove `tag` only if it still maps to this exact `record` allocation.
    ///
    /// Returns `false` when the entry is gone or was replaced in the meantime.
    pub fn remove_pair(&self, tag: DeliveryTag, record: &Record) -> bool {
        self.entries
            .remove_if(&tag, |_, current| Arc::ptr_eq(current, record))
            .is_some()
    }
}
