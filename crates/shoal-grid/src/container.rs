//! Per-partition state holders for distributed objects.
//!
//! A partition keeps one [`ContainerArena`]; each object touched in that
//! partition gets a lazily created slot. Only the partition's worker mutates
//! the arena, and migration moves slots by snapshot plus explicit eviction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::types::{ObjectId, ObjectKind, ReplicaIndex};

/// State of an atomic counter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterContainer {
    value: i64,
}

impl CounterContainer {
    /// Current value.
    pub fn get(&self) -> i64 {
        self.value
    }

    /// Overwrites the value.
    pub fn set(&mut self, value: i64) {
        self.value = value;
    }

    /// Adds `delta` with wrapping and returns the new value.
    pub fn add(&mut self, delta: i64) -> i64 {
        self.value = self.value.wrapping_add(delta);
        self.value
    }
}

/// State of an atomic reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceContainer {
    value: Option<Vec<u8>>,
}

impl ReferenceContainer {
    /// Current value.
    pub fn get(&self) -> Option<&Vec<u8>> {
        self.value.as_ref()
    }

    /// Overwrites the value and returns the previous one.
    pub fn set(&mut self, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        std::mem::replace(&mut self.value, value)
    }
}

/// Entries of one map that hash to this partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapContainer {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    max_size: Option<usize>,
}

impl MapContainer {
    /// Creates a fragment bounded by `max_size` entries, if given.
    pub fn with_max_size(max_size: Option<usize>) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_size,
        }
    }

    /// Returns true if another key fits in this fragment.
    pub fn has_capacity(&self) -> bool {
        self.max_size.map(|max| self.entries.len() < max).unwrap_or(true)
    }

    /// Configured per-partition bound.
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    /// Inserts and returns the previous value.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key, value)
    }

    /// Removes and returns the previous value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A FIFO queue, stored whole in the partition of its name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueContainer {
    items: VecDeque<Vec<u8>>,
    max_size: Option<usize>,
}

impl QueueContainer {
    /// Creates a queue bounded by `max_size`, if given.
    pub fn with_max_size(max_size: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Returns true if another item fits.
    pub fn has_capacity(&self) -> bool {
        self.max_size.map(|max| self.items.len() < max).unwrap_or(true)
    }

    /// Appends an item without a capacity check.
    pub fn push(&mut self, item: Vec<u8>) {
        self.items.push_back(item);
    }

    /// Removes the head item.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.items.pop_front()
    }

    /// Head item.
    pub fn peek(&self) -> Option<&Vec<u8>> {
        self.items.front()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured bound.
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }
}

/// A reentrant lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContainer {
    owner: Option<Uuid>,
    count: u32,
}

impl LockContainer {
    /// Current holder.
    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// Reentrancy count; zero when free.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns true if held.
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// Overwrites the lock state. A zero count frees the lock.
    pub fn set(&mut self, owner: Option<Uuid>, count: u32) {
        if count == 0 {
            self.owner = None;
            self.count = 0;
        } else {
            self.owner = owner;
            self.count = count;
        }
    }
}

/// State of one object in one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    /// Counter state.
    Counter(CounterContainer),
    /// Reference state.
    Reference(ReferenceContainer),
    /// Map fragment.
    Map(MapContainer),
    /// Queue state.
    Queue(QueueContainer),
    /// Lock state.
    Lock(LockContainer),
}

macro_rules! container_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Borrows the container as a ", stringify!($variant), ".")]
        pub fn $name(&mut self) -> Result<&mut $ty> {
            match self {
                Container::$variant(c) => Ok(c),
                other => Err(GridError::WrongObjectKind {
                    expected: ObjectKind::$variant,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl Container {
    /// Creates an empty container of `kind`.
    pub fn new(kind: ObjectKind, max_size: Option<usize>) -> Self {
        match kind {
            ObjectKind::Counter => Container::Counter(CounterContainer::default()),
            ObjectKind::Reference => Container::Reference(ReferenceContainer::default()),
            ObjectKind::Map => Container::Map(MapContainer::with_max_size(max_size)),
            ObjectKind::Queue => Container::Queue(QueueContainer::with_max_size(max_size)),
            ObjectKind::Lock => Container::Lock(LockContainer::default()),
        }
    }

    /// Kind of object stored.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Container::Counter(_) => ObjectKind::Counter,
            Container::Reference(_) => ObjectKind::Reference,
            Container::Map(_) => ObjectKind::Map,
            Container::Queue(_) => ObjectKind::Queue,
            Container::Lock(_) => ObjectKind::Lock,
        }
    }

    container_accessor!(counter_mut, Counter, CounterContainer);
    container_accessor!(reference_mut, Reference, ReferenceContainer);
    container_accessor!(map_mut, Map, MapContainer);
    container_accessor!(queue_mut, Queue, QueueContainer);
    container_accessor!(lock_mut, Lock, LockContainer);
}

/// A container plus the replication degree it was created with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSlot {
    /// Object state.
    pub container: Container,
    /// Total (sync + async) backup count of the object.
    pub backup_count: usize,
}

/// All containers of one partition, keyed by object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerArena {
    slots: BTreeMap<ObjectId, ContainerSlot>,
}

impl ContainerArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `object`, creating an empty one on first access.
    pub fn get_or_create(
        &mut self,
        object: &ObjectId,
        backup_count: usize,
        max_size: Option<usize>,
    ) -> &mut ContainerSlot {
        self.slots
            .entry(object.clone())
            .or_insert_with(|| ContainerSlot {
                container: Container::new(object.kind, max_size),
                backup_count,
            })
    }

    /// Looks up a slot.
    pub fn get(&self, object: &ObjectId) -> Option<&ContainerSlot> {
        self.slots.get(object)
    }

    /// Removes a slot; returns true if it existed.
    pub fn remove(&mut self, object: &ObjectId) -> bool {
        self.slots.remove(object).is_some()
    }

    /// Discards containers a replica at `replica_index` no longer needs.
    ///
    /// `None` clears everything. Otherwise a slot survives only if its object's
    /// backup count reaches the index. Returns the number of slots removed.
    pub fn clear_beyond(&mut self, replica_index: Option<ReplicaIndex>) -> usize {
        let before = self.slots.len();
        match replica_index {
            None => self.slots.clear(),
            Some(index) => self.slots.retain(|_, slot| slot.backup_count >= index),
        }
        before - self.slots.len()
    }

    /// Copies the slots a replica at `replica_index` must hold.
    pub fn snapshot(&self, replica_index: ReplicaIndex) -> Vec<(ObjectId, ContainerSlot)> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.backup_count >= replica_index)
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    /// Replaces the whole arena with snapshot contents.
    pub fn replace(&mut self, slots: Vec<(ObjectId, ContainerSlot)>) {
        self.slots = slots.into_iter().collect();
    }

    /// Object ids present, in order.
    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots.keys()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no object has state here.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
