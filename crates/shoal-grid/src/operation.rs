//! Operations against distributed objects and the backups they produce.
//!
//! Each object kind has a closed set of operations. Running an operation on
//! the primary yields a [`Response`] and, when state changed, a
//! [`BackupOperation`] that replays the result on replicas without
//! re-checking preconditions. A failing run leaves the container untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::Container;
use crate::error::{GridError, Result};
use crate::types::{ObjectId, ObjectKind};

/// Whether an operation reads or mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationScope {
    /// Observes state only.
    Read,
    /// May mutate state.
    Write,
}

/// Atomic counter operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOp {
    /// Reads the value.
    Get,
    /// Overwrites the value.
    Set(i64),
    /// Adds and returns the new value.
    AddAndGet(i64),
    /// Adds and returns the previous value.
    GetAndAdd(i64),
    /// Sets `update` iff the value equals `expect`.
    CompareAndSet {
        /// Expected current value.
        expect: i64,
        /// Value to install.
        update: i64,
    },
}

/// Atomic reference operations over opaque values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceOp {
    /// Reads the value.
    Get,
    /// Overwrites the value.
    Set(Option<Vec<u8>>),
    /// Overwrites and returns the previous value.
    GetAndSet(Option<Vec<u8>>),
    /// Sets `update` iff the value equals `expect`.
    CompareAndSet {
        /// Expected current value.
        expect: Option<Vec<u8>>,
        /// Value to install.
        update: Option<Vec<u8>>,
    },
    /// Returns true if no value is set.
    IsNull,
    /// Returns true if the value equals the argument.
    Contains(Option<Vec<u8>>),
}

/// Map operations; each targets the partition of its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOp {
    /// Inserts and returns the previous value.
    Put {
        /// Entry key.
        key: Vec<u8>,
        /// Entry value.
        value: Vec<u8>,
    },
    /// Reads an entry.
    Get {
        /// Entry key.
        key: Vec<u8>,
    },
    /// Removes and returns the previous value.
    Remove {
        /// Entry key.
        key: Vec<u8>,
    },
    /// Returns true if the key is present.
    ContainsKey {
        /// Entry key.
        key: Vec<u8>,
    },
}

/// Queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOp {
    /// Appends an item; false if the queue is full.
    Offer(Vec<u8>),
    /// Removes the head item.
    Poll,
    /// Reads the head item.
    Peek,
    /// Number of items.
    Size,
}

/// Reentrant lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Acquires or re-enters the lock; false if another owner holds it.
    TryLock {
        /// Acquiring owner.
        owner: Uuid,
    },
    /// Releases one hold; fails if `owner` is not the holder.
    Unlock {
        /// Releasing owner.
        owner: Uuid,
    },
    /// Releases the lock whoever holds it.
    ForceUnlock,
    /// Returns true if held.
    IsLocked,
    /// Reentrancy count.
    LockCount,
}

/// An operation against one object in one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Counter operation.
    Counter(CounterOp),
    /// Reference operation.
    Reference(ReferenceOp),
    /// Map operation.
    Map(MapOp),
    /// Queue operation.
    Queue(QueueOp),
    /// Lock operation.
    Lock(LockOp),
}

/// Value returned to the caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// No value.
    Unit,
    /// Boolean result.
    Bool(bool),
    /// Integer result.
    Long(i64),
    /// Optional opaque value.
    Value(Option<Vec<u8>>),
}

/// Result-replaying operation applied on backup replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOperation {
    /// Sets a counter.
    CounterSet(i64),
    /// Sets a reference.
    ReferenceSet(Option<Vec<u8>>),
    /// Writes a map entry.
    MapPut {
        /// Entry key.
        key: Vec<u8>,
        /// Entry value.
        value: Vec<u8>,
    },
    /// Deletes a map entry.
    MapRemove {
        /// Entry key.
        key: Vec<u8>,
    },
    /// Appends a queue item.
    QueueOffer(Vec<u8>),
    /// Drops the queue head.
    QueuePoll,
    /// Sets lock holder and count.
    LockSet {
        /// Holder, if any.
        owner: Option<Uuid>,
        /// Reentrancy count.
        count: u32,
    },
}

/// What a primary run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Value for the caller.
    pub response: Response,
    /// Backup to replicate; `None` when nothing changed.
    pub backup: Option<BackupOperation>,
}

impl RunOutcome {
    fn read(response: Response) -> Self {
        Self {
            response,
            backup: None,
        }
    }

    fn write(response: Response, backup: BackupOperation) -> Self {
        Self {
            response,
            backup: Some(backup),
        }
    }
}

impl Operation {
    /// Kind of object the operation targets.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Operation::Counter(_) => ObjectKind::Counter,
            Operation::Reference(_) => ObjectKind::Reference,
            Operation::Map(_) => ObjectKind::Map,
            Operation::Queue(_) => ObjectKind::Queue,
            Operation::Lock(_) => ObjectKind::Lock,
        }
    }

    /// Read or write, for quorum gating.
    pub fn scope(&self) -> OperationScope {
        use OperationScope::{Read, Write};
        match self {
            Operation::Counter(CounterOp::Get) => Read,
            Operation::Counter(_) => Write,
            Operation::Reference(ReferenceOp::Get)
            | Operation::Reference(ReferenceOp::IsNull)
            | Operation::Reference(ReferenceOp::Contains(_)) => Read,
            Operation::Reference(_) => Write,
            Operation::Map(MapOp::Get { .. }) | Operation::Map(MapOp::ContainsKey { .. }) => Read,
            Operation::Map(_) => Write,
            Operation::Queue(QueueOp::Peek) | Operation::Queue(QueueOp::Size) => Read,
            Operation::Queue(_) => Write,
            Operation::Lock(LockOp::IsLocked) | Operation::Lock(LockOp::LockCount) => Read,
            Operation::Lock(_) => Write,
        }
    }

    /// Stable label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Counter(op) => match op {
                CounterOp::Get => "counter.get",
                CounterOp::Set(_) => "counter.set",
                CounterOp::AddAndGet(_) => "counter.add_and_get",
                CounterOp::GetAndAdd(_) => "counter.get_and_add",
                CounterOp::CompareAndSet { .. } => "counter.compare_and_set",
            },
            Operation::Reference(op) => match op {
                ReferenceOp::Get => "reference.get",
                ReferenceOp::Set(_) => "reference.set",
                ReferenceOp::GetAndSet(_) => "reference.get_and_set",
                ReferenceOp::CompareAndSet { .. } => "reference.compare_and_set",
                ReferenceOp::IsNull => "reference.is_null",
                ReferenceOp::Contains(_) => "reference.contains",
            },
            Operation::Map(op) => match op {
                MapOp::Put { .. } => "map.put",
                MapOp::Get { .. } => "map.get",
                MapOp::Remove { .. } => "map.remove",
                MapOp::ContainsKey { .. } => "map.contains_key",
            },
            Operation::Queue(op) => match op {
                QueueOp::Offer(_) => "queue.offer",
                QueueOp::Poll => "queue.poll",
                QueueOp::Peek => "queue.peek",
                QueueOp::Size => "queue.size",
            },
            Operation::Lock(op) => match op {
                LockOp::TryLock { .. } => "lock.try_lock",
                LockOp::Unlock { .. } => "lock.unlock",
                LockOp::ForceUnlock => "lock.force_unlock",
                LockOp::IsLocked => "lock.is_locked",
                LockOp::LockCount => "lock.lock_count",
            },
        }
    }

    /// Bytes hashed to pick the partition: the entry key for maps, the name otherwise.
    pub fn partition_key<'a>(&'a self, object: &'a ObjectId) -> &'a [u8] {
        match self {
            Operation::Map(MapOp::Put { key, .. })
            | Operation::Map(MapOp::Get { key })
            | Operation::Map(MapOp::Remove { key })
            | Operation::Map(MapOp::ContainsKey { key }) => key.as_slice(),
            _ => object.name.as_bytes(),
        }
    }

    /// Runs the operation on the primary's container.
    pub fn run(&self, object: &ObjectId, container: &mut Container) -> Result<RunOutcome> {
        match self {
            Operation::Counter(op) => run_counter(op, container),
            Operation::Reference(op) => run_reference(op, container),
            Operation::Map(op) => run_map(op, object, container),
            Operation::Queue(op) => run_queue(op, container),
            Operation::Lock(op) => run_lock(op, container),
        }
    }
}

fn run_counter(op: &CounterOp, container: &mut Container) -> Result<RunOutcome> {
    let counter = container.counter_mut()?;
    Ok(match *op {
        CounterOp::Get => RunOutcome::read(Response::Long(counter.get())),
        CounterOp::Set(value) => {
            counter.set(value);
            RunOutcome::write(Response::Unit, BackupOperation::CounterSet(value))
        }
        CounterOp::AddAndGet(delta) => {
            let new = counter.add(delta);
            RunOutcome::write(Response::Long(new), BackupOperation::CounterSet(new))
        }
        CounterOp::GetAndAdd(delta) => {
            let old = counter.get();
            let new = counter.add(delta);
            RunOutcome::write(Response::Long(old), BackupOperation::CounterSet(new))
        }
        CounterOp::CompareAndSet { expect, update } => {
            if counter.get() == expect {
                counter.set(update);
                RunOutcome::write(Response::Bool(true), BackupOperation::CounterSet(update))
            } else {
                RunOutcome::read(Response::Bool(false))
            }
        }
    })
}

fn run_reference(op: &ReferenceOp, container: &mut Container) -> Result<RunOutcome> {
    let reference = container.reference_mut()?;
    Ok(match op {
        ReferenceOp::Get => RunOutcome::read(Response::Value(reference.get().cloned())),
        ReferenceOp::Set(value) => {
            reference.set(value.clone());
            RunOutcome::write(Response::Unit, BackupOperation::ReferenceSet(value.clone()))
        }
        ReferenceOp::GetAndSet(value) => {
            let old = reference.set(value.clone());
            RunOutcome::write(
                Response::Value(old),
                BackupOperation::ReferenceSet(value.clone()),
            )
        }
        ReferenceOp::CompareAndSet { expect, update } => {
            if reference.get() == expect.as_ref() {
                reference.set(update.clone());
                RunOutcome::write(
                    Response::Bool(true),
                    BackupOperation::ReferenceSet(update.clone()),
                )
            } else {
                RunOutcome::read(Response::Bool(false))
            }
        }
        ReferenceOp::IsNull => RunOutcome::read(Response::Bool(reference.get().is_none())),
        ReferenceOp::Contains(value) => {
            RunOutcome::read(Response::Bool(reference.get() == value.as_ref()))
        }
    })
}

fn run_map(op: &MapOp, object: &ObjectId, container: &mut Container) -> Result<RunOutcome> {
    let map = container.map_mut()?;
    Ok(match op {
        MapOp::Put { key, value } => {
            if map.get(key).is_none() && !map.has_capacity() {
                return Err(GridError::CapacityExceeded {
                    object: object.name.clone(),
                    max: map.max_size().unwrap_or_default(),
                });
            }
            let old = map.put(key.clone(), value.clone());
            RunOutcome::write(
                Response::Value(old),
                BackupOperation::MapPut {
                    key: key.clone(),
                    value: value.clone(),
                },
            )
        }
        MapOp::Get { key } => RunOutcome::read(Response::Value(map.get(key).cloned())),
        MapOp::Remove { key } => match map.remove(key) {
            Some(old) => RunOutcome::write(
                Response::Value(Some(old)),
                BackupOperation::MapRemove { key: key.clone() },
            ),
            None => RunOutcome::read(Response::Value(None)),
        },
        MapOp::ContainsKey { key } => RunOutcome::read(Response::Bool(map.get(key).is_some())),
    })
}

fn run_queue(op: &QueueOp, container: &mut Container) -> Result<RunOutcome> {
    let queue = container.queue_mut()?;
    Ok(match op {
        QueueOp::Offer(item) => {
            if queue.has_capacity() {
                queue.push(item.clone());
                RunOutcome::write(Response::Bool(true), BackupOperation::QueueOffer(item.clone()))
            } else {
                RunOutcome::read(Response::Bool(false))
            }
        }
        QueueOp::Poll => match queue.pop() {
            Some(item) => RunOutcome::write(
                Response::Value(Some(item)),
                BackupOperation::QueuePoll,
            ),
            None => RunOutcome::read(Response::Value(None)),
        },
        QueueOp::Peek => RunOutcome::read(Response::Value(queue.peek().cloned())),
        QueueOp::Size => RunOutcome::read(Response::Long(queue.len() as i64)),
    })
}

fn run_lock(op: &LockOp, container: &mut Container) -> Result<RunOutcome> {
    let lock = container.lock_mut()?;
    Ok(match *op {
        LockOp::TryLock { owner } => match lock.owner() {
            Some(holder) if holder != owner => RunOutcome::read(Response::Bool(false)),
            _ => {
                let count = lock.count() + 1;
                lock.set(Some(owner), count);
                RunOutcome::write(
                    Response::Bool(true),
                    BackupOperation::LockSet {
                        owner: Some(owner),
                        count,
                    },
                )
            }
        },
        LockOp::Unlock { owner } => {
            if lock.owner() != Some(owner) {
                return Err(GridError::IllegalState {
                    msg: format!("{} does not hold the lock", owner),
                });
            }
            let count = lock.count() - 1;
            lock.set(Some(owner), count);
            RunOutcome::write(
                Response::Unit,
                BackupOperation::LockSet {
                    owner: lock.owner(),
                    count,
                },
            )
        }
        LockOp::ForceUnlock => {
            if lock.is_locked() {
                lock.set(None, 0);
                RunOutcome::write(
                    Response::Bool(true),
                    BackupOperation::LockSet {
                        owner: None,
                        count: 0,
                    },
                )
            } else {
                RunOutcome::read(Response::Bool(false))
            }
        }
        LockOp::IsLocked => RunOutcome::read(Response::Bool(lock.is_locked())),
        LockOp::LockCount => RunOutcome::read(Response::Long(lock.count() as i64)),
    })
}

impl BackupOperation {
    /// Kind of object the backup targets.
    pub fn kind(&self) -> ObjectKind {
        match self {
            BackupOperation::CounterSet(_) => ObjectKind::Counter,
            BackupOperation::ReferenceSet(_) => ObjectKind::Reference,
            BackupOperation::MapPut { .. } | BackupOperation::MapRemove { .. } => ObjectKind::Map,
            BackupOperation::QueueOffer(_) | BackupOperation::QueuePoll => ObjectKind::Queue,
            BackupOperation::LockSet { .. } => ObjectKind::Lock,
        }
    }

    /// Stable label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            BackupOperation::CounterSet(_) => "counter.set_backup",
            BackupOperation::ReferenceSet(_) => "reference.set_backup",
            BackupOperation::MapPut { .. } => "map.put_backup",
            BackupOperation::MapRemove { .. } => "map.remove_backup",
            BackupOperation::QueueOffer(_) => "queue.offer_backup",
            BackupOperation::QueuePoll => "queue.poll_backup",
            BackupOperation::LockSet { .. } => "lock.set_backup",
        }
    }

    /// Replays the primary's result on a replica container.
    pub fn apply(&self, container: &mut Container) -> Result<()> {
        match self {
            BackupOperation::CounterSet(value) => container.counter_mut()?.set(*value),
            BackupOperation::ReferenceSet(value) => {
                container.reference_mut()?.set(value.clone());
            }
            BackupOperation::MapPut { key, value } => {
                container.map_mut()?.put(key.clone(), value.clone());
            }
            BackupOperation::MapRemove { key } => {
                container.map_mut()?.remove(key);
            }
            BackupOperation::QueueOffer(item) => container.queue_mut()?.push(item.clone()),
            BackupOperation::QueuePoll => {
                container.queue_mut()?.pop();
            }
            BackupOperation::LockSet { owner, count } => container.lock_mut()?.set(*owner, *count),
        }
        Ok(())
    }
}
