//! In-memory item storage for one simulated node.
//!
//! Items live in per-partition maps, and a node owns exactly the partitions
//! it has a map for. Moving a partition between nodes moves its map.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    command::{ConcatMode, CounterDirection, Operation, StoreMode},
    protocol::{Request, Response, Status},
};

/// Largest value a node accepts, matching the usual 20 MiB item limit.
pub const DEFAULT_MAX_VALUE_LEN: usize = 20 * 1024 * 1024;

const DEFAULT_LOCK: Duration = Duration::from_secs(15);
const MAX_LOCK: Duration = Duration::from_secs(30);

pub type PartitionData = HashMap<Vec<u8>, Item>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    expires_at: Option<Instant>,
    locked_until: Option<Instant>,
}

impl Item {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// A locked item may only be changed by the holder of the lock's CAS.
    fn blocks(&self, cas: Option<u64>, now: Instant) -> bool {
        self.is_locked(now) && cas != Some(self.cas)
    }
}

#[derive(Debug)]
pub struct NodeStore {
    partitions: HashMap<u16, PartitionData>,
    next_cas: u64,
    max_value_len: usize,
}

impl NodeStore {
    pub fn new(owned: impl IntoIterator<Item = u16>) -> Self {
        Self::with_max_value_len(owned, DEFAULT_MAX_VALUE_LEN)
    }

    pub fn with_max_value_len(owned: impl IntoIterator<Item = u16>, max_value_len: usize) -> Self {
        Self {
            partitions: owned.into_iter().map(|p| (p, HashMap::new())).collect(),
            next_cas: 1,
            max_value_len,
        }
    }

    pub fn owns(&self, partition: u16) -> bool {
        self.partitions.contains_key(&partition)
    }

    pub fn owned_partitions(&self) -> Vec<u16> {
        let mut owned: Vec<_> = self.partitions.keys().copied().collect();
        owned.sort_unstable();
        owned
    }

    /// Number of live and not-yet-purged items across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gives up ownership of `partition`, handing back its items.
    pub fn release(&mut self, partition: u16) -> Option<PartitionData> {
        self.partitions.remove(&partition)
    }

    pub fn adopt(&mut self, partition: u16, data: PartitionData) {
        self.partitions.entry(partition).or_default().extend(data);
    }

    pub fn execute(&mut self, request: Request) -> Response {
        self.execute_at(request, Instant::now())
    }

    fn execute_at(&mut self, request: Request, now: Instant) -> Response {
        let opaque = request.opaque;
        if let Operation::FlushAll = request.operation {
            self.partitions.values_mut().for_each(HashMap::clear);
            return Response::success(opaque, 0);
        }

        let max_value_len = self.max_value_len;
        let next_cas = &mut self.next_cas;
        let Some(items) = self.partitions.get_mut(&request.partition) else {
            return Response::new(opaque, Status::NotMyPartition);
        };
        let mut fresh_cas = || {
            let cas = *next_cas;
            *next_cas += 1;
            cas
        };

        if let Some(key) = request.operation.key() {
            if items.get(key).is_some_and(|item| item.is_expired(now)) {
                items.remove(key);
            }
        }

        match request.operation {
            Operation::Get { key } => match items.get(&key) {
                Some(item) => {
                    // A locked item hides its real CAS from plain readers.
                    let cas = if item.is_locked(now) { u64::MAX } else { item.cas };
                    value_response(opaque, item, cas)
                }
                None => Response::new(opaque, Status::KeyNotFound),
            },

            Operation::GetAndTouch { key, expiry } => match items.get_mut(&key) {
                Some(item) if item.is_locked(now) => Response::new(opaque, Status::Locked),
                Some(item) => {
                    item.expires_at = expires_at(expiry, now);
                    value_response(opaque, item, item.cas)
                }
                None => Response::new(opaque, Status::KeyNotFound),
            },

            Operation::GetAndLock { key, lock_secs } => match items.get_mut(&key) {
                Some(item) if item.is_locked(now) => Response::new(opaque, Status::TemporaryFailure),
                Some(item) => {
                    let lock = match lock_secs {
                        0 => DEFAULT_LOCK,
                        secs => Duration::from_secs(u64::from(secs)).min(MAX_LOCK),
                    };
                    item.cas = fresh_cas();
                    item.locked_until = Some(now + lock);
                    value_response(opaque, item, item.cas)
                }
                None => Response::new(opaque, Status::KeyNotFound),
            },

            Operation::Unlock { key, cas } => match items.get_mut(&key) {
                None => Response::new(opaque, Status::KeyNotFound),
                Some(item) if !item.is_locked(now) => Response::new(opaque, Status::InvalidArguments),
                Some(item) if item.cas != cas => Response::new(opaque, Status::Locked),
                Some(item) => {
                    item.locked_until = None;
                    item.cas = fresh_cas();
                    Response::success(opaque, item.cas)
                }
            },

            Operation::Store {
                mode,
                key,
                value,
                flags,
                expiry,
                cas,
            } => {
                if value.len() > max_value_len {
                    return Response::new(opaque, Status::ValueTooLarge);
                }
                let existing = items.get(&key);
                if existing.is_some_and(|item| item.blocks(cas, now)) {
                    return Response::new(opaque, Status::Locked);
                }
                let status = match (mode, existing, cas) {
                    (StoreMode::Add, Some(_), _) => Some(Status::KeyExists),
                    (StoreMode::Replace, None, _) | (StoreMode::Set, None, Some(_)) => {
                        Some(Status::KeyNotFound)
                    }
                    (_, Some(item), Some(cas)) if item.cas != cas => Some(Status::KeyExists),
                    _ => None,
                };
                if let Some(status) = status {
                    return Response::new(opaque, status);
                }

                let cas = fresh_cas();
                items.insert(
                    key,
                    Item {
                        value,
                        flags,
                        cas,
                        expires_at: expires_at(expiry, now),
                        locked_until: None,
                    },
                );
                Response::success(opaque, cas)
            }

            Operation::Concat {
                mode,
                key,
                value,
                cas,
            } => {
                let Some(item) = items.get_mut(&key) else {
                    return Response::new(opaque, Status::NotStored);
                };
                if item.blocks(cas, now) {
                    return Response::new(opaque, Status::Locked);
                }
                if cas.is_some_and(|cas| cas != item.cas) {
                    return Response::new(opaque, Status::KeyExists);
                }
                if item.value.len() + value.len() > max_value_len {
                    return Response::new(opaque, Status::ValueTooLarge);
                }
                match mode {
                    ConcatMode::Append => item.value.extend_from_slice(&value),
                    ConcatMode::Prepend => {
                        item.value.splice(0..0, value);
                    }
                }
                item.cas = fresh_cas();
                item.locked_until = None;
                Response::success(opaque, item.cas)
            }

            Operation::Counter {
                direction,
                key,
                delta,
                initial,
                expiry,
            } => {
                let Some(item) = items.get_mut(&key) else {
                    let Some(initial) = initial else {
                        return Response::new(opaque, Status::KeyNotFound);
                    };
                    let cas = fresh_cas();
                    items.insert(
                        key,
                        Item {
                            value: initial.to_string().into_bytes(),
                            flags: 0,
                            cas,
                            expires_at: expires_at(expiry, now),
                            locked_until: None,
                        },
                    );
                    return counter_response(opaque, initial, cas);
                };
                if item.is_locked(now) {
                    return Response::new(opaque, Status::Locked);
                }
                let Some(current) = std::str::from_utf8(&item.value)
                    .ok()
                    .and_then(|text| text.trim().parse::<u64>().ok())
                else {
                    return Response::new(opaque, Status::DeltaBadValue);
                };
                let next = match direction {
                    CounterDirection::Increment => current.wrapping_add(delta),
                    CounterDirection::Decrement => current.saturating_sub(delta),
                };
                item.value = next.to_string().into_bytes();
                item.cas = fresh_cas();
                counter_response(opaque, next, item.cas)
            }

            Operation::Delete { key, cas } => {
                let Some(item) = items.get(&key) else {
                    return Response::new(opaque, Status::KeyNotFound);
                };
                if item.blocks(cas, now) {
                    return Response::new(opaque, Status::Locked);
                }
                if cas.is_some_and(|cas| cas != item.cas) {
                    return Response::new(opaque, Status::KeyExists);
                }
                items.remove(&key);
                Response::success(opaque, fresh_cas())
            }

            Operation::Touch { key, expiry } => match items.get_mut(&key) {
                None => Response::new(opaque, Status::KeyNotFound),
                Some(item) if item.is_locked(now) => Response::new(opaque, Status::Locked),
                Some(item) => {
                    item.expires_at = expires_at(expiry, now);
                    Response::success(opaque, item.cas)
                }
            },

            Operation::FlushAll => Response::success(opaque, 0),
        }
    }
}

fn expires_at(expiry: u32, now: Instant) -> Option<Instant> {
    (expiry > 0).then(|| now + Duration::from_secs(u64::from(expiry)))
}

fn value_response(opaque: u64, item: &Item, cas: u64) -> Response {
    Response {
        cas,
        flags: item.flags,
        value: Some(item.value.clone()),
        ..Response::new(opaque, Status::Success)
    }
}

fn counter_response(opaque: u64, value: u64, cas: u64) -> Response {
    Response {
        counter: Some(value),
        ..Response::success(opaque, cas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(partition: u16, operation: Operation) -> Request {
        Request {
            opaque: 1,
            partition,
            operation,
        }
    }

    fn set(key: &str, value: &str) -> Operation {
        Operation::Store {
            mode: StoreMode::Set,
            key: key.into(),
            value: value.into(),
            flags: 3,
            expiry: 0,
            cas: None,
        }
    }

    fn get(key: &str) -> Operation {
        Operation::Get { key: key.into() }
    }

    #[test]
    fn unowned_partition_is_refused() {
        let mut store = NodeStore::new([0]);
        let response = store.execute(request(1, get("k")));
        assert_eq!(response.status, Status::NotMyPartition);
    }

    #[test]
    fn set_then_get() {
        let mut store = NodeStore::new([0]);
        let stored = store.execute(request(0, set("k", "v")));
        assert_eq!(stored.status, Status::Success);

        let fetched = store.execute(request(0, get("k")));
        assert_eq!(fetched.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(fetched.flags, 3);
        assert_eq!(fetched.cas, stored.cas);
    }

    #[test]
    fn add_and_replace_respect_existence() {
        let mut store = NodeStore::new([0]);
        let add = |store: &mut NodeStore| {
            store.execute(request(
                0,
                Operation::Store {
                    mode: StoreMode::Add,
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                    flags: 0,
                    expiry: 0,
                    cas: None,
                },
            ))
        };
        let replace = Operation::Store {
            mode: StoreMode::Replace,
            key: b"other".to_vec(),
            value: b"v".to_vec(),
            flags: 0,
            expiry: 0,
            cas: None,
        };

        assert_eq!(add(&mut store).status, Status::Success);
        assert_eq!(add(&mut store).status, Status::KeyExists);
        assert_eq!(store.execute(request(0, replace)).status, Status::KeyNotFound);
    }

    #[test]
    fn cas_mismatch_is_rejected() {
        let mut store = NodeStore::new([0]);
        let stored = store.execute(request(0, set("k", "v1")));
        let with_cas = |cas| Operation::Store {
            mode: StoreMode::Set,
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
            flags: 0,
            expiry: 0,
            cas: Some(cas),
        };

        let stale = store.execute(request(0, with_cas(stored.cas + 100)));
        assert_eq!(stale.status, Status::KeyExists);
        let fresh = store.execute(request(0, with_cas(stored.cas)));
        assert_eq!(fresh.status, Status::Success);
        assert!(fresh.cas > stored.cas);
    }

    #[test]
    fn counters_parse_decimal_and_floor_at_zero() {
        let mut store = NodeStore::new([0]);
        let counter = |direction, initial| Operation::Counter {
            direction,
            key: b"n".to_vec(),
            delta: 5,
            initial,
            expiry: 0,
        };

        let missing = store.execute(request(0, counter(CounterDirection::Increment, None)));
        assert_eq!(missing.status, Status::KeyNotFound);

        let created = store.execute(request(0, counter(CounterDirection::Increment, Some(3))));
        assert_eq!(created.counter, Some(3));
        let bumped = store.execute(request(0, counter(CounterDirection::Increment, None)));
        assert_eq!(bumped.counter, Some(8));
        store.execute(request(0, counter(CounterDirection::Decrement, None)));
        let floored = store.execute(request(0, counter(CounterDirection::Decrement, None)));
        assert_eq!(floored.counter, Some(0));

        store.execute(request(0, set("text", "abc")));
        let bad = store.execute(request(
            0,
            Operation::Counter {
                direction: CounterDirection::Increment,
                key: b"text".to_vec(),
                delta: 1,
                initial: None,
                expiry: 0,
            },
        ));
        assert_eq!(bad.status, Status::DeltaBadValue);
    }

    #[test]
    fn locked_item_needs_its_cas() {
        let mut store = NodeStore::new([0]);
        store.execute(request(0, set("k", "v")));
        let locked = store.execute(request(
            0,
            Operation::GetAndLock {
                key: b"k".to_vec(),
                lock_secs: 5,
            },
        ));
        assert_eq!(locked.status, Status::Success);

        assert_eq!(store.execute(request(0, set("k", "other"))).status, Status::Locked);
        assert_eq!(store.execute(request(0, get("k"))).cas, u64::MAX);

        let unlocked = store.execute(request(
            0,
            Operation::Unlock {
                key: b"k".to_vec(),
                cas: locked.cas,
            },
        ));
        assert_eq!(unlocked.status, Status::Success);
        assert_eq!(store.execute(request(0, set("k", "other"))).status, Status::Success);
    }

    #[test]
    fn expired_items_vanish() {
        let mut store = NodeStore::new([0]);
        let now = Instant::now();
        store.execute_at(
            request(
                0,
                Operation::Store {
                    mode: StoreMode::Set,
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                    flags: 0,
                    expiry: 1,
                    cas: None,
                },
            ),
            now,
        );

        let later = now + Duration::from_secs(2);
        assert_eq!(store.execute_at(request(0, get("k")), later).status, Status::KeyNotFound);
        assert!(store.is_empty());
    }

    #[test]
    fn append_requires_existing_item_and_respects_limit() {
        let mut store = NodeStore::with_max_value_len([0], 4);
        let append = |value: &str| Operation::Concat {
            mode: ConcatMode::Append,
            key: b"k".to_vec(),
            value: value.into(),
            cas: None,
        };

        assert_eq!(store.execute(request(0, append("x"))).status, Status::NotStored);
        store.execute(request(0, set("k", "ab")));
        assert_eq!(store.execute(request(0, append("c"))).status, Status::Success);
        assert_eq!(store.execute(request(0, append("de"))).status, Status::ValueTooLarge);
        assert_eq!(
            store.execute(request(0, get("k"))).value.as_deref(),
            Some(&b"abc"[..])
        );
    }

    #[test]
    fn released_partition_moves_its_items() {
        let mut from = NodeStore::new([0, 1]);
        let mut to = NodeStore::new([2]);
        from.execute(request(1, set("k", "v")));

        let data = from.release(1).expect("owned");
        to.adopt(1, data);

        assert_eq!(from.execute(request(1, get("k"))).status, Status::NotMyPartition);
        assert_eq!(to.execute(request(1, get("k"))).status, Status::Success);
        assert_eq!(to.owned_partitions(), vec![1, 2]);
    }
}
