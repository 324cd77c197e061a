//! Keyed single-flight: concurrent callers for the same key share one execution.
//!
//! The first caller for a key (the leader) builds the future and owns the slot.
//! Later callers clone the shared handle and await the same output. The slot is
//! released by a drop guard, so success, failure, and cancellation of the
//! leader all free it.

use crate::client::lock;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

type SharedFlight<V> = Shared<BoxFuture<'static, V>>;

struct Slots<K, V: Clone> {
    next_generation: u64,
    in_flight: HashMap<K, (u64, SharedFlight<V>)>,
}

pub struct SingleFlight<K, V: Clone> {
    slots: Arc<Mutex<Slots<K, V>>>,
}

impl<K, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_generation: 0,
                in_flight: HashMap::new(),
            })),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `make`.
    ///
    /// `make` is only called when no flight is in progress.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, _release) = {
            let mut slots = lock(&self.slots);
            if let Some((_, flight)) = slots.in_flight.get(&key) {
                (flight.clone(), None)
            } else {
                let generation = slots.next_generation;
                slots.next_generation = slots.next_generation.wrapping_add(1);
                let flight = make().boxed().shared();
                slots
                    .in_flight
                    .insert(key.clone(), (generation, flight.clone()));
                (
                    flight,
                    Some(SlotRelease {
                        slots: Arc::clone(&self.slots),
                        key,
                        generation,
                    }),
                )
            }
        };

        flight.await
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.slots).in_flight.contains_key(key)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.slots).in_flight.len()
    }
}

struct SlotRelease<K: Eq + Hash, V: Clone> {
    slots: Arc<Mutex<Slots<K, V>>>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V: Clone> Drop for SlotRelease<K, V> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        // A newer flight may already own the key.
        if slots
            .in_flight
            .get(&self.key)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            slots.in_flight.remove(&self.key);
        }
    }
}
