//! Token-correlated pending requests.
//!
//! ```text
//! caller:   register(token) ─► send request ─► wait() ──────────► result
//! receiver:                         response(token) ─► fulfill(token)
//! teardown:                                           fail_all() ─► ConnectionClosed
//! ```
//!
//! A [`Registration`] removes its slot when dropped, so a caller that gives
//! up (timeout, cancelled future) frees the token before it can be reused.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{PebblewireError, Result};

struct Slot<V> {
    generation: u64,
    tx: oneshot::Sender<Result<V>>,
}

struct Slots<K, V> {
    slots: HashMap<K, Slot<V>>,
    next_generation: u64,
    closed: bool,
}

/// Map from correlation token to a single-fulfillment result slot.
pub struct PendingRequests<K, V> {
    state: Mutex<Slots<K, V>>,
}

impl<K, V> PendingRequests<K, V>
where
    K: Copy + Eq + Hash + Into<u32>,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Slots {
                slots: HashMap::new(),
                next_generation: 0,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `token`. Fails if it is already in flight or the connection is gone.
    pub fn register(self: &Arc<Self>, token: K) -> Result<Registration<K, V>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(PebblewireError::ConnectionClosed);
        }
        if state.slots.contains_key(&token) {
            return Err(PebblewireError::DuplicateToken(token.into()));
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.slots.insert(token, Slot { generation, tx });
        Ok(Registration {
            owner: self.clone(),
            token,
            generation,
            rx: Some(rx),
        })
    }

    /// Complete the request for `token`. Returns false if nobody is waiting.
    pub fn fulfill(&self, token: K, value: V) -> bool {
        let slot = self.lock().slots.remove(&token);
        match slot {
            Some(slot) => slot.tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("failing {} pending requests", drained.len());
        }
        for slot in drained {
            let _ = slot.tx.send(Err(PebblewireError::ConnectionClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn release(&self, token: K, generation: u64) {
        let mut state = self.lock();
        if state
            .slots
            .get(&token)
            .is_some_and(|slot| slot.generation == generation)
        {
            state.slots.remove(&token);
        }
    }
}

/// A claimed token. Await it with [`Registration::wait`].
pub struct Registration<K, V>
where
    K: Copy + Eq + Hash + Into<u32>,
{
    owner: Arc<PendingRequests<K, V>>,
    token: K,
    generation: u64,
    rx: Option<oneshot::Receiver<Result<V>>>,
}

impl<K, V> Registration<K, V>
where
    K: Copy + Eq + Hash + Into<u32>,
{
    pub fn token(&self) -> K {
        self.token
    }

    /// Wait for the response, giving up after `timeout` if one is set.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<V> {
        let Some(rx) = self.rx.take() else {
            return Err(PebblewireError::ConnectionClosed);
        };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(PebblewireError::RequestTimeout),
            },
            None => rx.await,
        };
        outcome.map_err(|_| PebblewireError::ConnectionClosed)?
    }
}

impl<K, V> Drop for Registration<K, V>
where
    K: Copy + Eq + Hash + Into<u32>,
{
    fn drop(&mut self) {
        self.owner.release(self.token, self.generation);
    }
}
