use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::{Error, Result},
    fod::query::QuerySignature,
    json::JsonList,
};

/// Decides whether a cached result set is too old to be served.
///
/// The cache lives as long as its connection and never evicts on its own;
/// plug a policy in to bound staleness.
///
/// # Example
///
/// ```rust,ignore
/// struct Never;
///
/// impl EvictionPolicy for Never {
///     fn is_expired(&self, _inserted_at: Instant) -> bool {
///         false
///     }
/// }
/// ```
pub trait EvictionPolicy: Send + Sync {
    /// Returns `true` when an entry stored at `inserted_at` must be recomputed.
    fn is_expired(&self, inserted_at: Instant) -> bool;
}

/// Keeps entries for the lifetime of the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn is_expired(&self, _inserted_at: Instant) -> bool {
        false
    }
}

/// Recomputes entries older than the given age.
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl EvictionPolicy for MaxAge {
    fn is_expired(&self, inserted_at: Instant) -> bool {
        inserted_at.elapsed() > self.0
    }
}

/// A merged result set and the moment it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub documents: Arc<JsonList>,
    pub inserted_at: Instant,
}

/// Outcome of one computation, as seen by the callers that waited for it.
type Outcome = std::result::Result<Arc<JsonList>, Arc<Error>>;

enum Slot {
    Ready(CacheEntry),
    Pending {
        flight: u64,
        outcome: watch::Receiver<Option<Outcome>>,
    },
}

enum Role<'a> {
    Hit(Arc<JsonList>),
    Wait(watch::Receiver<Option<Outcome>>),
    Lead(Flight<'a>),
}

/// Memoizes merged query results by [`QuerySignature`].
///
/// The first caller for a signature computes. Callers arriving while that
/// computation runs wait for it and receive its outcome, success or failure.
/// Only successes are stored: once a failed computation has been handed to
/// its waiters the signature is free again, and the next caller computes
/// from scratch.
pub struct ResponseCache {
    slots: Mutex<HashMap<QuerySignature, Slot>>,
    flights: AtomicU64,
    eviction: Box<dyn EvictionPolicy>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    /// Creates a cache that never evicts.
    pub fn new() -> Self {
        Self::with_eviction(Box::new(NeverEvict))
    }

    pub fn with_eviction(eviction: Box<dyn EvictionPolicy>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            flights: AtomicU64::new(0),
            eviction,
        }
    }

    /// Returns the cached documents for `signature`, running `compute` on a miss.
    ///
    /// # Arguments
    ///
    /// * `signature` - identity of the query whose merged result is wanted.
    /// * `compute` - fetches the full result; called at most once, and only
    ///   when no fresh entry and no running computation exist.
    ///
    /// # Errors
    ///
    /// The caller that ran `compute` gets its error back unchanged when
    /// nobody else was waiting. Callers that shared a failed computation get
    /// [`Error::Shared`]; use [`Error::root`] to look at the cause. Nothing is
    /// stored for a failure.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let documents = cache
    ///     .get_or_compute(&spec.signature(), || query.fetch_all())
    ///     .await?;
    /// ```
    pub async fn get_or_compute<F, Fut>(
        &self,
        signature: &QuerySignature,
        compute: F,
    ) -> Result<Arc<JsonList>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JsonList>>,
    {
        let flight = loop {
            match self.join(signature) {
                Role::Hit(documents) => {
                    debug!(%signature, "response cache hit");
                    return Ok(documents);
                }
                Role::Wait(mut outcome) => {
                    debug!(%signature, "waiting for running computation");
                    let shared = match outcome.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        // the computing caller went away; compete again
                        Err(_) => None,
                    };
                    if let Some(shared) = shared {
                        return shared.map_err(Error::Shared);
                    }
                }
                Role::Lead(flight) => break flight,
            }
        };

        debug!(%signature, "response cache miss");
        let result = compute().await;
        flight.finish(result)
    }

    /// Returns the fresh entry for `signature`, if one is stored.
    pub fn get(&self, signature: &QuerySignature) -> Option<CacheEntry> {
        match self.lock().get(signature) {
            Some(Slot::Ready(entry)) if !self.eviction.is_expired(entry.inserted_at) => {
                Some(entry.clone())
            }
            _ => None,
        }
    }

    /// Drops whatever is stored for `signature`. A computation still running
    /// for it completes for its waiters but is not stored.
    pub fn invalidate(&self, signature: &QuerySignature) -> bool {
        self.lock().remove(signature).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored result sets.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending { .. }))
            .count()
    }

    fn join(&self, signature: &QuerySignature) -> Role<'_> {
        let mut slots = self.lock();
        match slots.get(signature) {
            Some(Slot::Ready(entry)) if !self.eviction.is_expired(entry.inserted_at) => {
                return Role::Hit(Arc::clone(&entry.documents));
            }
            Some(Slot::Pending { outcome, .. }) => return Role::Wait(outcome.clone()),
            Some(Slot::Ready(_)) => debug!(%signature, "evicting stale cache entry"),
            None => {}
        }

        let flight = self.flights.fetch_add(1, Ordering::Relaxed);
        let (sender, outcome) = watch::channel(None);
        slots.insert(signature.clone(), Slot::Pending { flight, outcome });
        Role::Lead(Flight {
            cache: self,
            signature: signature.clone(),
            flight,
            sender,
            settled: false,
        })
    }

    /// Replaces the pending slot of `flight`, unless it was invalidated or
    /// taken over in the meantime.
    fn settle(&self, signature: &QuerySignature, flight: u64, replacement: Option<Slot>) {
        let mut slots = self.lock();
        let current = matches!(
            slots.get(signature),
            Some(Slot::Pending { flight: f, .. }) if *f == flight
        );
        if !current {
            return;
        }
        match replacement {
            Some(slot) => {
                slots.insert(signature.clone(), slot);
            }
            None => {
                slots.remove(signature);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QuerySignature, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The right to compute one signature. Dropping it unfinished frees the
/// signature and wakes the waiters, who then compete again.
struct Flight<'a> {
    cache: &'a ResponseCache,
    signature: QuerySignature,
    flight: u64,
    sender: watch::Sender<Option<Outcome>>,
    settled: bool,
}

impl Flight<'_> {
    fn finish(mut self, result: Result<JsonList>) -> Result<Arc<JsonList>> {
        self.settled = true;
        match result {
            Ok(documents) => {
                let documents = Arc::new(documents);
                let entry = CacheEntry {
                    documents: Arc::clone(&documents),
                    inserted_at: Instant::now(),
                };
                self.cache
                    .settle(&self.signature, self.flight, Some(Slot::Ready(entry)));
                self.sender.send_replace(Some(Ok(Arc::clone(&documents))));
                Ok(documents)
            }
            Err(e) => {
                debug!(signature = %self.signature, error = %e, "computation failed, not cached");
                let e = Arc::new(e);
                self.sender.send_replace(Some(Err(Arc::clone(&e))));
                self.cache.settle(&self.signature, self.flight, None);
                drop(self);
                // unshared failures keep their original shape
                Err(Arc::try_unwrap(e).unwrap_or_else(Error::Shared))
            }
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.settle(&self.signature, self.flight, None);
        }
    }
}
