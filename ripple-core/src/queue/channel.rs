//! Channel
//!
//! A channel hands out exclusive, ordered access to lanes. Each key gets its
//! own lane; there is also one channel-wide FIFO lane that is independent of
//! every key.
//!
//! # Acquire / Resume
//!
//! 1. [`Channel::key`] registers the request immediately (synchronously), so
//!    the order of `key` calls is the order of admission.
//!
//! 2. Awaiting the returned [`Acquire`] yields a [`Permit`] once every earlier
//!    request on the same lane has been released.
//!
//! 3. [`Permit::resume`] consumes the permit and admits the next waiter.
//!    Dropping a permit releases it too, so a panicking holder cannot lock
//!    the lane forever.
//!
//! # Liveness
//!
//! Every request gets a ticket. The lane remembers the ticket of its most
//! recent request; [`Permit::is_last_on_q`] compares against it. A holder
//! that has been superseded can abandon its work voluntarily. Closing the
//! channel makes every liveness check report `false`.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{BoxError, Error, Result};

/// Bound for channel keys.
pub trait LaneKey: Clone + Eq + Hash {}

impl<K: Clone + Eq + Hash> LaneKey for K {}

/// A lane inside a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lane<K> {
    /// The channel-wide FIFO lane.
    Fifo,
    /// A per-key lane.
    Key(K),
}

struct Waiter<K: LaneKey> {
    ticket: u64,
    tx: oneshot::Sender<Permit<K>>,
}

/// State of a lane that currently has a holder.
///
/// A lane with no holder has no entry at all.
struct LaneState<K: LaneKey> {
    /// Ticket of the most recent request.
    latest: u64,
    /// Requests waiting for admission, oldest first.
    waiters: VecDeque<Waiter<K>>,
}

struct Shared<K: LaneKey> {
    open: AtomicBool,
    tickets: AtomicU64,
    lanes: Mutex<HashMap<Lane<K>, LaneState<K>>>,
}

impl<K> Shared<K>
where
    K: LaneKey,
{
    fn enter(self: &Arc<Self>, lane: Lane<K>) -> Acquire<K> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let mut lanes = self.lanes.lock();

        match lanes.entry(lane.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(LaneState {
                    latest: ticket,
                    waiters: VecDeque::new(),
                });
                Acquire {
                    state: AcquireState::Ready(Some(Permit::new(Arc::clone(self), lane, ticket))),
                }
            }
            Entry::Occupied(mut occupied) => {
                let (tx, rx) = oneshot::channel();
                let state = occupied.get_mut();
                state.latest = ticket;
                state.waiters.push_back(Waiter { ticket, tx });
                debug!(ticket, waiting = state.waiters.len(), "lane busy, request queued");
                Acquire {
                    state: AcquireState::Waiting(rx),
                }
            }
        }
    }

    /// Hand the lane to the next live waiter, or retire it.
    fn release(self: &Arc<Self>, lane: &Lane<K>) {
        loop {
            let waiter = {
                let mut lanes = self.lanes.lock();
                let Some(state) = lanes.get_mut(lane) else {
                    return;
                };
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        lanes.remove(lane);
                        return;
                    }
                }
            };

            let permit = Permit::new(Arc::clone(self), lane.clone(), waiter.ticket);
            match waiter.tx.send(permit) {
                Ok(()) => return,
                Err(mut orphan) => {
                    // The waiter stopped listening; skip it without recursing
                    // through the permit's drop.
                    debug!(ticket = waiter.ticket, "skipping abandoned waiter");
                    orphan.armed = false;
                }
            }
        }
    }

    fn is_latest(&self, lane: &Lane<K>, ticket: u64) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .lanes
                .lock()
                .get(lane)
                .is_some_and(|state| state.latest == ticket)
    }
}

/// Keyed mutual exclusion with a channel-wide FIFO lane.
///
/// # Example
///
/// ```rust,ignore
/// let channel = Channel::new();
///
/// let permit = channel.key("user:1").await?;
/// if permit.is_last_on_q() {
///     save().await;
/// }
/// permit.resume();
/// ```
pub struct Channel<K: LaneKey> {
    shared: Arc<Shared<K>>,
}

impl<K> Channel<K>
where
    K: LaneKey,
{
    /// Create a new, open channel.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                open: AtomicBool::new(true),
                tickets: AtomicU64::new(0),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Request the lane for `id`.
    ///
    /// The request is queued as soon as this returns; await the result to be
    /// admitted.
    pub fn key(&self, id: K) -> Acquire<K> {
        self.shared.enter(Lane::Key(id))
    }

    /// Request the channel-wide FIFO lane.
    pub fn fifo(&self) -> Acquire<K> {
        self.shared.enter(Lane::Fifo)
    }

    /// Run `body` while holding the lane for `id`.
    ///
    /// The lane is released whether the body succeeds, fails, or panics.
    pub async fn callback<T, E, F, Fut>(&self, id: K, body: F) -> Result<T>
    where
        F: FnOnce(Liveness<K>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.key(id).await?;
        run_holding(permit, body).await
    }

    /// Run `body` while holding the channel-wide FIFO lane.
    pub async fn fifo_callback<T, E, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Liveness<K>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let permit = self.fifo().await?;
        run_holding(permit, body).await
    }

    /// Close the channel: every liveness check reports `false` until it is
    /// reopened. Admission order is unaffected.
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
    }

    /// Reopen a closed channel.
    pub fn open(&self) {
        self.shared.open.store(true, Ordering::SeqCst);
    }

    /// Check whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Check whether the lane for `id` currently has a holder.
    pub fn is_busy(&self, id: &K) -> bool {
        self.shared.lanes.lock().contains_key(&Lane::Key(id.clone()))
    }

    /// Number of requests waiting (not yet admitted) on the lane for `id`.
    pub fn waiting(&self, id: &K) -> usize {
        self.shared
            .lanes
            .lock()
            .get(&Lane::Key(id.clone()))
            .map_or(0, |state| state.waiters.len())
    }

    /// Number of lanes (including the FIFO lane) that have a holder.
    pub fn active_lanes(&self) -> usize {
        self.shared.lanes.lock().len()
    }
}

async fn run_holding<K, T, E, F, Fut>(permit: Permit<K>, body: F) -> Result<T>
where
    K: LaneKey,
    F: FnOnce(Liveness<K>) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    let result = body(permit.liveness()).await;
    permit.resume();
    result.map_err(Error::task)
}

impl<K: LaneKey> Clone for Channel<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> Default for Channel<K>
where
    K: LaneKey,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LaneKey> fmt::Debug for Channel<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("open", &self.shared.open.load(Ordering::SeqCst))
            .field("active_lanes", &self.shared.lanes.lock().len())
            .finish()
    }
}

/// A pending lane request. Resolves once into a [`Permit`].
///
/// Dropping an unresolved request withdraws it from the lane.
#[must_use = "a lane request does nothing unless awaited"]
pub struct Acquire<K: LaneKey> {
    state: AcquireState<K>,
}

enum AcquireState<K: LaneKey> {
    Ready(Option<Permit<K>>),
    Waiting(oneshot::Receiver<Permit<K>>),
}

// No field is ever pinned structurally.
impl<K: LaneKey> Unpin for Acquire<K> {}

impl<K> Future for Acquire<K>
where
    K: LaneKey,
{
    type Output = Result<Permit<K>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            AcquireState::Ready(permit) => Poll::Ready(permit.take().ok_or(Error::Abandoned)),
            AcquireState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| Error::Abandoned)),
        }
    }
}

/// Exclusive hold on a lane.
///
/// Consume it with [`Permit::resume`] to admit the next waiter.
#[must_use = "dropping a permit releases the lane immediately"]
pub struct Permit<K: LaneKey> {
    shared: Arc<Shared<K>>,
    lane: Lane<K>,
    ticket: u64,
    armed: bool,
    resumed: bool,
}

impl<K> Permit<K>
where
    K: LaneKey,
{
    fn new(shared: Arc<Shared<K>>, lane: Lane<K>, ticket: u64) -> Self {
        Self {
            shared,
            lane,
            ticket,
            armed: true,
            resumed: false,
        }
    }

    /// Release the lane and admit the next waiter.
    pub fn resume(mut self) {
        self.resumed = true;
    }

    /// Whether no newer request for this lane exists and the channel is open.
    pub fn is_last_on_q(&self) -> bool {
        self.shared.is_latest(&self.lane, self.ticket)
    }

    /// A detached handle for liveness checks, e.g. to move into a task body.
    pub fn liveness(&self) -> Liveness<K> {
        Liveness {
            shared: Arc::clone(&self.shared),
            lane: self.lane.clone(),
            ticket: self.ticket,
        }
    }

    /// Ticket assigned to this request.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl<K> Drop for Permit<K>
where
    K: LaneKey,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if !self.resumed {
            debug!(ticket = self.ticket, "permit dropped without resume, releasing lane");
        }
        self.shared.release(&self.lane);
    }
}

impl<K> fmt::Debug for Permit<K>
where
    K: LaneKey,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("ticket", &self.ticket)
            .field("fifo", &matches!(self.lane, Lane::Fifo))
            .finish()
    }
}

/// Liveness probe for a request, detached from the permit itself.
pub struct Liveness<K: LaneKey> {
    shared: Arc<Shared<K>>,
    lane: Lane<K>,
    ticket: u64,
}

impl<K> Liveness<K>
where
    K: LaneKey,
{
    /// Whether no newer request for this lane exists and the channel is open.
    ///
    /// Always `false` once the lane has been released.
    pub fn is_last_on_q(&self) -> bool {
        self.shared.is_latest(&self.lane, self.ticket)
    }
}

impl<K: LaneKey> Clone for Liveness<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            lane: self.lane.clone(),
            ticket: self.ticket,
        }
    }
}
