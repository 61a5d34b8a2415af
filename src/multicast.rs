use crate::mono_time_ns;
use crossbeam_utils::CachePadded;
use log::{debug, error, trace};
use std::cell::Cell;
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;

// Activity of the committer.
const RESTING: u32 = 0;
const WORKING: u32 = 1;

// Activity of the endpoint table.
const IDLING: u32 = 0;
const ENUMERATING: u32 = 1;
const CREATING: u32 = 2;

// Lifecycle of the channel and of each endpoint.
const ACTIVE: u64 = 0;
const CANCELED: u64 = 1;
const CLOSED: u64 = 2;

/// Cursor of an endpoint that no longer participates in window
/// constraints. A record whose cursor is parked does not hold back the
/// write window and can be revived by [`Channel::new_endpoint`].
const PARKED: u64 = u64::MAX;

/// Pass to [`Channel::new_endpoint`] to replay as many of the previously
/// sent values as the buffer still holds.
pub const REPLAY_ALL: u64 = u64::MAX;

// Wait ladder thresholds, measured against the reader's last activity.
const CLOSE_GRACE_NS: u64 = 1_000_000;
const DEEP_SLEEP_NS: u64 = 250_000_000;

// Bound on one condition-variable sleep. Producers broadcast without
// holding the lock, so a wake racing a sleeper can be missed; the timeout
// turns that into a bounded re-check instead of a hang.
const WAKE_RECHECK: Duration = Duration::from_millis(250);

/// Errors returned by channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// `new_endpoint` found neither a free nor a parked endpoint record.
    #[error("out of endpoints")]
    OutOfEndpoints,
}

/// Opaque error payload attached by [`Channel::close`] and surfaced to
/// every endpoint exactly once through the terminal `for_each` call.
pub type CloseReason = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Creates a multicast bounded ring-buffer channel.
///
/// Unlike a regular MPMC queue, every endpoint created on the channel
/// observes every value published while it was attached: values are
/// broadcast, not distributed. Slow endpoints exert backpressure by
/// preventing the write window from advancing past them.
///
/// # Capacity
///
/// `buffer_capacity` is rounded up to the next power of two, with a
/// minimum of 1, and that value becomes the ring's effective capacity.
/// The rounding keeps wrap-around a single bit-mask operation.
///
/// `endpoint_capacity` fixes the number of endpoint records for the
/// lifetime of the channel. Records are recycled: an endpoint that was
/// canceled, or that drained the buffer after close, frees its record for
/// the next [`Channel::new_endpoint`] call. No per-endpoint allocation
/// happens after construction.
///
/// # Returns
///
/// A cloneable [`Channel`] handle. Clones share the same ring; any clone
/// may send, close, or create endpoints.
pub fn channel<T: Clone + Default + Send>(
    buffer_capacity: usize,
    endpoint_capacity: usize,
) -> Channel<T> {
    Channel {
        core: Core::new(buffer_capacity, endpoint_capacity),
    }
}

/// Ring buffer slot.
///
/// `written` is the publish marker: odd means a producer has published
/// the slot but the committer has not folded it yet, with the publish
/// timestamp (nanoseconds since channel start) in the high bits. The
/// committer clears the low bit as it folds, leaving the raw timestamp
/// shifted left by one for the age filter. Zero means the slot was never
/// timestamped, which is how the single-producer fast path leaves it.
///
/// Both fields are cache padded to keep producer, committer and reader
/// traffic on distinct lines.
#[derive(Debug, Default)]
#[repr(C)]
struct Slot<T> {
    written: CachePadded<AtomicI64>,
    value: CachePadded<T>,
}

/// Heap-allocated ring of [`Slot`]s.
///
/// The memory is owned by a boxed slice but also exposed as a raw pointer
/// for lock-free indexing. The raw pointer always refers to the same
/// allocation as the boxed slice, and the slice ensures deallocation when
/// the channel is dropped.
#[derive(Debug)]
struct Ring<T> {
    /// Owns the slot storage; freed when the channel is dropped.
    _boxed: Box<[Slot<T>]>,

    /// Raw pointer to the first slot of the same allocation.
    ptr: NonNull<Slot<T>>,

    /// Effective capacity (a power of two, at least 1).
    capacity: usize,

    /// Maps positions into slot indices; equal to `capacity - 1`.
    mask: u64,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Default> Ring<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut v: Vec<Slot<T>> = Vec::with_capacity(capacity);
        v.resize_with(capacity, Slot::default);
        let boxed = v.into_boxed_slice();
        let ptr = unsafe { NonNull::new_unchecked(boxed.as_ptr() as *mut Slot<T>) };
        Self {
            _boxed: boxed,
            ptr,
            capacity,
            mask: capacity as u64 - 1,
        }
    }
}

impl<T> Ring<T> {
    /// Returns the slot a position maps to.
    ///
    /// # Safety
    ///
    /// The caller must hold the position inside the protocol's read
    /// window so no producer is concurrently writing the slot's value.
    #[inline(always)]
    unsafe fn slot(&self, position: u64) -> &Slot<T> {
        unsafe { self.ptr.add((position & self.mask) as usize).as_ref() }
    }

    /// Returns a uniquely borrowed slot for a reserved position.
    ///
    /// # Safety
    ///
    /// The caller must own the reservation for `position`: no other
    /// producer may hold the same position, and no reader cursor may be
    /// at or behind the physical slot it maps to.
    #[inline(always)]
    unsafe fn slot_mut(&self, position: u64) -> &mut Slot<T> {
        unsafe { self.ptr.add((position & self.mask) as usize).as_mut() }
    }
}

/// One record in the endpoint table.
///
/// Records are never deallocated. A canceled or drained endpoint parks
/// its cursor, and `new_endpoint` revives parked records in place.
#[derive(Debug)]
struct EndpointRecord {
    cursor: CachePadded<AtomicU64>,
    state: CachePadded<AtomicU64>,
}

impl EndpointRecord {
    fn unused() -> Self {
        Self {
            cursor: CachePadded::new(AtomicU64::new(PARKED)),
            state: CachePadded::new(AtomicU64::new(ACTIVE)),
        }
    }
}

/// Fixed-capacity endpoint table with a three-state activity guard.
///
/// `creating` (structural change) excludes everything; at most one
/// `enumerating` scan runs at a time. `len` is a watermark: records below
/// it have been handed out at least once.
#[derive(Debug)]
struct EndpointTable {
    entry: Box<[EndpointRecord]>,
    len: AtomicU32,
    activity: CachePadded<AtomicU32>,
}

/// Resets the table activity to `idling` on drop, including on panic.
struct ActivityGuard<'a>(&'a AtomicU32);

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.0.store(IDLING, Ordering::Release);
    }
}

impl EndpointTable {
    fn new(capacity: usize) -> Self {
        let mut v = Vec::with_capacity(capacity);
        v.resize_with(capacity, EndpointRecord::unused);
        Self {
            entry: v.into_boxed_slice(),
            len: AtomicU32::new(0),
            activity: CachePadded::new(AtomicU32::new(IDLING)),
        }
    }

    fn capacity(&self) -> usize {
        self.entry.len()
    }

    /// Spin-yields until the table is claimed for `activity`.
    ///
    /// Returns the release guard and whether the claim contended with
    /// another claimant.
    fn claim(&self, activity: u32) -> (ActivityGuard<'_>, bool) {
        let mut contended = false;
        while self
            .activity
            .compare_exchange(IDLING, activity, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
            contended = true;
        }
        (ActivityGuard(&self.activity), contended)
    }
}

/// Broadcast-wake primitive backing the deep-sleep rung of the reader
/// wait ladder.
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn broadcast(&self) {
        self.cond.notify_all();
    }

    fn wait(&self) {
        let guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = self.cond.wait_timeout(guard, WAKE_RECHECK);
    }
}

/// Shared channel state. One allocation, created at construction.
struct Core<T> {
    ring: Ring<T>,
    begin: CachePadded<AtomicU64>,
    end: CachePadded<AtomicU64>,
    commit: CachePadded<AtomicU64>,
    write: CachePadded<AtomicU64>,
    channel_state: CachePadded<AtomicU64>,
    committer_activity: CachePadded<AtomicU32>,
    endpoints: EndpointTable,
    err: OnceLock<CloseReason>,
    start_ns: u64,
    receivers: Signal,
}

impl<T: Clone + Default + Send> Core<T> {
    fn new(buffer_capacity: usize, endpoint_capacity: usize) -> Arc<Self> {
        let ring = Ring::new(buffer_capacity);
        let size = ring.capacity as u64;
        debug!(
            "multicast channel: {} slots, {} endpoint records",
            size, endpoint_capacity
        );
        Arc::new(Self {
            ring,
            begin: CachePadded::new(AtomicU64::new(0)),
            end: CachePadded::new(AtomicU64::new(size)),
            commit: CachePadded::new(AtomicU64::new(0)),
            write: CachePadded::new(AtomicU64::new(0)),
            channel_state: CachePadded::new(AtomicU64::new(ACTIVE)),
            committer_activity: CachePadded::new(AtomicU32::new(RESTING)),
            endpoints: EndpointTable::new(endpoint_capacity),
            err: OnceLock::new(),
            start_ns: mono_time_ns(),
            receivers: Signal::new(),
        })
    }

    /// Nanoseconds since the channel was constructed.
    #[inline(always)]
    fn nanos_since_start(&self) -> i64 {
        (mono_time_ns() - self.start_ns) as i64
    }

    /// Slides the write window forward past slots every endpoint has
    /// already read.
    ///
    /// Called by producers that found the ring full. Under the
    /// enumeration guard, the slowest non-parked cursor bounds how far
    /// `begin`/`end` may move. On a tiny ring the window steps by one so
    /// a reader sitting right past `begin` still lets it creep forward.
    ///
    /// Returns `false` when no progress was possible and the channel has
    /// been closed, which tells the producer to abandon the send.
    fn slide_buffer(&self) -> bool {
        let mut slowest = PARKED;
        let contended;
        {
            let (_guard, was_contended) = self.endpoints.claim(ENUMERATING);
            contended = was_contended;
            let len = self.endpoints.len.load(Ordering::Acquire) as usize;
            for record in &self.endpoints.entry[..len] {
                let cursor = record.cursor.load(Ordering::Acquire);
                if cursor < slowest {
                    slowest = cursor;
                }
            }
            if self.begin.load(Ordering::Acquire) < slowest
                && slowest <= self.end.load(Ordering::Acquire)
            {
                if self.ring.mask < 16 {
                    self.begin.fetch_add(1, Ordering::AcqRel);
                    self.end.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.begin.store(slowest, Ordering::Release);
                    self.end.store(slowest + self.ring.mask + 1, Ordering::Release);
                }
            } else {
                slowest = PARKED;
            }
        }
        if slowest == PARKED {
            if !contended {
                // Uncontended and still no room: the ring is genuinely
                // full, give the readers the processor.
                std::thread::yield_now();
            }
            if self.channel_state.load(Ordering::Acquire) != ACTIVE {
                return false;
            }
        }
        true
    }

    /// Folds contiguous published reservations into `commit`.
    ///
    /// Any reader may call this at any time; the committer mutex keeps at
    /// most one fold running. `commit` only ever advances over a
    /// contiguous, fully published prefix, so publish completion racing
    /// out of reservation order never becomes visible to readers.
    fn commit_data(&self) -> u64 {
        let commit = self.commit.load(Ordering::Acquire);
        if commit >= self.write.load(Ordering::Acquire) {
            return commit;
        }
        if self
            .committer_activity
            .compare_exchange(RESTING, WORKING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another reader is folding; its broadcast covers us.
            return commit;
        }
        let commit = self.commit.load(Ordering::Acquire);
        let mut newcommit = commit;
        loop {
            // SAFETY: only the publish marker is touched; the value is
            // not read here.
            let written = &unsafe { self.ring.slot(newcommit) }.written;
            if written.load(Ordering::Acquire) & 1 != 1 {
                break;
            }
            // Clear the publish bit, revealing the shifted timestamp for
            // the age filter.
            written.fetch_sub(1, Ordering::AcqRel);
            if newcommit >= self.end.load(Ordering::Acquire) {
                break;
            }
            newcommit += 1;
        }
        let write = self.write.load(Ordering::Acquire);
        if newcommit > write {
            error!("committer overran reservations: commit={commit} write={write} newcommit={newcommit}");
            panic!("commit_data: range error (commit={commit}, write={write}, newcommit={newcommit})");
        }
        if newcommit > commit
            && self
                .commit
                .compare_exchange(commit, newcommit, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            // Only the committer mutex holder advances `commit`.
            error!("commit moved outside the committer: commit={commit} newcommit={newcommit}");
            panic!("commit_data: swap error (commit={commit}, newcommit={newcommit})");
        }
        if newcommit > commit {
            self.receivers.broadcast();
        }
        self.committer_activity.store(RESTING, Ordering::Release);
        self.commit.load(Ordering::Acquire)
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.err.get().cloned()
    }
}

/// A fast, concurrent multicast buffered channel.
///
/// `Channel` is a cloneable handle over shared state; clones may send,
/// close, and create endpoints from any thread. Coordination is done
/// entirely with atomics on cache-padded 64-bit counters; readers fall
/// back to a condition variable only after 250ms without traffic.
///
/// # Backpressure
///
/// When the number of unread values reaches the buffer capacity, sending
/// blocks (spinning cooperatively) until the slowest attached endpoint
/// has read another value. Endpoints that were canceled or that drained a
/// closed channel do not hold the window back.
///
/// # Close protocol
///
/// [`Channel::close`] is one-way and idempotent. Endpoints keep receiving
/// until they drain the buffer; only then is the close notification, with
/// the optional error, delivered to each endpoint exactly once.
pub struct Channel<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("begin", &self.core.begin.load(Ordering::Acquire))
            .field("end", &self.core.end.load(Ordering::Acquire))
            .field("commit", &self.core.commit.load(Ordering::Acquire))
            .field("write", &self.core.write.load(Ordering::Acquire))
            .field("closed", &self.closed_raw())
            .finish()
    }
}

impl<T> Channel<T> {
    fn closed_raw(&self) -> bool {
        self.core.channel_state.load(Ordering::Acquire) >= CLOSED
    }
}

impl<T: Clone + Default + Send> Channel<T> {
    /// Sends a value. May be called from any number of threads.
    ///
    /// Each send reserves a position with an atomic fetch-and-add, writes
    /// the value, and publishes it with a timestamped marker; a
    /// cooperative committer folds the markers into the readable prefix
    /// in position order. Values sent from one thread are therefore
    /// delivered in that thread's send order.
    ///
    /// When the ring holds `capacity` unread values this call blocks,
    /// spinning cooperatively, until the slowest endpoint has read
    /// another value. If the channel is closed while waiting, the value
    /// is silently dropped.
    pub fn send(&self, value: T) {
        let core = &*self.core;
        let write = core.write.fetch_add(1, Ordering::AcqRel);
        while write >= core.end.load(Ordering::Acquire) {
            if !core.slide_buffer() {
                // Channel closed; the reservation stays orphaned.
                return;
            }
        }
        // SAFETY: the fetch-add above made `write` exclusive to this
        // producer, and the slide gate keeps every reader cursor off the
        // physical slot it maps to.
        unsafe { *core.ring.slot_mut(write).value = value };
        let updated = core.nanos_since_start();
        if updated == 0 {
            panic!("clock failure; zero duration measured");
        }
        // SAFETY: shared access; only the publish marker is touched.
        unsafe { core.ring.slot(write) }
            .written
            .store((updated << 1) | 1, Ordering::Release);
        core.receivers.broadcast();
    }

    /// Sends a value on the single-producer fast path.
    ///
    /// This skips the reservation protocol and the publish timestamp:
    /// the value is stored and the readable prefix advanced directly, so
    /// endpoints reading with a `max_age` filter treat fast-path values
    /// as undated and never skip them.
    ///
    /// Blocks (spinning cooperatively) on a full ring exactly like
    /// [`Channel::send`], and returns silently if the channel is closed
    /// while waiting.
    ///
    /// # Safety
    ///
    /// The caller must guarantee there is no concurrent sender of either
    /// kind: no other `fast_send` and no `send` may run at the same time
    /// on any clone of this channel. Concurrent senders race on the slot
    /// storage, which is undefined behavior.
    pub unsafe fn fast_send(&self, value: T) {
        let core = &*self.core;
        while core.commit.load(Ordering::Relaxed) == core.end.load(Ordering::Acquire) {
            if !core.slide_buffer() {
                return;
            }
        }
        let commit = core.commit.load(Ordering::Relaxed);
        // SAFETY: the caller guarantees this is the only producer, so the
        // slot at `commit` is exclusive to it until the increment below.
        unsafe { *core.ring.slot_mut(commit).value = value };
        core.commit.fetch_add(1, Ordering::AcqRel);
        core.receivers.broadcast();
    }

    /// Closes the channel. Pass an error to surface it to endpoints, or
    /// `None` for a plain close.
    ///
    /// Endpoints continue to receive until the buffer is drained; only
    /// then is the close notification delivered to each endpoint's
    /// `range`, exactly once. Only the first close transitions the
    /// channel and records the error; later calls are no-ops.
    pub fn close(&self, err: Option<CloseReason>) {
        let core = &*self.core;
        if core
            .channel_state
            .compare_exchange(ACTIVE, CLOSED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            debug!(
                "closing multicast channel{}",
                if err.is_some() { " with error" } else { "" }
            );
            if let Some(err) = err {
                let _ = core.err.set(err);
            }
            let (_guard, _) = core.endpoints.claim(ENUMERATING);
            let len = core.endpoints.len.load(Ordering::Acquire) as usize;
            for record in &core.endpoints.entry[..len] {
                // Endpoints already canceled are left alone.
                let _ = record.state.compare_exchange(
                    ACTIVE,
                    CLOSED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
        core.receivers.broadcast();
    }

    /// Returns true once the channel has been closed.
    pub fn closed(&self) -> bool {
        self.closed_raw()
    }

    /// Effective ring capacity after power-of-two rounding.
    pub fn capacity(&self) -> usize {
        self.core.ring.capacity
    }

    /// Creates a new endpoint that receives from the channel.
    ///
    /// `keep` is the number of already-buffered values to replay to the
    /// new endpoint, clamped to what the buffer still holds; pass
    /// [`REPLAY_ALL`] for the maximum. Creating an endpoint on a closed
    /// channel still yields the replay tail, followed by the close
    /// notification.
    ///
    /// Endpoint records canceled or read to exhaustion are recycled.
    ///
    /// # Errors
    ///
    /// [`ChannelError::OutOfEndpoints`] when every record is in use.
    pub fn new_endpoint(&self, keep: u64) -> Result<Endpoint<T>, ChannelError> {
        let core = &*self.core;
        let (_guard, _) = core.endpoints.claim(CREATING);
        let commit = core.commit_data();
        let begin = core.begin.load(Ordering::Acquire);
        let start = if commit - begin <= keep {
            begin
        } else {
            commit - keep
        };
        let len = core.endpoints.len.load(Ordering::Acquire) as usize;
        let index = if len == core.endpoints.capacity() {
            let recycled = (0..len).find(|&i| {
                core.endpoints.entry[i]
                    .cursor
                    .compare_exchange(PARKED, start, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            });
            match recycled {
                Some(index) => {
                    trace!("recycled endpoint record {index}, replay cursor {start}");
                    index
                }
                None => return Err(ChannelError::OutOfEndpoints),
            }
        } else {
            core.endpoints.entry[len].cursor.store(start, Ordering::Release);
            core.endpoints.len.store(len as u32 + 1, Ordering::Release);
            trace!("new endpoint record {len}, replay cursor {start}");
            len
        };
        core.endpoints.entry[index].state.store(
            core.channel_state.load(Ordering::Acquire),
            Ordering::Release,
        );
        Ok(Endpoint {
            core: Arc::clone(&self.core),
            index,
            last_active_ns: Cell::new(mono_time_ns()),
            close_latched: Cell::new(false),
        })
    }
}

/// A receive position on a [`Channel`].
///
/// Every endpoint independently observes every value committed while it
/// was attached, in commit order. An `Endpoint` is `Send` but not `Sync`:
/// it must be driven from a single thread at a time, which is how the
/// per-endpoint cursor stays single-writer.
pub struct Endpoint<T> {
    core: Arc<Core<T>>,
    index: usize,

    /// Last observed activity, driving the wait ladder.
    last_active_ns: Cell<u64>,

    /// Latched when close was observed inside the grace window, before
    /// it may be delivered.
    close_latched: Cell<bool>,
}

impl<T> Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = &self.core.endpoints.entry[self.index];
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("cursor", &record.cursor.load(Ordering::Acquire))
            .field("state", &record.state.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Clone + Default + Send> Endpoint<T> {
    fn record(&self) -> &EndpointRecord {
        &self.core.endpoints.entry[self.index]
    }

    /// Cancels the endpoint, freeing its record for reuse.
    ///
    /// Cancellation is asynchronous: a `range` in progress finishes its
    /// current callback, then parks the cursor and returns without
    /// further calls. Canceling twice is a no-op; canceling an endpoint
    /// of a closed channel is ignored.
    pub fn cancel(&self) {
        let _ = self.record().state.compare_exchange(
            ACTIVE,
            CANCELED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        trace!("endpoint record {} canceled", self.index);
        self.core.receivers.broadcast();
    }

    /// Delivers buffered and subsequently received values to `for_each`
    /// in strict cursor order.
    ///
    /// The callback receives `(value, error, closed)`. While the channel
    /// is live, `error` is `None` and `closed` is false; returning
    /// `false` cancels the endpoint and the callback is never invoked
    /// again. When the channel closes, the remaining buffered values are
    /// delivered first, then `for_each` is invoked exactly once with a
    /// default value, the close error (if any), and `closed = true`, and
    /// `range` returns.
    ///
    /// A non-zero `max_age` silently skips values whose publish timestamp
    /// is older than `max_age` by the time this endpoint reaches them.
    /// Values sent with [`Channel::fast_send`] carry no timestamp and are
    /// never skipped.
    ///
    /// After `range` has returned because of close or cancellation the
    /// endpoint's record may already belong to a newer endpoint; calling
    /// `range` again is a contract violation.
    pub fn range<F>(&self, mut for_each: F, max_age: Duration)
    where
        F: FnMut(T, Option<CloseReason>, bool) -> bool,
    {
        let core = &*self.core;
        let record = self.record();
        debug_assert_ne!(
            record.cursor.load(Ordering::Acquire),
            PARKED,
            "range called on a drained endpoint"
        );
        self.last_active_ns.set(mono_time_ns());
        loop {
            let mut commit = core.commit_data();
            while record.cursor.load(Ordering::Acquire) == commit {
                if record.state.load(Ordering::Acquire) == CANCELED {
                    record.cursor.store(PARKED, Ordering::Release);
                    return;
                }
                if core.commit.load(Ordering::Acquire) < core.write.load(Ordering::Acquire) {
                    // Producers hold reservations the committer has not
                    // folded yet.
                    if self.close_latched.get() {
                        let commit = core.commit.load(Ordering::Acquire);
                        let write = core.write.load(Ordering::Acquire);
                        error!("publication after close: commit={commit} write={write}");
                        panic!("data written after close was observed (commit={commit}, write={write})");
                    }
                    std::thread::yield_now();
                    self.last_active_ns.set(mono_time_ns());
                } else {
                    let idle = mono_time_ns() - self.last_active_ns.get();
                    if idle < CLOSE_GRACE_NS {
                        // A producer may still be mid-publication of data
                        // that predates the close; note the close, deliver
                        // it on a later rung.
                        if record.state.load(Ordering::Acquire) == CLOSED {
                            self.close_latched.set(true);
                        }
                        std::thread::yield_now();
                    } else if idle < DEEP_SLEEP_NS {
                        if record.state.load(Ordering::Acquire) == CLOSED {
                            for_each(T::default(), core.close_reason(), true);
                            record.cursor.store(PARKED, Ordering::Release);
                            return;
                        }
                        std::thread::yield_now();
                    } else {
                        core.receivers.wait();
                        self.last_active_ns.set(mono_time_ns());
                    }
                }
                commit = core.commit_data();
            }
            let mut cursor = record.cursor.load(Ordering::Acquire);
            while cursor != commit {
                // SAFETY: `cursor < commit` keeps every producer off this
                // physical slot until the cursor advances below.
                let slot = unsafe { core.ring.slot(cursor) };
                let item = (*slot.value).clone();
                let mut emit = true;
                if max_age != Duration::ZERO {
                    let stale = core.nanos_since_start() - max_age.as_nanos() as i64;
                    let updated = slot.written.load(Ordering::Acquire) >> 1;
                    if updated != 0 && updated <= stale {
                        emit = false;
                    }
                }
                if emit && !for_each(item, None, false) {
                    record.state.store(CANCELED, Ordering::Release);
                }
                if record.state.load(Ordering::Acquire) == CANCELED {
                    record.cursor.store(PARKED, Ordering::Release);
                    return;
                }
                cursor = record.cursor.fetch_add(1, Ordering::AcqRel) + 1;
            }
            self.last_active_ns.set(mono_time_ns());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        assert_eq!(channel::<u64>(0, 1).capacity(), 1);
        assert_eq!(channel::<u64>(1, 1).capacity(), 1);
        assert_eq!(channel::<u64>(3, 1).capacity(), 4);
        assert_eq!(channel::<u64>(400, 1).capacity(), 512);
    }

    #[test]
    fn fast_send_delivers_in_order_then_close() {
        let ch = channel::<u64>(4, 1);
        let ep = ch.new_endpoint(0).unwrap();

        let tx = ch.clone();
        let producer = thread::spawn(move || {
            for v in 1..=10u64 {
                // SAFETY: the only sender in this test.
                unsafe { tx.fast_send(v) };
            }
            tx.close(None);
        });

        let mut got = Vec::new();
        let mut closes = 0;
        ep.range(
            |v, err, closed| {
                if closed {
                    assert!(err.is_none());
                    closes += 1;
                } else {
                    got.push(v);
                }
                true
            },
            Duration::ZERO,
        );
        producer.join().unwrap();

        assert_eq!(got, (1..=10).collect::<Vec<_>>());
        assert_eq!(closes, 1);
    }

    #[test]
    fn replay_after_close_delivers_tail_then_error() {
        let ch = channel::<u64>(4, 1);
        for v in 1..=4u64 {
            // SAFETY: the only sender in this test.
            unsafe { ch.fast_send(v) };
        }
        ch.close(Some(Arc::new(std::io::Error::other("bye"))));
        assert!(ch.closed());

        // An endpoint created after close still gets the replay tail.
        let ep = ch.new_endpoint(REPLAY_ALL).unwrap();
        let mut got = Vec::new();
        let mut close_err = None;
        let mut closes = 0;
        ep.range(
            |v, err, closed| {
                if closed {
                    closes += 1;
                    close_err = err;
                } else {
                    got.push(v);
                }
                true
            },
            Duration::ZERO,
        );

        assert_eq!(got, vec![1, 2, 3, 4]);
        assert_eq!(closes, 1);
        assert_eq!(close_err.unwrap().to_string(), "bye");
    }

    #[test]
    fn full_ring_backpressures_until_the_reader_advances() {
        let ch = channel::<u64>(2, 1);
        let ep = ch.new_endpoint(0).unwrap();

        let tx = ch.clone();
        let producer = thread::spawn(move || {
            for v in 1..=5u64 {
                tx.send(v);
            }
            tx.close(None);
        });

        let mut got = Vec::new();
        ep.range(
            |v, _, closed| {
                if !closed {
                    got.push(v);
                    thread::sleep(Duration::from_millis(10));
                }
                true
            },
            Duration::ZERO,
        );
        producer.join().unwrap();

        assert_eq!(got, vec![1, 2, 3, 4, 5]);
        // The window slid but never grew or shrank.
        let core = &ch.core;
        assert_eq!(
            core.end.load(Ordering::Acquire) - core.begin.load(Ordering::Acquire),
            2
        );
        assert_eq!(core.commit.load(Ordering::Acquire), 5);
    }

    #[test]
    fn canceling_a_stalled_endpoint_unblocks_producers() {
        let ch = channel::<u64>(4, 2);
        let stalled = ch.new_endpoint(0).unwrap();
        let eager = ch.new_endpoint(0).unwrap();

        let tx = ch.clone();
        let producer = thread::spawn(move || {
            for v in 1..=100u64 {
                tx.send(v);
            }
            tx.close(None);
        });

        // The stalled endpoint pins the window: the producer can reserve
        // at most one position past the ring.
        thread::sleep(Duration::from_millis(50));
        assert!(ch.core.write.load(Ordering::Acquire) <= 5);

        stalled.cancel();
        // The record parks on the next reader-loop observation.
        stalled.range(|_, _, _| true, Duration::ZERO);

        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            eager.range(
                |v, _, closed| {
                    if !closed {
                        got.push(v);
                    }
                    true
                },
                Duration::ZERO,
            );
            got
        });

        producer.join().unwrap();
        let got = reader.join().unwrap();
        assert_eq!(got, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn age_filter_skips_stale_timestamped_values() {
        let ch = channel::<u64>(8, 1);
        for v in 1..=4u64 {
            ch.send(v);
        }
        thread::sleep(Duration::from_millis(60));
        for v in 5..=8u64 {
            ch.send(v);
        }
        ch.close(None);

        let ep = ch.new_endpoint(REPLAY_ALL).unwrap();
        let mut got = Vec::new();
        ep.range(
            |v, _, closed| {
                if !closed {
                    got.push(v);
                }
                true
            },
            Duration::from_millis(30),
        );

        assert_eq!(got, vec![5, 6, 7, 8]);
    }

    #[test]
    fn fast_send_values_are_undated_and_never_filtered() {
        let ch = channel::<u64>(4, 1);
        unsafe {
            // SAFETY: the only sender in this test.
            ch.fast_send(1);
            ch.fast_send(2);
        }
        thread::sleep(Duration::from_millis(20));
        ch.close(None);

        let ep = ch.new_endpoint(REPLAY_ALL).unwrap();
        let mut got = Vec::new();
        ep.range(
            |v, _, closed| {
                if !closed {
                    got.push(v);
                }
                true
            },
            Duration::from_nanos(1),
        );

        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn parked_endpoint_records_are_recycled() {
        let ch = channel::<u64>(4, 1);
        let first = ch.new_endpoint(0).unwrap();
        assert_eq!(ch.new_endpoint(0).unwrap_err(), ChannelError::OutOfEndpoints);

        first.cancel();
        first.cancel(); // idempotent
        // The record is reusable only once the reader loop has parked it.
        first.range(|_, _, _| true, Duration::ZERO);

        assert!(ch.new_endpoint(0).is_ok());
    }

    #[test]
    fn keep_clamps_to_available_history() {
        let ch = channel::<u64>(4, 3);
        for v in 1..=3u64 {
            // SAFETY: the only sender in this test.
            unsafe { ch.fast_send(v) };
        }
        ch.close(None);

        let collect = |keep: u64| {
            let ep = ch.new_endpoint(keep).unwrap();
            let mut got = Vec::new();
            ep.range(
                |v, _, closed| {
                    if !closed {
                        got.push(v);
                    }
                    true
                },
                Duration::ZERO,
            );
            got
        };

        assert_eq!(collect(2), vec![2, 3]);
        assert_eq!(collect(REPLAY_ALL), vec![1, 2, 3]);
        assert_eq!(collect(0), Vec::<u64>::new());
    }

    #[test]
    fn close_is_idempotent_and_keeps_the_first_error() {
        let ch = channel::<u64>(4, 1);
        ch.close(Some(Arc::new(std::io::Error::other("first"))));
        ch.close(Some(Arc::new(std::io::Error::other("second"))));
        assert!(ch.closed());

        let ep = ch.new_endpoint(0).unwrap();
        let mut seen = Vec::new();
        ep.range(
            |_, err, closed| {
                if closed {
                    seen.push(err.unwrap().to_string());
                }
                true
            },
            Duration::ZERO,
        );

        assert_eq!(seen, vec!["first".to_string()]);
    }

    #[test]
    fn commit_data_without_producer_activity_is_a_noop() {
        let ch = channel::<u64>(4, 1);
        assert_eq!(ch.core.commit_data(), 0);

        ch.send(7);
        assert_eq!(ch.core.commit_data(), 1);
        assert_eq!(ch.core.commit_data(), 1);

        // Folding cleared the publish bit but preserved the timestamp.
        let written = unsafe { ch.core.ring.slot(0) }.written.load(Ordering::Acquire);
        assert_eq!(written & 1, 0);
        assert!(written >> 1 > 0);
    }

    #[test]
    fn send_on_a_closed_full_ring_returns_without_publishing() {
        let ch = channel::<u64>(2, 1);
        let _pin = ch.new_endpoint(0).unwrap();
        ch.send(1);
        ch.send(2);
        ch.close(None);

        // Ring full and channel closed: must return, not spin.
        ch.send(3);

        assert_eq!(ch.core.write.load(Ordering::Acquire), 3);
        assert_eq!(ch.core.commit_data(), 2);
    }

    #[test]
    fn concurrent_senders_preserve_per_producer_order() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 250;

        let ch = channel::<u64>(2048, 1);
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = ch.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        ch.close(None);

        let ep = ch.new_endpoint(REPLAY_ALL).unwrap();
        let mut got = Vec::new();
        ep.range(
            |v, _, closed| {
                if !closed {
                    got.push(v);
                }
                true
            },
            Duration::ZERO,
        );

        assert_eq!(got.len(), (PRODUCERS * PER_PRODUCER) as usize);
        for p in 0..PRODUCERS {
            let series: Vec<_> = got.iter().copied().filter(|v| v / PER_PRODUCER == p).collect();
            let expected: Vec<_> = (0..PER_PRODUCER).map(|i| p * PER_PRODUCER + i).collect();
            assert_eq!(series, expected, "producer {p} order violated");
        }
    }

    #[test]
    fn every_endpoint_observes_every_value() {
        let ch = channel::<u64>(8, 2);
        let spawn_reader = |ep: Endpoint<u64>| {
            thread::spawn(move || {
                let mut got = Vec::new();
                ep.range(
                    |v, _, closed| {
                        if !closed {
                            got.push(v);
                        }
                        true
                    },
                    Duration::ZERO,
                );
                got
            })
        };
        let a = spawn_reader(ch.new_endpoint(0).unwrap());
        let b = spawn_reader(ch.new_endpoint(0).unwrap());

        for v in 1..=50u64 {
            ch.send(v);
        }
        ch.close(None);

        let expected: Vec<_> = (1..=50).collect();
        assert_eq!(a.join().unwrap(), expected);
        assert_eq!(b.join().unwrap(), expected);
    }

    #[test]
    fn idle_reader_wakes_from_deep_sleep_on_publish() {
        let ch = channel::<u64>(4, 1);
        let ep = ch.new_endpoint(0).unwrap();
        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            ep.range(
                |v, _, closed| {
                    if !closed {
                        got.push(v);
                    }
                    true
                },
                Duration::ZERO,
            );
            got
        });

        // Let the reader escalate past the deep-sleep threshold.
        thread::sleep(Duration::from_millis(400));
        ch.send(42);
        thread::sleep(Duration::from_millis(50));
        ch.close(None);

        assert_eq!(reader.join().unwrap(), vec![42]);
    }

    #[test]
    fn callback_returning_false_cancels_the_endpoint() {
        let ch = channel::<u64>(8, 1);
        for v in 1..=5u64 {
            ch.send(v);
        }

        let ep = ch.new_endpoint(REPLAY_ALL).unwrap();
        let mut got = Vec::new();
        ep.range(
            |v, _, _| {
                got.push(v);
                v < 3
            },
            Duration::ZERO,
        );
        assert_eq!(got, vec![1, 2, 3]);

        // The record parked on cancellation, so it is reusable at once.
        assert!(ch.new_endpoint(0).is_ok());
    }
}
