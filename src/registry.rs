//! The source registry and its iteration engine.
//!
//! [`Registry`] holds all registered [sources] in priority order, owns the
//! table of contributed [poll descriptors] and drives the
//! prepare/poll/check/dispatch cycle, see [`iteration`]. There is one
//! process-wide shared instance, [`Registry::global`], and every operation
//! is thread-safe: one big lock serialises all bookkeeping, released only
//! for the blocking multiplex call and for each dispatch callback, so
//! callbacks may freely re-enter the registry. A thread parked in the poll
//! step is woken through a [self-pipe] whenever another thread registers
//! work.
//!
//! [sources]: crate::Source
//! [poll descriptors]: crate::Watch
//! [`iteration`]: Registry::iteration
//! [self-pipe]: crate::sys

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::hook::{Entry, HookFlags, HookId, HookList};
use crate::idle::Idle;
use crate::poll::{Interests, PollEntry, PollFunc, Ready, Watch};
use crate::source::{Prepare, Priority, Source};
use crate::sys::{self, Waker};
use crate::timer::Timer;

/// The source became ready in prepare or check and awaits dispatch.
const READY: HookFlags = HookFlags(1 << HookFlags::USER_SHIFT);
/// The source's dispatch may be re-entered while already in call.
const CAN_RECURSE: HookFlags = HookFlags(1 << (HookFlags::USER_SHIFT + 1));

struct SourceRecord {
    priority: Priority,
    source: Arc<dyn Source + Send + Sync>,
}

impl fmt::Debug for SourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SourceRecord")
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Debug)]
struct PollRecord {
    watch: Watch,
    priority: Priority,
}

#[derive(Debug)]
struct Inner {
    /// Sources in ascending priority order, FIFO among equal priorities.
    sources: HookList<SourceRecord>,
    /// Poll records in ascending priority order.
    poll_table: Vec<PollRecord>,
    /// Ready sources awaiting dispatch, each holding a reference.
    pending: VecDeque<Entry>,
    poll_func: PollFunc,
    /// A thread is parked in the poll step and wants a wake-up byte.
    poll_waiting: bool,
}

/// The thread-shared source registry.
///
/// Sources are [registered] with a [`Priority`] and a can-recurse flag and
/// are driven by repeatedly calling [`iteration`], usually through
/// [`MainLoop::run`]. Within one iteration only the sources sharing the
/// most urgent priority among the ready ones are dispatched, in
/// registration order for equal priorities.
///
/// # Examples
///
/// An always-ready source that counts down and then removes itself:
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Instant;
///
/// use kairos::{Prepare, Priority, Registry, Source};
///
/// struct Tick(AtomicUsize);
///
/// impl Source for Tick {
///     fn prepare(&self, _now: Instant) -> Prepare {
///         Prepare::Ready
///     }
///
///     fn dispatch(&self, _now: Instant) -> bool {
///         self.0.fetch_add(1, Ordering::SeqCst) < 2
///     }
/// }
///
/// # fn main() -> std::io::Result<()> {
/// let registry = Registry::new()?;
/// let tick = Arc::new(Tick(AtomicUsize::new(0)));
/// let id = registry.register(Priority::DEFAULT, false, tick.clone());
///
/// for _ in 0..3 {
///     registry.iteration(true);
/// }
///
/// // Dispatched three times, the last dispatch returned false.
/// assert_eq!(tick.0.load(Ordering::SeqCst), 3);
/// assert!(!registry.contains(id));
/// # Ok(())
/// # }
/// ```
///
/// [registered]: Registry::register
/// [`iteration`]: Registry::iteration
pub struct Registry {
    inner: Mutex<Inner>,
    waker: Waker,
}

impl Registry {
    /// Create a new registry.
    ///
    /// This creates the wake-up pipe, which is the only part that can
    /// fail. Most programs want the shared [`Registry::global`] instance
    /// instead; separate registries are useful in tests.
    pub fn new() -> io::Result<Registry> {
        let waker = Waker::new()?;
        Ok(Registry {
            inner: Mutex::new(Inner {
                sources: HookList::new(),
                poll_table: Vec::new(),
                pending: VecDeque::new(),
                poll_func: sys::poll,
                poll_waiting: false,
            }),
            waker,
        })
    }

    /// The process-wide shared registry.
    ///
    /// Created on first use; creating the wake-up pipe must succeed at
    /// that point, there is no way to report failure here.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| Registry::new().expect("unable to create the global registry"))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Write a wake-up byte if a thread is parked in the poll step.
    fn wake_poller(&self, inner: &mut Inner) {
        if inner.poll_waiting {
            inner.poll_waiting = false;
            trace!("waking parked poll");
            if let Err(err) = self.waker.wake() {
                error!("unable to wake parked poll: {}", err);
            }
        }
    }

    /// Register `source` with the given priority.
    ///
    /// The source is inserted in priority order; among equal priorities new
    /// sources land after existing ones, so equally urgent sources are
    /// dispatched in registration order. If a thread is currently parked in
    /// the poll step it is woken so the wait bound is recomputed with the
    /// new source taken into account.
    ///
    /// A source registered with `can_recurse` set may have its `dispatch`
    /// re-entered by a nested [`iteration`] while an outer dispatch of it
    /// is still running; all other sources are skipped until they leave
    /// their dispatch call.
    ///
    /// Returns an id to [`deregister`] the source with.
    ///
    /// [`iteration`]: Registry::iteration
    /// [`deregister`]: Registry::deregister
    pub fn register(
        &self,
        priority: Priority,
        can_recurse: bool,
        source: Arc<dyn Source + Send + Sync>,
    ) -> HookId {
        let mut inner = self.lock();
        trace!("registering source: priority={}, can_recurse={}", priority, can_recurse);
        let record = SourceRecord { priority, source };
        let id = inner.sources.insert_sorted(record, |new, existing| {
            // Never `Equal`: equal priorities keep registration order.
            if new.priority < existing.priority {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        });
        if can_recurse {
            let entry = inner.sources.entry(id).unwrap();
            inner.sources.set(entry, CAN_RECURSE);
        }
        self.wake_poller(&mut inner);
        id
    }

    /// Deregister the source with id `id`.
    ///
    /// The source is removed from scheduling immediately and its value is
    /// dropped once the registry lock is released; if a dispatch of it is
    /// in flight the in-memory record is reclaimed only after that dispatch
    /// returns. Safe to call from within the source's own `dispatch`.
    /// Returns whether a source was removed; deregistering an unknown or
    /// already removed id is a no-op, not an error.
    pub fn deregister(&self, id: HookId) -> bool {
        let dead = {
            let mut inner = self.lock();
            trace!("deregistering source: id={}", id);
            inner.sources.destroy(id)
        };
        dead.is_some()
    }

    /// Deregister the source registered with the same allocation as
    /// `source`.
    ///
    /// This is the lookup-by-value companion to [`deregister`]: it finds
    /// the (first) registration whose source is the very same `Arc`
    /// allocation. Returns whether a source was removed.
    ///
    /// [`deregister`]: Registry::deregister
    pub fn deregister_source(&self, source: &Arc<dyn Source + Send + Sync>) -> bool {
        let dead = {
            let mut inner = self.lock();
            let id = inner.sources.find(|record| Arc::ptr_eq(&record.source, source));
            match id {
                Some(id) => {
                    trace!("deregistering source: id={}", id);
                    inner.sources.destroy(id)
                },
                None => None,
            }
        };
        dead.is_some()
    }

    /// Whether a source with id `id` is currently registered.
    pub fn contains(&self, id: HookId) -> bool {
        self.lock().sources.entry(id).is_some()
    }

    /// Add a poll descriptor record to the poll table.
    ///
    /// During the poll step the watch's descriptor is waited on whenever
    /// `priority` is at or above the most urgent ready priority;
    /// conventionally it matches the priority of the source that owns the
    /// watch. The observed readiness is copied back onto the watch for the
    /// owning source's `check` to inspect.
    pub fn add_poll(&self, watch: Watch, priority: Priority) {
        let mut inner = self.lock();
        trace!("adding poll record: fd={}, priority={}", watch.fd(), priority);
        let at = inner.poll_table.iter()
            .position(|record| record.priority > priority)
            .unwrap_or_else(|| inner.poll_table.len());
        inner.poll_table.insert(at, PollRecord { watch, priority });
        self.wake_poller(&mut inner);
    }

    /// Remove a poll descriptor record from the poll table.
    ///
    /// Removes the record added with the same [`Watch`] allocation.
    /// Returns whether a record was removed; removing a watch that is not
    /// in the table is a no-op, not an error.
    pub fn remove_poll(&self, watch: &Watch) -> bool {
        let mut inner = self.lock();
        match inner.poll_table.iter().position(|record| record.watch.same(watch)) {
            Some(at) => {
                trace!("removing poll record: fd={}", watch.fd());
                drop(inner.poll_table.remove(at));
                self.wake_poller(&mut inner);
                true
            },
            None => false,
        }
    }

    /// Replace the multiplex call used by the poll step.
    ///
    /// Defaults to [`sys::poll`]. Takes effect from the next iteration.
    ///
    /// [`sys::poll`]: crate::sys::poll
    pub fn set_poll_func(&self, poll_func: PollFunc) {
        self.lock().poll_func = poll_func;
    }

    /// Wake up a thread parked in the poll step, if any.
    ///
    /// Rarely needed directly: [`register`], [`add_poll`] and
    /// [`MainLoop::quit`] already wake the poller.
    ///
    /// [`register`]: Registry::register
    /// [`add_poll`]: Registry::add_poll
    pub fn wake(&self) {
        let mut inner = self.lock();
        self.wake_poller(&mut inner);
    }

    /// Whether any source is ready to be dispatched.
    ///
    /// Runs the prepare and check passes without blocking and without
    /// dispatching. Sources found ready stay queued for the next
    /// dispatching iteration.
    pub fn pending(&self) -> bool {
        self.iterate(false, false)
    }

    /// Run one iteration of the scheduling cycle.
    ///
    /// Walks all eligible sources in priority order asking whether they are
    /// ready ([`prepare`]), waits on the contributed poll descriptors — at
    /// most as long as the most impatient source allows, not at all if
    /// `block` is false or something is already ready — re-asks the sources
    /// ([`check`]) and dispatches the ready sources at the most urgent
    /// ready priority. Returns whether anything was dispatched.
    ///
    /// A nested call from within a dispatch callback does not re-run the
    /// cycle; it drains the remaining ready sources of the current
    /// iteration instead.
    ///
    /// [`prepare`]: crate::Source::prepare
    /// [`check`]: crate::Source::check
    pub fn iteration(&self, block: bool) -> bool {
        self.iterate(block, true)
    }

    /// The scheduling cycle. See `iteration` for the contract.
    fn iterate(&self, block: bool, dispatch: bool) -> bool {
        trace!("iterating: block={}, dispatch={}", block, dispatch);

        let (mut snapshot, watches, timeout, prepared_bound, poll_func) = {
            let mut inner = self.lock();

            // Dispatches left over from an iteration lower on the stack (a
            // re-entrant call) or from a non-dispatching run: finish those
            // first instead of running a fresh cycle.
            if !inner.pending.is_empty() {
                drop(inner);
                return if dispatch { self.dispatch_pending() } else { true };
            }

            // Prepare pass.
            let now = Instant::now();
            let mut bound: Option<Priority> = None;
            let mut timeout: Option<Duration> = None;
            let mut cursor = inner.sources.first_valid();
            while let Some(entry) = cursor {
                let skip = inner.sources.is_set(entry, HookFlags::IN_CALL)
                    && !inner.sources.is_set(entry, CAN_RECURSE);
                if !skip {
                    let priority = inner.sources.value(entry).unwrap().priority;
                    if let Some(bound) = bound {
                        if priority > bound {
                            // The list is priority ordered: everything from
                            // here on is less urgent than what is already
                            // ready.
                            let _ = inner.sources.release(entry);
                            break;
                        }
                    }
                    let prepared = if inner.sources.is_set(entry, READY) {
                        Prepare::Ready
                    } else {
                        inner.sources.value(entry).unwrap().source.prepare(now)
                    };
                    if prepared.is_ready() {
                        inner.sources.set(entry, READY);
                        bound = Some(priority);
                    } else {
                        timeout = min_timeout(timeout, prepared.timeout());
                    }
                }
                cursor = inner.sources.next_valid(entry);
            }

            let timeout = if bound.is_some() || !block {
                Some(Duration::from_millis(0))
            } else {
                timeout
            };

            // Snapshot the poll records at priorities at or above the
            // bound; the wake-up pipe is always entry zero.
            let mut snapshot = vec![PollEntry {
                fd: self.waker.fd(),
                interests: Interests::READABLE,
                readiness: Ready::EMPTY,
            }];
            let mut watches = Vec::new();
            for record in &inner.poll_table {
                if bound.map_or(true, |bound| record.priority <= bound) {
                    snapshot.push(PollEntry {
                        fd: record.watch.fd(),
                        interests: record.watch.interests(),
                        readiness: Ready::EMPTY,
                    });
                    watches.push(record.watch.clone());
                }
            }
            inner.poll_waiting = true;
            (snapshot, watches, timeout, bound, inner.poll_func)
        };

        // Poll step, lock released.
        trace!("polling: descriptors={}, timeout={:?}", snapshot.len(), timeout);
        match (poll_func)(&mut snapshot, timeout) {
            Ok(_) => {},
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                // Same as the poll returning early.
            },
            Err(err) => {
                // Treated as no source becoming ready; the next iteration
                // re-evaluates.
                error!("poll failed: {}", err);
                for entry in snapshot.iter_mut() {
                    entry.readiness = Ready::EMPTY;
                }
            },
        }

        let some_ready = {
            let mut inner = self.lock();

            if inner.poll_waiting {
                inner.poll_waiting = false;
            } else {
                // Another thread wrote a wake-up byte behind our back;
                // consume it.
                self.waker.drain();
            }

            // Copy observed events back onto the records still present.
            for (watch, entry) in watches.iter().zip(snapshot.iter().skip(1)) {
                if inner.poll_table.iter().any(|record| record.watch.same(watch)) {
                    watch.set_readiness(entry.readiness);
                }
            }

            // Check pass. Same priority bounded walk as prepare, except
            // that a source which became ready during the poll may raise
            // the bound.
            let now = Instant::now();
            let mut bound = prepared_bound;
            let mut some_ready = false;
            let mut cursor = inner.sources.first_valid();
            while let Some(entry) = cursor {
                let skip = inner.sources.is_set(entry, HookFlags::IN_CALL)
                    && !inner.sources.is_set(entry, CAN_RECURSE);
                if !skip {
                    let priority = inner.sources.value(entry).unwrap().priority;
                    if let Some(bound) = bound {
                        if priority > bound {
                            let _ = inner.sources.release(entry);
                            break;
                        }
                    }
                    let ready = inner.sources.is_set(entry, READY)
                        || inner.sources.value(entry).unwrap().source.check(now);
                    if ready {
                        inner.sources.set(entry, READY);
                        bound = Some(priority);
                        // The queued entry holds a reference for as long as
                        // it sits in the queue.
                        inner.sources.acquire(entry);
                        inner.pending.push_back(entry);
                        some_ready = true;
                    }
                }
                cursor = inner.sources.next_valid(entry);
            }
            some_ready
        };

        if dispatch {
            self.dispatch_pending()
        } else {
            some_ready
        }
    }

    /// Drain the pending queue, invoking each source's dispatch with the
    /// lock released. Whichever call pops an entry owns — and drops — the
    /// reference the entry held, so a nested drain and the iteration it
    /// interrupted never double release.
    fn dispatch_pending(&self) -> bool {
        let mut dispatched = false;
        loop {
            let (entry, source, was_in_call) = {
                let mut inner = self.lock();
                let entry = loop {
                    match inner.pending.pop_front() {
                        Some(entry) => {
                            if inner.sources.is_valid(entry) {
                                break Some(entry);
                            }
                            // Destroyed while queued; drop the queue's
                            // reference and move on.
                            let _ = inner.sources.release(entry);
                        },
                        None => break None,
                    }
                };
                let entry = match entry {
                    Some(entry) => entry,
                    None => break,
                };
                inner.sources.unset(entry, READY);
                let was_in_call = inner.sources.is_set(entry, HookFlags::IN_CALL);
                inner.sources.set(entry, HookFlags::IN_CALL);
                let source = inner.sources.value(entry).unwrap().source.clone();
                (entry, source, was_in_call)
            };

            trace!("dispatching source");
            let keep_alive = source.dispatch(Instant::now());
            dispatched = true;

            let dead = {
                let mut inner = self.lock();
                if !was_in_call {
                    // A pre-set in-call flag belongs to an outer dispatch
                    // still on the stack; leave it to that call.
                    inner.sources.unset(entry, HookFlags::IN_CALL);
                }
                let dead = if keep_alive {
                    None
                } else {
                    trace!("source finished, destroying");
                    inner.sources.destroy_entry(entry)
                };
                let _ = inner.sources.release(entry);
                dead
            };
            drop(dead);
        }
        dispatched
    }

    /// Register a repeating timer at [`Priority::DEFAULT`].
    ///
    /// `handler` runs every time `interval` elapses, re-armed from the
    /// moment of dispatch, until it returns `false`. See [`Timer`].
    pub fn add_timeout<F>(&self, interval: Duration, handler: F) -> HookId
        where F: Fn() -> bool + Send + Sync + 'static,
    {
        self.register(Priority::DEFAULT, false, Arc::new(Timer::new(interval, handler)))
    }

    /// Register an idle handler at [`Priority::DEFAULT_IDLE`].
    ///
    /// `handler` runs on every iteration in which nothing more urgent is
    /// ready, until it returns `false`. See [`Idle`].
    pub fn add_idle<F>(&self, handler: F) -> HookId
        where F: Fn() -> bool + Send + Sync + 'static,
    {
        self.register(Priority::DEFAULT_IDLE, false, Arc::new(Idle::new(handler)))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry").finish()
    }
}

/// Returns the smallest of the two timeouts provided.
fn min_timeout(left: Option<Duration>, right: Option<Duration>) -> Option<Duration> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.min(right)),
        (Some(left), None) => Some(left),
        (None, Some(right)) => Some(right),
        (None, None) => None,
    }
}

/// A run-to-completion handle over a [`Registry`].
///
/// [`run`] drives the registry until [`quit`] is called, from any thread;
/// the running flag is consulted at iteration boundaries, so quitting takes
/// effect once the current iteration finishes (a parked poll step is woken
/// up for it).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// use kairos::{MainLoop, Registry};
///
/// # fn main() -> std::io::Result<()> {
/// let main_loop = MainLoop::new(Arc::new(Registry::new()?));
///
/// let handle = main_loop.clone();
/// let quitter = thread::spawn(move || {
///     thread::sleep(Duration::from_millis(10));
///     handle.quit();
/// });
///
/// // Blocks until the other thread quits the loop.
/// main_loop.run();
/// quitter.join().unwrap();
/// # Ok(())
/// # }
/// ```
///
/// [`run`]: MainLoop::run
/// [`quit`]: MainLoop::quit
#[derive(Clone, Debug)]
pub struct MainLoop {
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
}

impl MainLoop {
    /// Create a new loop handle over `registry`.
    pub fn new(registry: Arc<Registry>) -> MainLoop {
        MainLoop {
            registry,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The registry this loop drives.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run blocking iterations until [`quit`] is called.
    ///
    /// [`quit`]: MainLoop::quit
    pub fn run(&self) {
        trace!("running main loop");
        self.running.store(true, atomic::Ordering::SeqCst);
        while self.running.load(atomic::Ordering::SeqCst) {
            let _ = self.registry.iteration(true);
        }
        trace!("main loop finished");
    }

    /// Stop the loop at the next iteration boundary.
    ///
    /// Callable from any thread and from dispatch callbacks; wakes the
    /// loop if it is parked in the poll step.
    pub fn quit(&self) {
        trace!("quitting main loop");
        self.running.store(false, atomic::Ordering::SeqCst);
        self.registry.wake();
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(atomic::Ordering::SeqCst)
    }
}
