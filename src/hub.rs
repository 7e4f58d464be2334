//! The multiplexing engine.
//!
//! A [`Hub`] owns a set of streams, waits for readiness across all of them
//! in a single-threaded loop, and dispatches lifecycle callbacks to the
//! [`HubHandler`] it was built with. Streams are addressed by the id
//! `connect` returned; ids are handed out monotonically and never reused
//! while a stream is live, so a stale id misses instead of hitting the
//! wrong stream.
//!
//! Ready streams are serviced in ascending id order, which equals
//! registration order. A connection accepted during a pass is not also
//! data-polled within that pass; it enters the poll set on the following
//! [`step`](Hub::step).

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::config::Config;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{get_namespaced_u64, get_namespaced_usize};
use crate::error::{Error, ErrorKind};
use crate::stream::{self, EngineStream, OpenOptions, PollSource, Probe, Stream};
use crate::target::TargetDescriptor;

// Internal constants for stream management
const WAKE_ID: usize = 2;
const STREAM_ID_RANGE_START: usize = 1000;
const DEFAULT_POLL_CAPACITY: usize = 1024;
const DEFAULT_SERIAL_READ_TIMEOUT_MS: u64 = 86_400_000;

// ============================================================================
// Extension points
// ============================================================================

/// The extension points where application logic observes the engine.
///
/// One implementation is injected per [`Hub`] instance; every method
/// defaults to a no-op. All callbacks run synchronously on the thread
/// driving [`Hub::step`], and the [`HubContext`] argument is the supported
/// way to touch the hub from inside them.
pub trait HubHandler {
    /// A listening stream accepted a new connection. The stream is already
    /// registered under `id` when this runs; closing it here is honored.
    fn connection_created(&mut self, ctx: &mut HubContext<'_>, id: usize) {
        let _ = (ctx, id);
    }

    /// A data stream has bytes available. The callback must consume at
    /// least some of them through `ctx.stream(id)`; a callback that
    /// consumes nothing trips the
    /// [`PreviousIncomingDataNotRead`](ErrorKind::PreviousIncomingDataNotRead)
    /// guard on the next cycle.
    fn incoming_data(&mut self, ctx: &mut HubContext<'_>, id: usize) {
        let _ = (ctx, id);
    }

    /// The engine detected end of input or a failure on `stream` and
    /// removed it. The stream is already detached from the hub; only its
    /// identity and failure state remain meaningful, and passing its old id
    /// to `ctx.close_stream` is rejected. Never invoked by
    /// [`Hub::close_stream`].
    fn connection_closed(&mut self, ctx: &mut HubContext<'_>, stream: &dyn Stream, abnormal: bool) {
        let _ = (ctx, stream, abnormal);
    }
}

/// A [`HubHandler`] that ignores every event, for client-style use where
/// the application drives streams directly.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl HubHandler for NoopHandler {}

// ============================================================================
// Internal stream table
// ============================================================================

// How a registered stream participates in the readiness wait.
#[derive(Debug, Clone, Copy)]
enum Watch {
    // Registered with the poller under the stream's id.
    Fd(RawFd),
    // Not pollable but always has activity pending (read-mode files);
    // forces non-blocking poll cycles.
    Always,
    // Produces no incoming activity (write-only streams).
    None,
}

struct Entry {
    stream: Box<dyn EngineStream>,
    watch: Watch,
    // Consumed-byte counter before and after the last incoming_data
    // dispatch; backs the no-read-progress guard.
    last_dispatch: Option<(u64, u64)>,
}

struct HubInner {
    entries: BTreeMap<usize, Entry>,
    data_ids: BTreeSet<usize>,
    next_id: usize,
    poll: Poll,
    poll_capacity: usize,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    options: OpenOptions,
}

impl HubInner {
    fn connect(&mut self, target: &str) -> Result<usize, Error> {
        let descriptor = TargetDescriptor::parse(target)?;
        let stream = stream::open(&descriptor, &self.options)?;
        self.register_stream(stream)
    }

    fn register_stream(&mut self, stream: Box<dyn EngineStream>) -> Result<usize, Error> {
        let id = self.next_id;
        let watch = match stream.poll_source() {
            PollSource::Fd(fd) => {
                match self
                    .poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(id), Interest::READABLE)
                {
                    Ok(()) => Watch::Fd(fd),
                    // Stdin redirected from a regular file cannot be
                    // polled; treat it like a file.
                    Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                        warn!(id, target = %stream.target_name(),
                            "descriptor not pollable, treating as always ready");
                        Watch::Always
                    }
                    Err(err) => {
                        return Err(Error::from_io(
                            ErrorKind::ConnectionFailed,
                            err,
                            "cannot register stream with poller",
                        )
                        .with_stream(stream.target_name()));
                    }
                }
            }
            PollSource::AlwaysReady => Watch::Always,
            PollSource::NotWatched => Watch::None,
        };

        info!(id, target = %stream.target_name(), "registered stream");
        if !stream.is_listener() {
            self.data_ids.insert(id);
        }
        self.entries.insert(
            id,
            Entry {
                stream,
                watch,
                last_dispatch: None,
            },
        );
        self.advance_stream_id();
        Ok(id)
    }

    // mio registers sources edge-triggered: a source serviced without
    // being fully drained must be re-armed, or its remaining activity
    // never reports again. Re-arming while nothing is pending is harmless;
    // the poller filters the stale event out.
    fn rearm(&self, id: usize) {
        if let Some(entry) = self.entries.get(&id) {
            if let Watch::Fd(fd) = entry.watch {
                if let Err(err) =
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(id), Interest::READABLE)
                {
                    warn!(id, ?err, "cannot re-arm stream readiness");
                }
            }
        }
    }

    // Removes a stream from both collections and the poller, handing its
    // carcass back to the caller.
    fn detach(&mut self, id: usize) -> Option<Box<dyn EngineStream>> {
        let entry = self.entries.remove(&id)?;
        if let Watch::Fd(fd) = entry.watch {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(id, ?err, "cannot deregister stream from poller");
            }
        }
        self.data_ids.remove(&id);
        Some(entry.stream)
    }

    fn close(&mut self, id: usize) -> Result<(), Error> {
        match self.detach(id) {
            Some(stream) => {
                info!(id, target = %stream.target_name(), "closed stream");
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("no stream with id {id}; already closed or never registered"),
            )),
        }
    }

    fn stream_mut(&mut self, id: usize) -> Option<&mut dyn Stream> {
        self.entries
            .get_mut(&id)
            .map(|entry| entry.stream.as_mut() as &mut dyn Stream)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "cannot wake readiness poll");
        }
    }

    // A stop request terminates exactly one step; consuming it lets later
    // steps run normally.
    fn consume_stop(&self) -> bool {
        self.stop.swap(false, Ordering::SeqCst)
    }

    fn has_always_ready(&self) -> bool {
        self.entries
            .values()
            .any(|entry| matches!(entry.watch, Watch::Always))
    }

    fn advance_stream_id(&mut self) {
        loop {
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(STREAM_ID_RANGE_START);
            if !self.entries.contains_key(&self.next_id) {
                break;
            }
        }
    }
}

// ============================================================================
// Callback context
// ============================================================================

/// Access to the hub from inside a [`HubHandler`] callback.
///
/// All lifecycle transitions are legal here: reading and writing streams,
/// connecting new targets, closing streams, and requesting termination.
pub struct HubContext<'a> {
    inner: &'a mut HubInner,
}

impl HubContext<'_> {
    /// The stream registered under `id`, if it is still live.
    pub fn stream(&mut self, id: usize) -> Option<&mut dyn Stream> {
        self.inner.stream_mut(id)
    }

    /// Opens a new stream; see [`Hub::connect`].
    pub fn connect(&mut self, target: &str) -> Result<usize, Error> {
        self.inner.connect(target)
    }

    /// Closes a stream; see [`Hub::close_stream`].
    pub fn close_stream(&mut self, id: usize) -> Result<(), Error> {
        self.inner.close(id)
    }

    /// Requests termination; the surrounding [`Hub::step`] returns `false`.
    pub fn stop(&self) {
        self.inner.request_stop();
    }
}

// ============================================================================
// Termination handle
// ============================================================================

/// Thread-safe termination handle for a [`Hub`].
///
/// The hub itself is single-threaded; this handle is the one piece of it
/// that may cross threads. Calling [`stop`](HubHandle::stop) interrupts a
/// concurrently blocked [`Hub::step`] promptly through the poller's wakeup
/// mechanism. Obtain one from [`Hub::handle`]; clones share the same hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl HubHandle {
    /// Requests termination of the hub's loop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "cannot wake readiness poll");
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Readiness-multiplexing engine over a set of heterogeneous streams.
///
/// Single-threaded by contract: one thread owns the hub and drives
/// [`step`](Hub::step)/[`run`](Hub::run); the only thread-safe entry point
/// is [`HubHandle::stop`]. Registered streams are owned exclusively by the
/// hub until closed. Direct blocking I/O through [`stream`](Hub::stream) is
/// legal outside the loop, but interleaving it with the hub's own polling
/// of the same stream can lose or duplicate bytes; that is a usage hazard,
/// not an engine guarantee.
pub struct Hub {
    inner: HubInner,
    handler: Box<dyn HubHandler>,
}

impl Hub {
    /// Creates a hub with the given handler.
    pub fn new(config: &Config, handler: Box<dyn HubHandler>) -> Result<Self, Error> {
        Self::new_named(config, handler, "")
    }

    /// Creates a hub whose configuration keys are namespaced under `name`
    /// (`{name}.{key}` wins over `{key}`).
    ///
    /// Honored keys: `poll_capacity` (readiness event buffer size, default
    /// 1024) and `serial_read_timeout_ms` (per-syscall ceiling used to
    /// emulate blocking serial reads, default one day).
    pub fn new_named(
        config: &Config,
        handler: Box<dyn HubHandler>,
        name: &str,
    ) -> Result<Self, Error> {
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let serial_read_timeout = Duration::from_millis(
            get_namespaced_u64(config, name, "serial_read_timeout_ms")
                .unwrap_or(DEFAULT_SERIAL_READ_TIMEOUT_MS),
        );

        let poll = Poll::new()
            .map_err(|err| Error::from_io(ErrorKind::Sync, err, "cannot create poller"))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), Token(WAKE_ID))
                .map_err(|err| Error::from_io(ErrorKind::Sync, err, "cannot create waker"))?,
        );

        Ok(Self {
            inner: HubInner {
                entries: BTreeMap::new(),
                data_ids: BTreeSet::new(),
                next_id: STREAM_ID_RANGE_START,
                poll,
                poll_capacity,
                waker,
                stop: Arc::new(AtomicBool::new(false)),
                options: OpenOptions {
                    serial_read_timeout,
                },
            },
            handler,
        })
    }
}

// ============================================================================
// Stream Management
// ============================================================================

impl Hub {
    /// Opens the stream a target descriptor names and registers it.
    ///
    /// Returns the stream's id. Fails with
    /// [`InvalidTarget`](ErrorKind::InvalidTarget) when the descriptor does
    /// not parse and [`ConnectionFailed`](ErrorKind::ConnectionFailed) when
    /// the resource cannot be opened or established.
    #[instrument(skip(self))]
    pub fn connect(&mut self, target: &str) -> Result<usize, Error> {
        self.inner.connect(target)
    }

    /// Removes the stream from the hub and destroys it.
    ///
    /// Never invokes [`HubHandler::connection_closed`]. An unknown id, which
    /// includes a double close, is rejected with
    /// [`InvalidOperation`](ErrorKind::InvalidOperation).
    #[instrument(skip(self))]
    pub fn close_stream(&mut self, id: usize) -> Result<(), Error> {
        self.inner.close(id)
    }

    /// The stream registered under `id`, for direct client-style I/O.
    pub fn stream(&mut self, id: usize) -> Option<&mut dyn Stream> {
        self.inner.stream_mut(id)
    }

    /// The local socket address of a socket-backed stream, e.g. to recover
    /// the port of a listener bound to `tcpin:port=0`.
    pub fn local_addr(&self, id: usize) -> Option<SocketAddr> {
        self.inner
            .entries
            .get(&id)
            .and_then(|entry| entry.stream.local_addr())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Hub {
    /// Runs one polling cycle.
    ///
    /// `None` blocks until readiness or a stop request; `Some(ZERO)` polls
    /// without blocking; `Some(d)` blocks at most `d`. Returns `Ok(false)`
    /// only when a stop request was observed before or during the cycle;
    /// `Ok(true)` otherwise, including when the timeout elapsed with no
    /// activity.
    ///
    /// Failures on individual streams never abort the cycle; they are
    /// recorded on the stream and surfaced through
    /// [`HubHandler::connection_closed`]. The one exception is the
    /// [`PreviousIncomingDataNotRead`](ErrorKind::PreviousIncomingDataNotRead)
    /// guard, which is a defect in the handler and is returned as an error.
    #[instrument(skip(self))]
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        if self.inner.consume_stop() {
            debug!("stop request consumed before polling");
            return Ok(false);
        }

        // Read-mode files cannot be polled and always count as ready, so
        // their presence forces non-blocking cycles.
        let effective = if self.inner.has_always_ready() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let mut events = Events::with_capacity(self.inner.poll_capacity);
        loop {
            match self.inner.poll.poll(&mut events, effective) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(Error::from_io(ErrorKind::Sync, err, "readiness poll failed"))
                }
            }
        }

        // Ascending id order equals registration order. A connection
        // accepted during this pass gets a fresh, higher id that is absent
        // from this set, so it is first polled on the next cycle.
        let mut ready = BTreeSet::new();
        for event in events.iter() {
            let Token(id) = event.token();
            if id != WAKE_ID {
                ready.insert(id);
            }
        }
        for id in &self.inner.data_ids {
            if matches!(self.inner.entries[id].watch, Watch::Always) {
                ready.insert(*id);
            }
        }
        trace!(count = ready.len(), "streams ready");

        for id in ready {
            // Skip streams closed earlier in this same pass.
            let Some(entry) = self.inner.entries.get(&id) else {
                continue;
            };
            if entry.stream.is_listener() {
                self.service_listener(id);
            } else {
                self.service_data(id)?;
            }
        }

        if self.inner.consume_stop() {
            debug!("stop request consumed after servicing");
            return Ok(false);
        }
        Ok(true)
    }

    /// Calls [`step`](Hub::step) with no timeout until it reports a stop
    /// request.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.step(None)? {}
        Ok(())
    }

    /// Requests termination: the in-flight or next [`step`](Hub::step)
    /// returns `Ok(false)`. See [`Hub::handle`] for stopping from another
    /// thread.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// A cloneable, thread-safe handle that can stop this hub from another
    /// thread, interrupting a blocked [`step`](Hub::step) promptly.
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            stop: self.inner.stop.clone(),
            waker: self.inner.waker.clone(),
        }
    }
}

// ============================================================================
// Internal Event Servicing
// ============================================================================

impl Hub {
    fn service_listener(&mut self, id: usize) {
        let accepted = match self.inner.entries.get_mut(&id) {
            Some(entry) => entry.stream.accept(),
            None => return,
        };

        match accepted {
            Ok(Some(stream)) => {
                let new_id = match self.inner.register_stream(stream) {
                    Ok(new_id) => new_id,
                    Err(err) => {
                        warn!(id, %err, "cannot register accepted connection");
                        self.inner.rearm(id);
                        return;
                    }
                };
                self.handler.connection_created(
                    &mut HubContext {
                        inner: &mut self.inner,
                    },
                    new_id,
                );
                self.close_if_failed(new_id);
                // One accept per event; re-arm so a still-queued
                // connection reports again next cycle.
                self.inner.rearm(id);
            }
            Ok(None) => {
                trace!(id, "listener readiness produced no connection");
            }
            Err(err) => {
                warn!(id, %err, "listener failed");
                self.close_path(id, false);
            }
        }
    }

    fn service_data(&mut self, id: usize) -> Result<(), Error> {
        let probe = match self.inner.entries.get_mut(&id) {
            Some(entry) => entry.stream.probe(),
            None => return Ok(()),
        };

        match probe {
            Ok(Probe::Data) => {
                let before = {
                    let entry = &self.inner.entries[&id];
                    if let Some((before, after)) = entry.last_dispatch {
                        if before == after && entry.stream.consumed() == after {
                            let target = entry.stream.target_name().to_owned();
                            self.inner.rearm(id);
                            return Err(Error::new(
                                ErrorKind::PreviousIncomingDataNotRead,
                                format!(
                                    "stream {target} is ready again but the previous \
                                     incoming_data callback consumed nothing"
                                ),
                            )
                            .with_stream(target));
                        }
                    }
                    entry.stream.consumed()
                };

                self.handler.incoming_data(
                    &mut HubContext {
                        inner: &mut self.inner,
                    },
                    id,
                );

                let failed_after = self.inner.entries.get_mut(&id).map(|entry| {
                    if entry.stream.failed() {
                        true
                    } else {
                        entry.last_dispatch = Some((before, entry.stream.consumed()));
                        false
                    }
                });
                if failed_after == Some(true) {
                    self.close_path(id, true);
                } else {
                    // The callback may have left bytes pending; re-arm so
                    // they report again next cycle.
                    self.inner.rearm(id);
                }
            }
            Ok(Probe::Eof) => {
                self.close_path(id, false);
            }
            Ok(Probe::Nothing) => {
                warn!(id, "spurious readiness");
            }
            Err(err) => {
                debug!(id, %err, "stream failed while probing");
                self.close_path(id, false);
            }
        }
        Ok(())
    }

    // The step-detected close path: detach, report, destroy. Distinct from
    // close_stream, which never reports.
    fn close_path(&mut self, id: usize, abnormal: bool) {
        if let Some(stream) = self.inner.detach(id) {
            info!(id, target = %stream.target_name(), abnormal, "connection closed");
            self.handler.connection_closed(
                &mut HubContext {
                    inner: &mut self.inner,
                },
                stream.as_ref(),
                abnormal,
            );
        }
    }

    fn close_if_failed(&mut self, id: usize) {
        let failed = self
            .inner
            .entries
            .get(&id)
            .map(|entry| entry.stream.failed());
        if failed == Some(true) {
            self.close_path(id, true);
        }
    }
}

impl Drop for Hub {
    // Teardown destroys every remaining stream without callbacks.
    fn drop(&mut self) {
        let count = self.inner.entries.len();
        if count > 0 {
            debug!(count, "destroying remaining streams");
        }
    }
}
