//! Canal d'événements adossé à une paire de sockets locales.
//!
//! N'importe quel thread peut lever un [`EventKind`] ; le thread de
//! dispatch surveille l'extrémité de lecture avec son primitive de polling
//! et appelle [`EventChannel::consume`] quand elle devient lisible.
//!
//! Un drapeau déjà levé et pas encore consommé ne provoque aucune nouvelle
//! écriture : une rafale d'émissions coûte au plus un octet de réveil par
//! type d'événement.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, trace};

use crate::{EventError, EventKind, Result};

const DRAIN_BUFFER_SIZE: usize = 256;

type Handler = Box<dyn FnMut()>;

/// État partagé entre le thread de dispatch et les émetteurs.
struct Shared {
    /// Drapeaux du chemin verrouillé.
    pending: Mutex<[bool; EventKind::COUNT]>,
    /// Drapeaux du chemin rapide, sans verrou (voir `emit_fast`).
    fast_pending: AtomicU32,
    writer: UnixStream,
}

impl Shared {
    fn emit(&self, kind: EventKind) -> Result<()> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending[kind.index()] {
                // already set: the consumer has a wake-up byte coming
                return Ok(());
            }
            pending[kind.index()] = true;
        }

        match (&self.writer).write(&[0]) {
            Ok(_) => Ok(()),
            Err(err) if is_transient(&err) => Ok(()),
            Err(err) => {
                error!(event = %kind, error = %err, "error writing to the event channel");
                Err(EventError::Io(err))
            }
        }
    }

    fn emit_fast(&self, kind: EventKind) {
        self.fast_pending.fetch_or(kind.bit(), Ordering::SeqCst);
        let _ = (&self.writer).write(&[0]);
    }

    /// Snapshot and clear both flag sets.
    fn take_pending(&self) -> [bool; EventKind::COUNT] {
        let mut events = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };

        let fast = self.fast_pending.swap(0, Ordering::SeqCst);
        for kind in EventKind::ALL {
            if fast & kind.bit() != 0 {
                events[kind.index()] = true;
            }
        }
        events
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Cloneable, thread-safe handle used by worker threads to raise events.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl EventEmitter {
    /// Marks `kind` pending and wakes the dispatch thread unless it was
    /// already pending.
    ///
    /// An error means the wake channel is broken; the daemon cannot go on.
    pub fn emit(&self, kind: EventKind) -> Result<()> {
        self.shared.emit(kind)
    }

    /// Best-effort variant usable where taking a lock is not allowed
    /// (signal handlers and similar degraded contexts).
    ///
    /// It never blocks and never fails: the flag is set with an atomic
    /// operation and a wake-up byte is written unconditionally, without the
    /// coalescing check of [`emit`](Self::emit). Write errors are ignored, so
    /// under a saturated channel the wake-up may rely on bytes already
    /// queued by other emitters.
    pub fn emit_fast(&self, kind: EventKind) {
        self.shared.emit_fast(kind)
    }

    /// Shorthand for `emit(EventKind::Signal)`.
    pub fn signal(&self) -> Result<()> {
        self.shared.emit(EventKind::Signal)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

/// The dispatch side of the channel.
///
/// Owns the reader end and the handler table. It lives on the dispatch
/// thread: handlers are plain `FnMut` closures and may capture
/// thread-local state. Dropping the channel closes the wake channel once
/// the last [`EventEmitter`] is gone.
pub struct EventChannel {
    shared: Arc<Shared>,
    reader: UnixStream,
    handlers: [Option<Handler>; EventKind::COUNT],
}

impl EventChannel {
    /// Creates the wake channel. Both ends are non-blocking.
    pub fn new() -> Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            shared: Arc::new(Shared {
                pending: Mutex::new([false; EventKind::COUNT]),
                fast_pending: AtomicU32::new(0),
                writer,
            }),
            reader,
            handlers: std::array::from_fn(|_| None),
        })
    }

    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Associates `handler` with `kind`.
    ///
    /// Fails if `kind` is [`EventKind::Signal`] or already has a handler.
    pub fn register<F>(&mut self, kind: EventKind, handler: F) -> Result<()>
    where
        F: FnMut() + 'static,
    {
        if kind == EventKind::Signal {
            return Err(EventError::Reserved);
        }

        let slot = &mut self.handlers[kind.index()];
        if slot.is_some() {
            return Err(EventError::AlreadyRegistered(kind));
        }

        *slot = Some(Box::new(handler));
        Ok(())
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers[kind.index()].is_some()
    }

    pub fn emit(&self, kind: EventKind) -> Result<()> {
        self.shared.emit(kind)
    }

    /// See [`EventEmitter::emit_fast`].
    pub fn emit_fast(&self, kind: EventKind) {
        self.shared.emit_fast(kind)
    }

    pub fn signal(&self) -> Result<()> {
        self.shared.emit(EventKind::Signal)
    }

    /// Duplicates the reader end so the dispatch loop can register it with
    /// its poller. Readiness of the duplicate is readiness of the channel.
    pub fn wake_reader(&self) -> Result<UnixStream> {
        Ok(self.reader.try_clone()?)
    }

    /// Drains the wake channel, then runs the handler of every pending
    /// kind once, in [`EventKind::ALL`] order.
    ///
    /// Returns `true` when [`EventKind::Signal`] was pending; that kind is
    /// left to the caller.
    pub fn consume(&mut self) -> Result<bool> {
        self.drain()?;
        let events = self.shared.take_pending();

        for kind in EventKind::ALL {
            if kind == EventKind::Signal || !events[kind.index()] {
                continue;
            }

            match self.handlers[kind.index()].as_mut() {
                Some(handler) => {
                    trace!(event = %kind, "dispatching event");
                    handler();
                }
                None => {
                    error!(event = %kind, "no handler registered");
                    return Err(EventError::Unhandled(kind));
                }
            }
        }

        Ok(events[EventKind::Signal.index()])
    }

    /// Blocks until the wake channel is readable, then behaves like
    /// [`consume`](Self::consume).
    ///
    /// For callers without a poller of their own. The reader is switched
    /// to blocking mode for the duration of the call, and that mode is
    /// shared with every [`wake_reader`](Self::wake_reader) duplicate: do
    /// not call `wait` while such a duplicate is registered with a poller.
    pub fn wait(&mut self) -> Result<bool> {
        self.reader.set_nonblocking(false)?;
        let mut byte = [0u8; 1];
        let read = loop {
            match self.reader.read(&mut byte) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        self.reader.set_nonblocking(true)?;
        read?;

        self.consume()
    }

    /// Reads every byte currently available. Returns how many were read.
    fn drain(&mut self) -> Result<usize> {
        let mut buffer = [0u8; DRAIN_BUFFER_SIZE];
        let mut total = 0;

        loop {
            match self.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if is_transient(&err) => break,
                Err(err) => {
                    error!(error = %err, "error reading from the event channel");
                    return Err(EventError::Io(err));
                }
            }
        }

        Ok(total)
    }
}

impl AsFd for EventChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect();
        f.debug_struct("EventChannel")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}
