//! # pmoevent
//!
//! Cross-thread event notification for the single dispatch thread of the
//! streaming daemon.
//!
//! Worker threads (source readers, encoders, the player) raise an
//! [`EventKind`] through an [`EventEmitter`]. The dispatch thread watches
//! the readable end of the channel alongside its sockets and calls
//! [`EventChannel::consume`], which runs one handler per pending kind.
//!
//! Events are level-coalesced: emitting a kind that is already pending is
//! a no-op, so a burst of emissions costs one wake-up byte and one handler
//! call. Only "at least one emission happened since the last consume" is
//! preserved, not the number or the order of emissions.
//!
//! ## Usage
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use pmoevent::{EventChannel, EventKind};
//!
//! let mut channel = EventChannel::new()?;
//! let hits = Rc::new(Cell::new(0));
//! let counter = Rc::clone(&hits);
//! channel.register(EventKind::AudioReady, move || counter.set(counter.get() + 1))?;
//!
//! let emitter = channel.emitter();
//! std::thread::spawn(move || {
//!     emitter.emit(EventKind::AudioReady).unwrap();
//!     emitter.emit(EventKind::AudioReady).unwrap();
//! })
//! .join()
//! .unwrap();
//!
//! let signal = channel.consume()?;
//! assert!(!signal);
//! assert_eq!(hits.get(), 1);
//! # Ok::<(), pmoevent::EventError>(())
//! ```

mod channel;
mod error;
mod kind;

pub use channel::{EventChannel, EventEmitter};
pub use error::{EventError, Result};
pub use kind::EventKind;
