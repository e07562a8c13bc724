//! # PMOHttpd - diffusion audio en direct sur HTTP/ICY
//!
//! Each listener is an [`HttpdClient`]: a small state machine that reads
//! the HTTP request, then streams the pages queued on it, interleaving
//! SHOUTcast metadata blocks every `metaint` audio bytes when the client
//! asked for them.
//!
//! All clients live on one dispatch thread ([`run_dispatch`]). Worker
//! threads such as the [source](spawn_source) hand data over through
//! channels and wake that thread with the [`pmoevent`] event channel.
//!
//! ```no_run
//! use pmoevent::EventChannel;
//! use pmohttpd::{HttpdOutput, StreamSettings, install_handlers, run_dispatch};
//! use tokio::net::TcpListener;
//! use tokio::task::LocalSet;
//!
//! # async fn serve() -> anyhow::Result<()> {
//! let local = LocalSet::new();
//! local
//!     .run_until(async {
//!         let mut events = EventChannel::new()?;
//!         let output = HttpdOutput::new(StreamSettings::default())
//!             .with_events(events.emitter())
//!             .into_shared();
//!         install_handlers(&mut events, &output, None)?;
//!
//!         let listener = TcpListener::bind("0.0.0.0:8000").await?;
//!         run_dispatch(&mut events, &output, &listener).await?;
//!         anyhow::Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod icy;
pub mod logs;
pub mod output;
pub mod page;
pub mod settings;
pub mod source;

pub use client::{ClientState, HttpdClient, MAX_REQUEST_SIZE};
pub use connection::Connection;
pub use dispatch::{install_handlers, run_dispatch};
pub use error::{ClientError, ClientResult, Error, Result};
pub use output::{ClientId, HttpdOutput, SharedOutput};
pub use page::Page;
pub use settings::StreamSettings;
pub use source::{SourceFeed, SourceOptions, spawn_source};
