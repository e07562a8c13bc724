//! Boucle de dispatch : le seul thread qui touche aux clients.
//!
//! It waits on two things: the event channel's wake socket and the TCP
//! listener. Worker threads never call into the output directly; they
//! emit events whose handlers, registered here, run on this thread.

use std::rc::Rc;

use pmoevent::{EventChannel, EventKind};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::output::{HttpdOutput, SharedOutput};
use crate::source::SourceFeed;

/// Registers the daemon's handlers on `events`.
///
/// - `AudioReady`: broadcasts every page the source produced
/// - `Tag`: sends the latest title as ICY metadata
/// - `ClientList`: logs the number of listeners
/// - `Shutdown`: raises `Signal`, which ends [`run_dispatch`]
///
/// Without a source only the last two are installed.
pub fn install_handlers(
    events: &mut EventChannel,
    output: &SharedOutput,
    feed: Option<SourceFeed>,
) -> Result<()> {
    if let Some(feed) = feed {
        let feed = Rc::new(feed);

        let pages_out = Rc::clone(output);
        let pages = Rc::clone(&feed);
        events.register(EventKind::AudioReady, move || {
            let output = pages_out.borrow();
            for page in pages.pages() {
                output.broadcast(&page);
            }
        })?;

        let tag_out = Rc::clone(output);
        events.register(EventKind::Tag, move || {
            if let Some(title) = feed.latest_title() {
                let mut output = tag_out.borrow_mut();
                let url = output.settings().website.clone();
                output.send_metadata(&title, &url);
            }
        })?;
    }

    let list_out = Rc::clone(output);
    events.register(EventKind::ClientList, move || {
        info!(clients = list_out.borrow().client_count(), "client list changed");
    })?;

    let emitter = events.emitter();
    events.register(EventKind::Shutdown, move || {
        info!("shutdown requested");
        if let Err(err) = emitter.signal() {
            error!(error = %err, "cannot raise the stop signal");
            emitter.emit_fast(EventKind::Signal);
        }
    })?;

    Ok(())
}

/// Runs until `Signal` is raised, then disconnects every client.
///
/// Must run inside a `LocalSet` on a current-thread runtime. Clients are
/// also disconnected when the loop fails. A broken event channel, even one
/// only seen while announcing a client list change, ends the loop with
/// [`crate::Error::Event`].
pub async fn run_dispatch(
    events: &mut EventChannel,
    output: &SharedOutput,
    listener: &TcpListener,
) -> Result<()> {
    let result = serve(events, output, listener).await;
    if let Err(err) = &result {
        error!(error = %err, "dispatch loop failed");
    }

    let closed = output.borrow_mut().close_all();
    result.and(closed)
}

async fn serve(
    events: &mut EventChannel,
    output: &SharedOutput,
    listener: &TcpListener,
) -> Result<()> {
    let wake = AsyncFd::with_interest(events.wake_reader()?, Interest::READABLE)?;
    let faults = output.borrow().fault_notifier();

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "streaming");
    }

    loop {
        tokio::select! {
            guard = wake.readable() => {
                let mut guard = guard?;
                let stop = events.consume()?;
                // consume() drained the socket until it would block
                guard.clear_ready();
                if stop {
                    info!("stop signal received");
                    return Ok(());
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "incoming connection");
                    HttpdOutput::accept(output, stream, peer)?;
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = faults.notified() => {
                if let Some(err) = output.borrow_mut().take_fault() {
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StreamSettings;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_shutdown_event_stops_the_loop() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut events = EventChannel::new().unwrap();
                let output = HttpdOutput::new(StreamSettings::default()).into_shared();
                install_handlers(&mut events, &output, None).unwrap();

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                events.emitter().emit(EventKind::Shutdown).unwrap();

                run_dispatch(&mut events, &output, &listener).await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_fast_signal_stops_the_loop() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut events = EventChannel::new().unwrap();
                let output = HttpdOutput::new(StreamSettings::default()).into_shared();
                install_handlers(&mut events, &output, None).unwrap();
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

                let emitter = events.emitter();
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    emitter.emit_fast(EventKind::Signal);
                });

                run_dispatch(&mut events, &output, &listener).await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_unhandled_event_is_fatal() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut events = EventChannel::new().unwrap();
                let output = HttpdOutput::new(StreamSettings::default()).into_shared();
                install_handlers(&mut events, &output, None).unwrap();
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

                events.emit(EventKind::Reload).unwrap();
                let err = run_dispatch(&mut events, &output, &listener)
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    crate::Error::Event(pmoevent::EventError::Unhandled(EventKind::Reload))
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn test_broken_client_list_announce_is_fatal() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let mut events = EventChannel::new().unwrap();

                // the output announces on a channel nobody reads anymore
                let gone = EventChannel::new().unwrap();
                let output = HttpdOutput::new(StreamSettings::default())
                    .with_events(gone.emitter())
                    .into_shared();
                drop(gone);

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let (result, remote) = tokio::join!(
                    run_dispatch(&mut events, &output, &listener),
                    tokio::net::TcpStream::connect(addr),
                );
                remote.unwrap();

                let err = result.unwrap_err();
                assert!(matches!(
                    err,
                    crate::Error::Event(pmoevent::EventError::Io(_))
                ));
                assert_eq!(output.borrow().client_count(), 0);
            })
            .await;
    }

    #[test]
    fn test_handlers_cannot_be_installed_twice() {
        let mut events = EventChannel::new().unwrap();
        let output = HttpdOutput::new(StreamSettings::default()).into_shared();
        install_handlers(&mut events, &output, None).unwrap();
        assert!(install_handlers(&mut events, &output, None).is_err());
    }
}
