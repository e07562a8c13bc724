//! Démon de streaming : `pmohttpd [CONFIG_DIR]`
//!
//! Serves the configured source file to every HTTP/ICY listener until the
//! source ends (without loop) or Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use pmoconfig::{Config, get_config};
use pmoevent::{EventChannel, EventKind};
use pmohttpd::logs::init_logging;
use pmohttpd::{
    HttpdOutput, SourceOptions, StreamSettings, install_handlers, run_dispatch, spawn_source,
};
use tokio::net::TcpListener;
use tokio::task::LocalSet;
use tracing::{info, warn};

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(dir) => Arc::new(Config::load_config(&dir)?),
        None => get_config(),
    };

    init_logging(&config);

    // un seul thread : tous les clients vivent sur la boucle de dispatch
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start the runtime")?;

    let local = LocalSet::new();
    runtime.block_on(local.run_until(serve(config)))
}

async fn serve(config: Arc<Config>) -> Result<()> {
    let settings = StreamSettings::from_config(&config)?;
    let addr: SocketAddr = format!("{}:{}", config.get_bind_address()?, config.get_http_port())
        .parse()
        .context("invalid bind address")?;

    let mut events = EventChannel::new()?;
    let output = HttpdOutput::new(settings)
        .with_events(events.emitter())
        .into_shared();

    let source = match SourceOptions::from_config(&config)? {
        Some(options) => {
            let (feed, handle) = spawn_source(options, events.emitter())?;
            Some((feed, handle))
        }
        None => {
            warn!("no source.path configured, listeners will get no audio");
            None
        }
    };
    let (feed, worker) = source.unzip();
    install_handlers(&mut events, &output, feed)?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;

    let emitter = events.emitter();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            emitter.emit_fast(EventKind::Signal);
        }
    });

    run_dispatch(&mut events, &output, &listener).await?;

    // le worker s'arrête dès que le feed est libéré
    drop(events);
    if let Some(worker) = worker {
        if worker.join().is_err() {
            warn!("source worker panicked");
        }
    }

    info!("bye");
    Ok(())
}
