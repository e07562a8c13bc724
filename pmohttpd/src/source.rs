//! Worker source : lit un fichier audio déjà encodé et le publie page par
//! page vers le thread de dispatch.
//!
//! The worker never touches the clients. It hands pages and titles over
//! through channels and announces them on the event channel; handlers
//! running on the dispatch thread do the broadcasting.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use pmoconfig::Config;
use pmoevent::{EventEmitter, EventKind};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::icy;
use crate::page::Page;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    pub path: PathBuf,
    /// Bytes per page.
    pub page_size: usize,
    /// Pacing rate; 0 sends as fast as the channel accepts.
    pub bitrate_kbps: usize,
    /// Start over at the end of the file instead of shutting down.
    pub looping: bool,
}

impl SourceOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: 4096,
            bitrate_kbps: 128,
            looping: true,
        }
    }

    /// `None` when no source file is configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        let Some(path) = config.get_source_path()? else {
            return Ok(None);
        };
        Ok(Some(Self {
            path,
            page_size: config.get_source_page_size()?.max(1),
            bitrate_kbps: config.get_source_bitrate_kbps()?,
            looping: config.get_source_loop()?,
        }))
    }

    /// Time it takes to play `bytes` at the configured bitrate.
    fn play_time(&self, bytes: u64) -> Duration {
        if self.bitrate_kbps == 0 {
            return Duration::ZERO;
        }
        let bytes_per_second = self.bitrate_kbps as u64 * 1000 / 8;
        Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64)
    }
}

/// Dispatch-thread side of the source: what the worker produced since the
/// last `AudioReady` / `Tag` event.
#[derive(Debug)]
pub struct SourceFeed {
    pages: Receiver<Page>,
    titles: Receiver<String>,
}

impl SourceFeed {
    /// Every page received so far, in order. Never blocks.
    pub fn pages(&self) -> impl Iterator<Item = Page> + '_ {
        self.pages.try_iter()
    }

    /// The most recent title; older ones are skipped.
    pub fn latest_title(&self) -> Option<String> {
        self.titles.try_iter().last()
    }
}

/// Starts the worker thread.
///
/// The worker stops by itself when the feed is dropped. When it ends for
/// any other reason it emits [`EventKind::Shutdown`].
pub fn spawn_source(
    options: SourceOptions,
    events: EventEmitter,
) -> io::Result<(SourceFeed, JoinHandle<()>)> {
    let (page_tx, page_rx) = unbounded();
    let (title_tx, title_rx) = unbounded();

    let handle = thread::Builder::new()
        .name("pmohttpd-source".into())
        .spawn(move || {
            if let Err(err) = run_source(&options, &page_tx, &title_tx, &events) {
                error!(path = %options.path.display(), error = %err, "source worker failed");
                // the locked path may be the one that failed
                events.emit_fast(EventKind::Shutdown);
            }
        })?;

    Ok((
        SourceFeed {
            pages: page_rx,
            titles: title_rx,
        },
        handle,
    ))
}

fn run_source(
    options: &SourceOptions,
    pages: &Sender<Page>,
    titles: &Sender<String>,
    events: &EventEmitter,
) -> Result<()> {
    info!(
        path = %options.path.display(),
        bitrate_kbps = options.bitrate_kbps,
        looping = options.looping,
        "source started"
    );

    let title = title_of(&options.path);
    let started = Instant::now();
    let mut total: u64 = 0;

    loop {
        let mut file = File::open(&options.path)?;

        if titles.send(title.clone()).is_err() {
            debug!("feed dropped, source stopping");
            return Ok(());
        }
        events.emit(EventKind::Tag)?;

        let mut pass: u64 = 0;
        loop {
            let mut buffer = vec![0u8; options.page_size];
            let n = read_page(&mut file, &mut buffer)?;
            if n == 0 {
                break;
            }
            buffer.truncate(n);

            if pages.send(Page::from(buffer)).is_err() {
                debug!("feed dropped, source stopping");
                return Ok(());
            }
            events.emit(EventKind::AudioReady)?;

            pass += n as u64;
            total += n as u64;

            let due = options.play_time(total);
            let elapsed = started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }

        if pass == 0 {
            warn!(path = %options.path.display(), "source file is empty");
            break;
        }
        if !options.looping {
            break;
        }
        debug!(bytes = pass, "end of source file, starting over");
    }

    info!(bytes = total, "end of source");
    events.emit(EventKind::Shutdown)?;
    Ok(())
}

/// Fills `buffer` unless the end of file comes first.
fn read_page(file: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Stream title for a file named `Artist - Title.ext`, or just its stem.
fn title_of(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.split_once(" - ") {
        Some((artist, title)) => icy::stream_title(Some(artist), Some(title)),
        None => icy::stream_title(None, Some(&stem)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmoevent::EventChannel;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    fn audio_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("Some Song")
            .suffix(".mp3")
            .tempfile()
            .unwrap();
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_play_time() {
        let options = SourceOptions::new("x");
        // 128 kbit/s = 16000 bytes/s
        assert_eq!(options.play_time(16000), Duration::from_secs(1));

        let unpaced = SourceOptions {
            bitrate_kbps: 0,
            ..SourceOptions::new("x")
        };
        assert_eq!(unpaced.play_time(1 << 20), Duration::ZERO);
    }

    #[test]
    fn test_title_from_file_name() {
        assert_eq!(title_of(Path::new("/music/Artist - Song.mp3")), "Artist - Song");
        assert_eq!(title_of(Path::new("Artist -  Song .ogg")), "Artist - Song");
        assert_eq!(title_of(Path::new(" - Song.mp3")), "Song");
        assert_eq!(title_of(Path::new("Jay-Z.mp3")), "Jay-Z");
        assert_eq!(title_of(Path::new("/")), "");
    }

    #[test]
    fn test_read_page_stops_at_end_of_file() {
        let mut input: &[u8] = &[1, 2, 3, 4, 5];
        let mut buffer = [0u8; 4];
        assert_eq!(read_page(&mut input, &mut buffer).unwrap(), 4);
        assert_eq!(read_page(&mut input, &mut buffer).unwrap(), 1);
        assert_eq!(read_page(&mut input, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_source_without_loop_pages_whole_file_then_shuts_down() {
        let file = audio_file(10_000);
        let options = SourceOptions {
            page_size: 4096,
            bitrate_kbps: 0,
            looping: false,
            ..SourceOptions::new(file.path())
        };

        let mut events = EventChannel::new().unwrap();
        let shutdown = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&shutdown);
        events.register(EventKind::AudioReady, || {}).unwrap();
        events.register(EventKind::Tag, || {}).unwrap();
        events
            .register(EventKind::Shutdown, move || *seen.borrow_mut() = true)
            .unwrap();

        let (feed, handle) = spawn_source(options, events.emitter()).unwrap();
        handle.join().unwrap();
        events.consume().unwrap();
        assert!(*shutdown.borrow());

        let sizes: Vec<usize> = feed.pages().map(|page| page.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        let title = feed.latest_title().unwrap();
        assert!(title.starts_with("Some Song"), "{title}");
    }

    #[test]
    fn test_source_stops_when_feed_is_dropped() {
        let file = audio_file(100);
        let options = SourceOptions {
            page_size: 10,
            bitrate_kbps: 0,
            looping: true,
            ..SourceOptions::new(file.path())
        };

        let events = EventChannel::new().unwrap();
        let (feed, handle) = spawn_source(options, events.emitter()).unwrap();
        drop(feed);
        handle.join().unwrap();
    }

    #[test]
    fn test_missing_file_requests_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let options = SourceOptions::new(dir.path().join("missing.mp3"));

        let mut events = EventChannel::new().unwrap();
        let shutdown = Rc::new(RefCell::new(false));
        let seen = Rc::clone(&shutdown);
        events
            .register(EventKind::Shutdown, move || *seen.borrow_mut() = true)
            .unwrap();

        let (_feed, handle) = spawn_source(options, events.emitter()).unwrap();
        handle.join().unwrap();
        events.consume().unwrap();
        assert!(*shutdown.borrow());
    }
}
