use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use pmoevent::{EventChannel, EventKind};
use pmohttpd::{
    ClientState, HttpdClient, HttpdOutput, Page, SourceOptions, StreamSettings, install_handlers,
    run_dispatch, spawn_source,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;

/// Reads until the end of the response header plus `body_len` bytes.
async fn read_response(stream: &mut TcpStream, body_len: usize) -> anyhow::Result<(String, Vec<u8>)> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let body_start = end + 4;
            if data.len() >= body_start + body_len {
                let header = String::from_utf8(data[..body_start].to_vec())?;
                let body = data[body_start..body_start + body_len].to_vec();
                return Ok((header, body));
            }
        }
        let n = stream.read(&mut buf).await?;
        anyhow::ensure!(n > 0, "connection closed after {} bytes", data.len());
        data.extend_from_slice(&buf[..n]);
    }
}

/// Audio bytes and metadata payloads of an ICY body. A block cut by the
/// end of `body` is dropped.
fn split_icy(body: &[u8], metaint: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut audio = Vec::new();
    let mut blocks = Vec::new();
    let mut rest = body;
    loop {
        let take = rest.len().min(metaint);
        audio.extend_from_slice(&rest[..take]);
        rest = &rest[take..];
        let Some(&len) = rest.first() else {
            return (audio, blocks);
        };
        let len = len as usize * 16;
        if rest.len() < 1 + len {
            return (audio, blocks);
        }
        blocks.push(rest[1..1 + len].to_vec());
        rest = &rest[1 + len..];
    }
}

/// Played in a loop, this file is the sequence 0, 1, ..., 255, 0, 1, ...
fn counting_file() -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("Test Tone")
        .suffix(".mp3")
        .tempfile()?;
    let data: Vec<u8> = (0..64 * 256).map(|i| i as u8).collect();
    file.write_all(&data)?;
    file.flush()?;
    Ok(file)
}

fn assert_counting(audio: &[u8]) {
    for pair in audio.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1), "audio is not contiguous");
    }
}

#[tokio::test]
async fn streams_source_to_icy_and_plain_listeners() -> anyhow::Result<()> {
    let file = counting_file()?;
    let local = LocalSet::new();

    local
        .run_until(async move {
            let metaint = 1000;
            let mut events = EventChannel::new()?;
            let output = HttpdOutput::new(StreamSettings {
                metaint,
                ..StreamSettings::default()
            })
            .with_events(events.emitter())
            .into_shared();

            let options = SourceOptions {
                page_size: 512,
                bitrate_kbps: 8000,
                looping: true,
                ..SourceOptions::new(file.path())
            };
            let (feed, worker) = spawn_source(options, events.emitter())?;
            install_handlers(&mut events, &output, Some(feed))?;

            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let stop = events.emitter();
            let dispatch_output = output.clone();
            let dispatch = tokio::task::spawn_local(async move {
                run_dispatch(&mut events, &dispatch_output, &listener).await
            });

            let mut icy = TcpStream::connect(addr).await?;
            icy.write_all(b"GET /stream HTTP/1.1\r\nIcy-MetaData: 1\r\n\r\n")
                .await?;
            let mut plain = TcpStream::connect(addr).await?;
            plain.write_all(b"GET /stream HTTP/1.0\r\n\r\n").await?;

            let (header, body) = read_response(&mut icy, 5000).await?;
            assert!(header.starts_with("ICY 200 OK\r\n"));
            assert!(header.contains("icy-metaint:1000\r\n"));

            let (audio, blocks) = split_icy(&body, metaint);
            assert!(audio.len() >= 3 * metaint);
            assert_counting(&audio);
            assert!(
                blocks[0].starts_with(b"StreamTitle='Test Tone"),
                "{:?}",
                String::from_utf8_lossy(&blocks[0])
            );

            let (header, body) = read_response(&mut plain, 5000).await?;
            assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(!header.contains("icy-"));
            assert_counting(&body);

            assert_eq!(output.borrow().client_count(), 2);

            stop.emit_fast(EventKind::Signal);
            dispatch.await??;
            assert_eq!(output.borrow().client_count(), 0);

            // the dispatch task dropped the handlers, hence the feed
            worker.join().map_err(|_| anyhow::anyhow!("source worker panicked"))?;

            // both listeners see the end of the stream
            let mut rest = Vec::new();
            icy.read_to_end(&mut rest).await?;
            rest.clear();
            plain.read_to_end(&mut rest).await?;
            anyhow::Ok(())
        })
        .await
}

#[tokio::test]
async fn finite_source_shuts_the_daemon_down() -> anyhow::Result<()> {
    let file = counting_file()?;
    let local = LocalSet::new();

    local
        .run_until(async move {
            let mut events = EventChannel::new()?;
            let output = HttpdOutput::new(StreamSettings::default()).into_shared();

            let options = SourceOptions {
                bitrate_kbps: 0,
                looping: false,
                ..SourceOptions::new(file.path())
            };
            let (feed, worker) = spawn_source(options, events.emitter())?;
            install_handlers(&mut events, &output, Some(feed))?;

            let listener = TcpListener::bind("127.0.0.1:0").await?;
            tokio::time::timeout(
                Duration::from_secs(10),
                run_dispatch(&mut events, &output, &listener),
            )
            .await??;

            worker.join().map_err(|_| anyhow::anyhow!("source worker panicked"))?;
            anyhow::Ok(())
        })
        .await
}

#[test]
fn std_stream_drives_a_client() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let remote = std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut stream = std::net::TcpStream::connect(addr)?;
        stream.write_all(b"GET / HTTP/1.1\r\nIcy-MetaData: 1\r\n\r\n")?;
        let mut received = Vec::new();
        stream.read_to_end(&mut received)?;
        Ok(received)
    });

    let (stream, _) = listener.accept()?;
    stream.set_nonblocking(true)?;
    let settings = Arc::new(StreamSettings {
        metaint: 4,
        ..StreamSettings::default()
    });
    let mut client = HttpdClient::new(stream, settings);

    while client.state() != ClientState::Response {
        client.read()?;
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(client.is_metadata_requested());

    client.push_page(Page::from(b"0123456789".to_vec()));
    while client.wants_write() {
        client.write()?;
    }
    client.close();

    let received = remote
        .join()
        .map_err(|_| anyhow::anyhow!("remote thread panicked"))??;
    let end = received
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("no response header"))?;
    assert_eq!(&received[end + 4..], b"0123\x004567\x0089");

    Ok(())
}
