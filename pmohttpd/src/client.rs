//! Client de streaming HTTP : une machine à états par connexion.
//!
//! ```text
//! Request ──► Headers ──► Response
//!    │           │            │
//!    └───────────┴────────────┴──► fermé (sur toute erreur)
//! ```
//!
//! Pendant `Request`/`Headers` le client lit la requête ligne par ligne.
//! En `Response` il ne fait plus qu'écrire : l'en-tête de réponse, puis
//! les pages audio de sa file, en insérant un bloc de métadonnées ICY
//! tous les `metaint` octets audio quand le client l'a demandé.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::connection::{Connection, is_transient};
use crate::error::{ClientError, ClientResult};
use crate::icy::{self, ResponseKind};
use crate::page::Page;
use crate::settings::StreamSettings;

/// Upper bound for the request line plus headers.
pub const MAX_REQUEST_SIZE: usize = 4096;

const READ_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    /// reading the request line
    Request,
    /// reading the request headers
    Headers,
    /// sending the response
    Response,
}

/// Request bytes with a parse cursor.
///
/// `start` is the first byte not yet returned as a line, `scanned` the
/// first byte not yet searched for a delimiter. Consumed bytes are dropped
/// by `compact` before each read.
#[derive(Debug, Default)]
struct LineBuffer {
    data: Vec<u8>,
    start: usize,
    scanned: usize,
}

impl LineBuffer {
    fn free_space(&self) -> usize {
        MAX_REQUEST_SIZE.saturating_sub(self.data.len() - self.start)
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.data[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.data.len();
            return None;
        };

        let end = self.scanned + offset;
        let line = &self.data[self.start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line).into_owned();

        self.start = end + 1;
        self.scanned = self.start;
        Some(text)
    }
}

/// Bytes being sent with their own progress cursor.
#[derive(Debug)]
struct Outgoing {
    page: Page,
    position: usize,
}

impl Outgoing {
    fn new(page: Page) -> Self {
        Self { page, position: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.page[self.position..]
    }

    fn is_done(&self) -> bool {
        self.position >= self.page.len()
    }
}

/// Metadata block being injected at a boundary.
#[derive(Debug)]
struct MetadataBlock {
    data: Outgoing,
    /// Carries the client's current metadata (as opposed to an empty
    /// block, or metadata replaced while the block was in flight).
    current: bool,
}

/// One listener of the stream.
///
/// Owned by the output that accepted the connection; driven from the
/// dispatch thread only. Any `Err` returned by [`read`](Self::read) or
/// [`write`](Self::write) means the client must be closed and discarded.
pub struct HttpdClient<C: Connection> {
    connection: Option<C>,
    settings: Arc<StreamSettings>,

    state: ClientState,

    /// Only present while the request is read.
    input: Option<LineBuffer>,

    /// Status line and headers, sent before any page.
    response: Option<Outgoing>,

    /// Pages waiting to be sent.
    pages: VecDeque<Page>,

    /// The page being sent and how much of it already went out.
    current_page: Option<Page>,
    current_position: usize,

    /// Whether the owner watches the socket for writability on our behalf.
    write_armed: bool,

    dlna_streaming_requested: bool,

    /* ICY */
    /// Can we send ICY metadata to this client at all?
    metadata_supported: bool,
    /// Did the client ask for it (and is it supported)?
    metadata_requested: bool,
    /// Whether `metadata` was already delivered.
    metadata_sent: bool,
    metaint: usize,
    metadata: Option<Page>,
    metadata_block: Option<MetadataBlock>,
    /// Audio bytes sent since the last metadata block.
    metadata_fill: usize,
}

impl<C: Connection> HttpdClient<C> {
    pub fn new(connection: C, settings: Arc<StreamSettings>) -> Self {
        let metadata_supported = settings.metadata_supported;
        Self {
            connection: Some(connection),
            settings,
            state: ClientState::Request,
            input: Some(LineBuffer::default()),
            response: None,
            pages: VecDeque::new(),
            current_page: None,
            current_position: 0,
            write_armed: false,
            dlna_streaming_requested: false,
            metadata_supported,
            metadata_requested: false,
            metadata_sent: true,
            metaint: 0,
            metadata: None,
            metadata_block: None,
            metadata_fill: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    /// Whether ICY metadata is interleaved in this client's stream.
    pub fn is_metadata_requested(&self) -> bool {
        self.metadata_requested
    }

    pub fn is_dlna_streaming(&self) -> bool {
        self.dlna_streaming_requested
    }

    pub fn metaint(&self) -> usize {
        self.metaint
    }

    pub fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.connection.as_mut()
    }

    /// Unsent bytes of the current page plus every queued page.
    ///
    /// The response header is not counted.
    pub fn queue_size(&self) -> usize {
        let current = self
            .current_page
            .as_ref()
            .map_or(0, |page| page.len() - self.current_position);
        current + self.pages.iter().map(Page::len).sum::<usize>()
    }

    /// Whether there is something to write; the owner watches for
    /// writability while this is true.
    pub fn wants_write(&self) -> bool {
        self.connection.is_some()
            && self.state == ClientState::Response
            && (self.response.is_some() || self.current_page.is_some() || !self.pages.is_empty())
    }

    /// Audio bytes that may still be sent before the next metadata block,
    /// or `None` when no metadata is interleaved.
    pub fn bytes_till_metadata(&self) -> Option<usize> {
        self.metadata_requested
            .then(|| self.metaint.saturating_sub(self.metadata_fill))
    }

    /// Reads what the socket has and handles every complete request line.
    pub fn read(&mut self) -> ClientResult<()> {
        let connection = self.connection.as_mut().ok_or(ClientError::Closed)?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        let Some(input) = self.input.as_mut() else {
            // the request is complete, whatever follows is ignored
            return match connection.try_read(&mut chunk) {
                Ok(0) => Err(ClientError::Disconnected),
                Ok(_) => Ok(()),
                Err(err) if is_transient(&err) => Ok(()),
                Err(err) => Err(err.into()),
            };
        };

        input.compact();
        let limit = input.free_space().min(READ_CHUNK_SIZE);
        if limit == 0 {
            warn!("request too large, dropping client");
            return Err(ClientError::RequestTooLarge);
        }

        let n = match connection.try_read(&mut chunk[..limit]) {
            Ok(0) => {
                debug!(state = ?self.state, "client closed the connection during the request");
                return Err(ClientError::Disconnected);
            }
            Ok(n) => n,
            Err(err) if is_transient(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        input.extend(&chunk[..n]);

        self.received()
    }

    fn received(&mut self) -> ClientResult<()> {
        while self.state != ClientState::Response {
            let Some(line) = self.read_line() else {
                break;
            };
            self.handle_line(&line)?;
        }
        Ok(())
    }

    /// Removes the first complete line from the input buffer and returns
    /// it without its `\n` or `\r\n` terminator.
    pub fn read_line(&mut self) -> Option<String> {
        self.input.as_mut()?.next_line()
    }

    /// Handles one line of the request.
    pub fn handle_line(&mut self, line: &str) -> ClientResult<()> {
        match self.state {
            ClientState::Request => self.handle_request_line(line),
            ClientState::Headers if line.is_empty() => {
                // empty line: request is finished
                self.begin_response();
                Ok(())
            }
            ClientState::Headers => self.handle_header_line(line),
            ClientState::Response => Ok(()),
        }
    }

    fn handle_request_line(&mut self, line: &str) -> ClientResult<()> {
        let malformed = || ClientError::MalformedRequest(line.to_string());

        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().ok_or_else(malformed)?;
        let target = parts.next().ok_or_else(malformed)?;
        if !target.starts_with('/') {
            return Err(malformed());
        }
        if method != "GET" {
            return Err(ClientError::UnsupportedMethod(method.to_string()));
        }

        match (parts.next(), parts.next()) {
            (None, _) => {
                // HTTP/0.9 without request headers
                debug!(target, "HTTP/0.9 request");
                self.begin_response();
                Ok(())
            }
            (Some(version), None) if version.starts_with("HTTP/") => {
                trace!(target, version, "request line");
                self.state = ClientState::Headers;
                Ok(())
            }
            _ => Err(malformed()),
        }
    }

    fn handle_header_line(&mut self, line: &str) -> ClientResult<()> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ClientError::MalformedRequest(line.to_string()))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Icy-MetaData") {
            if value == "1" {
                self.metadata_requested = self.metadata_supported;
            }
        } else if name.eq_ignore_ascii_case("transferMode.dlna.org")
            && value.eq_ignore_ascii_case("Streaming")
        {
            // DLNA renderers do not understand interleaved metadata
            self.dlna_streaming_requested = true;
            self.metadata_supported = false;
            self.metadata_requested = false;
        }

        Ok(())
    }

    /// Switches to `Response` and queues the status line and headers.
    pub fn begin_response(&mut self) {
        self.state = ClientState::Response;
        self.input = None;

        self.metadata_requested =
            self.metadata_requested && self.metadata_supported && self.settings.metaint > 0;
        self.metaint = self.settings.metaint;
        self.metadata_fill = 0;

        let kind = if self.dlna_streaming_requested {
            ResponseKind::Dlna
        } else if self.metadata_requested {
            ResponseKind::Icy {
                metaint: self.metaint,
            }
        } else {
            ResponseKind::Plain
        };
        debug!(?kind, "begin response");

        self.response = Some(Outgoing::new(kind.preamble(&self.settings)));
        self.write_armed = true;
    }

    /// Sends as much as the socket accepts.
    ///
    /// Returns on "would block" with every cursor updated, so the next
    /// call resumes exactly where this one stopped. Audio sends are cut at
    /// the metadata boundary before reaching the socket.
    pub fn write(&mut self) -> ClientResult<()> {
        if self.connection.is_none() {
            return Err(ClientError::Closed);
        }
        if self.state != ClientState::Response {
            return Ok(());
        }

        loop {
            if let Some(response) = self.response.as_mut() {
                let connection = self.connection.as_mut().ok_or(ClientError::Closed)?;
                let wanted = response.remaining().len();
                let Some(n) = send(connection, response.remaining())? else {
                    return Ok(());
                };
                response.position += n;
                if response.is_done() {
                    trace!("response header sent");
                    self.response = None;
                }
                if n < wanted {
                    return Ok(());
                }
                continue;
            }

            if self.current_page.is_none() {
                match self.pages.pop_front() {
                    Some(page) => {
                        self.current_page = Some(page);
                        self.current_position = 0;
                    }
                    None => {
                        self.write_armed = false;
                        return Ok(());
                    }
                }
            }

            if self.metadata_requested && self.metadata_fill >= self.metaint {
                if !self.send_metadata_block()? {
                    return Ok(());
                }
                continue;
            }

            let limit = self.bytes_till_metadata();
            let Some(page) = self.current_page.as_ref() else {
                continue;
            };
            let remaining = &page[self.current_position..];
            let wanted = limit.map_or(remaining.len(), |limit| remaining.len().min(limit));

            let connection = self.connection.as_mut().ok_or(ClientError::Closed)?;
            let Some(n) = send(connection, &remaining[..wanted])? else {
                return Ok(());
            };

            self.current_position += n;
            if self.metadata_requested {
                self.metadata_fill += n;
            }
            if self.current_position >= page.len() {
                self.current_page = None;
                self.current_position = 0;
            }

            if n < wanted {
                return Ok(());
            }
        }
    }

    /// Sends (or resumes) the block due at the current boundary. Returns
    /// `true` once it is completely sent.
    fn send_metadata_block(&mut self) -> ClientResult<bool> {
        let mut block = match self.metadata_block.take() {
            Some(block) => block,
            None => match &self.metadata {
                Some(page) if !self.metadata_sent => MetadataBlock {
                    data: Outgoing::new(page.clone()),
                    current: true,
                },
                _ => MetadataBlock {
                    data: Outgoing::new(icy::empty_metadata_page()),
                    current: false,
                },
            },
        };

        let connection = self.connection.as_mut().ok_or(ClientError::Closed)?;
        let Some(n) = send(connection, block.data.remaining())? else {
            self.metadata_block = Some(block);
            return Ok(false);
        };
        block.data.position += n;

        if !block.data.is_done() {
            self.metadata_block = Some(block);
            return Ok(false);
        }

        if block.current {
            trace!(len = block.data.page.len(), "metadata sent");
            self.metadata_sent = true;
        }
        self.metadata_fill = 0;
        Ok(true)
    }

    /// Appends a page to the queue.
    ///
    /// Ignored while the request is still being read. Returns `true` when
    /// this call armed the write watch: the owner must then start watching
    /// the socket for writability.
    pub fn push_page(&mut self, page: Page) -> bool {
        if self.connection.is_none() || self.state != ClientState::Response || page.is_empty() {
            return false;
        }

        self.pages.push_back(page);
        if self.write_armed {
            false
        } else {
            self.write_armed = true;
            true
        }
    }

    /// Replaces the metadata delivered at the next boundary.
    pub fn push_metadata(&mut self, page: Page) {
        if let Some(block) = self.metadata_block.as_mut() {
            // the block in flight is finished as it started
            block.current = false;
        }
        self.metadata = Some(page);
        self.metadata_sent = false;
    }

    /// Drops every queued page and the page being sent.
    ///
    /// A metadata block already started is kept so the framing stays
    /// intact.
    pub fn cancel_queue(&mut self) {
        if self.state != ClientState::Response {
            return;
        }

        self.pages.clear();
        self.current_page = None;
        self.current_position = 0;
        self.write_armed = self.wants_write();
    }

    /// Releases the connection and every buffer. Safe to call again.
    pub fn close(&mut self) {
        if self.connection.take().is_none() {
            return;
        }
        trace!(state = ?self.state, "closing client");

        self.input = None;
        self.response = None;
        self.pages.clear();
        self.current_page = None;
        self.current_position = 0;
        self.metadata = None;
        self.metadata_block = None;
        self.write_armed = false;
    }
}

/// `Ok(None)` on a transient error.
fn send<C: Connection>(connection: &mut C, data: &[u8]) -> ClientResult<Option<usize>> {
    match connection.try_write(data) {
        Ok(0) => Err(ClientError::Io(std::io::ErrorKind::WriteZero.into())),
        Ok(n) => Ok(Some(n)),
        Err(err) if is_transient(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl<C: Connection> std::fmt::Debug for HttpdClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpdClient")
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .field("queue_size", &self.queue_size())
            .field("metadata_requested", &self.metadata_requested)
            .field("metadata_fill", &self.metadata_fill)
            .finish_non_exhaustive()
    }
}
