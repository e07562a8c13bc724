//! Encodage des métadonnées ICY (SHOUTcast) et des en-têtes de réponse.
//!
//! ICY format: `StreamTitle='Artist - Title';StreamUrl='url';`
//! padded with NUL bytes to a multiple of 16, prefixed with one byte
//! holding the padded length divided by 16.

use crate::page::Page;
use crate::settings::StreamSettings;

/// Largest payload a single length byte can describe.
const MAX_METADATA_LEN: usize = 255 * 16;

const TITLE_PREFIX: &str = "StreamTitle='";
const URL_PREFIX: &str = "';StreamUrl='";
const SUFFIX: &str = "';";
const FRAMING_LEN: usize = TITLE_PREFIX.len() + URL_PREFIX.len() + SUFFIX.len();

static EMPTY_METADATA: [u8; 1] = [0];

/// The one-byte block meaning "no new metadata".
pub fn empty_metadata_page() -> Page {
    Page::from_static(&EMPTY_METADATA)
}

/// Builds a metadata block for `stream_title` and `stream_url`.
///
/// A block carries at most 4080 bytes. Longer values are truncated on a
/// character boundary, the title first, so the framing is always complete.
pub fn metadata_page(stream_title: &str, stream_url: &str) -> Page {
    let available = MAX_METADATA_LEN - FRAMING_LEN;
    let url = truncate_at_char_boundary(stream_url, available);
    let title = truncate_at_char_boundary(stream_title, available - url.len());
    let text = format!("{TITLE_PREFIX}{title}{URL_PREFIX}{url}{SUFFIX}");

    let padded_length = text.len().div_ceil(16) * 16;
    let length_byte = (padded_length / 16) as u8;

    let mut block = Vec::with_capacity(1 + padded_length);
    block.push(length_byte);
    block.extend_from_slice(text.as_bytes());
    block.resize(1 + padded_length, 0);

    Page::from(block)
}

/// `Artist - Title`, or whichever part is known.
pub fn stream_title(artist: Option<&str>, title: Option<&str>) -> String {
    let parts: Vec<&str> = [artist, title]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    parts.join(" - ")
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Response flavour negotiated from the request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Plain HTTP stream
    Plain,
    /// SHOUTcast response announcing `icy-metaint`
    Icy { metaint: usize },
    /// DLNA renderers asking for `transferMode.dlna.org: Streaming`
    Dlna,
}

impl ResponseKind {
    /// Status line and header block, terminated by the empty line.
    pub fn preamble(self, settings: &StreamSettings) -> Page {
        let header = match self {
            ResponseKind::Plain => format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: {}\r\n\
                 Connection: close\r\n\
                 Pragma: no-cache\r\n\
                 Cache-Control: no-cache, no-store\r\n\
                 \r\n",
                settings.content_type
            ),
            ResponseKind::Icy { metaint } => format!(
                "ICY 200 OK\r\n\
                 icy-notice1: <BR>This stream requires an audio player!<BR>\r\n\
                 icy-notice2: PMOHttpd - live audio streaming<BR>\r\n\
                 icy-name: {}\r\n\
                 icy-genre: {}\r\n\
                 icy-url: {}\r\n\
                 icy-pub:1\r\n\
                 icy-metaint:{}\r\n\
                 Content-Type: {}\r\n\
                 Connection: close\r\n\
                 Pragma: no-cache\r\n\
                 Cache-Control: no-cache, no-store\r\n\
                 \r\n",
                settings.name, settings.genre, settings.website, metaint, settings.content_type
            ),
            ResponseKind::Dlna => format!(
                "HTTP/1.1 206 OK\r\n\
                 Content-Type: {}\r\n\
                 Content-Length: 10000\r\n\
                 Content-RangeX: 0-1000000/1000000\r\n\
                 transferMode.dlna.org: Streaming\r\n\
                 Accept-Ranges: bytes\r\n\
                 Connection: close\r\n\
                 realTimeInfo.dlna.org: DLNA.ORG_TLAG=*\r\n\
                 contentFeatures.dlna.org: DLNA.ORG_OP=01;DLNA.ORG_CI=0\r\n\
                 \r\n",
                settings.content_type
            ),
        };
        Page::from(header)
    }
}
