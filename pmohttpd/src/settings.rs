use pmoconfig::Config;

/// Server-side stream properties shared by every client of an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub genre: String,
    pub website: String,
    pub content_type: String,
    /// Whether ICY metadata can be offered at all. Disabled when the
    /// encoder carries its own tags in the stream.
    pub metadata_supported: bool,
    /// Audio bytes between two metadata blocks.
    pub metaint: usize,
    /// A client whose queue grows beyond this many bytes is flushed.
    pub client_queue_limit: usize,
    /// 0 means unlimited.
    pub max_clients: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "PMOHttpd".to_string(),
            genre: "Various".to_string(),
            website: String::new(),
            content_type: "audio/mpeg".to_string(),
            metadata_supported: true,
            metaint: 8192,
            client_queue_limit: 256 * 1024,
            max_clients: 0,
        }
    }
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let metaint = config.get_icy_metaint()?;
        Ok(Self {
            name: config.get_stream_name()?,
            genre: config.get_stream_genre()?,
            website: config.get_stream_website()?,
            content_type: config.get_content_type()?,
            // a zero interval cannot be framed
            metadata_supported: config.get_icy_metadata_enabled()? && metaint > 0,
            metaint,
            client_queue_limit: config.get_client_queue_limit()?,
            max_clients: config.get_max_clients()?,
        })
    }
}
