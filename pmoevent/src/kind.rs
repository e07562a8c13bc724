use std::fmt;

/// Catégories d'événements que le thread de dispatch sait traiter.
///
/// L'ensemble est fermé : l'ordre des variantes est l'ordre dans lequel
/// les handlers sont invoqués lors d'un même `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum EventKind {
    /// An idle notification was raised by another subsystem
    Idle,
    /// The playlist or the current song changed
    Playlist,
    /// The tag of the song being streamed changed
    Tag,
    /// Encoded audio pages are waiting to be broadcast
    AudioReady,
    /// A streaming client connected or went away
    ClientList,
    /// A background database update finished
    Update,
    /// Configuration reload requested
    Reload,
    /// A worker asks the daemon to stop
    Shutdown,
    /// Reserved: termination requested from signal context. Never
    /// dispatched to a handler, reported to the caller of `consume`.
    Signal,
}

impl EventKind {
    pub const COUNT: usize = 9;

    /// All kinds, in dispatch order.
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Idle,
        EventKind::Playlist,
        EventKind::Tag,
        EventKind::AudioReady,
        EventKind::ClientList,
        EventKind::Update,
        EventKind::Reload,
        EventKind::Shutdown,
        EventKind::Signal,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Idle => "idle",
            EventKind::Playlist => "playlist",
            EventKind::Tag => "tag",
            EventKind::AudioReady => "audio-ready",
            EventKind::ClientList => "client-list",
            EventKind::Update => "update",
            EventKind::Reload => "reload",
            EventKind::Shutdown => "shutdown",
            EventKind::Signal => "signal",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
