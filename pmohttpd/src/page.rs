//! Pages : tampons d'octets immuables partagés entre tous les clients.

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// An immutable, reference-counted chunk of outbound bytes.
///
/// The same encoded audio page is queued on every listener; cloning a
/// `Page` only bumps a reference count. Once built, a page is never
/// mutated.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Page(Bytes);

impl Page {
    pub const fn from_static(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Page {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

impl From<Vec<u8>> for Page {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<String> for Page {
    fn from(data: String) -> Self {
        Self(Bytes::from(data))
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("len", &self.len()).finish()
    }
}
