use std::fmt::{Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

/// Opaque cursor the server hands out so a target can resume where it left off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static [u8]> for ResumeToken {
    fn from(value: &'static [u8]) -> Self {
        Self(Bytes::from_static(value))
    }
}

impl From<Vec<u8>> for ResumeToken {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl Display for ResumeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&STANDARD.encode(&self.0))
    }
}
