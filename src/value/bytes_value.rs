use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use bytes::Bytes;

/// Opaque binary field value. Orders byte-wise, as the server does.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BytesValue(Bytes);

impl BytesValue {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Tagged so a blob never shares a canonical id with a string.
    pub fn canonical_id(&self) -> String {
        format!("bytes({})", STANDARD_NO_PAD.encode(&self.0))
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&'static [u8]> for BytesValue {
    fn from(value: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(value))
    }
}
