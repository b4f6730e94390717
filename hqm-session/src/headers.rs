//! Session-scoped adapter over the external header-compression codec.

use crate::error::Result;
use bytes::Bytes;
use hqm_x::{Header, HeaderCodec};

/// Owns the compression context shared by encode and decode for the session
/// lifetime. Dropping the session releases it.
pub struct HeaderContext {
    codec: Box<dyn HeaderCodec>,
}

impl HeaderContext {
    pub fn new(codec: Box<dyn HeaderCodec>) -> Self {
        Self { codec }
    }

    pub fn encode(&mut self, headers: &[Header]) -> Result<Bytes> {
        Ok(self.codec.encode(headers)?)
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>> {
        Ok(self.codec.decode(block)?)
    }
}

impl std::fmt::Debug for HeaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderContext").finish_non_exhaustive()
    }
}

/// Whether a header block announces trailers via a `trailer` field, which
/// licenses a later header block after body data.
pub fn promises_trailers(headers: &[Header]) -> bool {
    headers.iter().any(|h| h.name_is("trailer"))
}
