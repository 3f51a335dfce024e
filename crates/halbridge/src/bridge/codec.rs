//! Framed codec for bridge traffic.
//!
//! Each frame is a 4-byte length prefix followed by an LZ4 block (with its own
//! uncompressed-size prefix) holding the JSON encoding of one frame value.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are logged at info level.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

/// Largest compressed frame accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Largest JSON payload a frame may claim to decompress to.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

pub struct WireCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WireCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for WireCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(compressed) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let claimed = compressed
            .first_chunk::<4>()
            .map(|size| u32::from_le_bytes(*size) as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame shorter than size prefix"))?;
        if claimed > MAX_PAYLOAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame claims {claimed} bytes, limit is {MAX_PAYLOAD_BYTES}"),
            ));
        }
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let item =
            serde_json::from_slice(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for WireCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        tracing::trace!(
            json_size_bytes = json.len(),
            compressed_size_bytes = compressed.len(),
            "Encoding frame"
        );
        if json.len() > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_kb = json.len() / 1024,
                compressed_size_kb = compressed.len() / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(compressed), dst)
    }
}
