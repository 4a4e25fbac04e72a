//! Gzip handling for binary socket frames.
//!
//! When compression is negotiated, the server gzips event payloads over
//! 1 KiB and sends them as binary frames; smaller payloads stay as text.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ClientError;

/// Payloads at or below this size are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ClientError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| ClientError::Protocol(format!("gzip compression failed: {e}")))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ClientError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ClientError::Protocol(format!("gzip decompression failed: {e}")))?;
    Ok(out)
}

/// Decode a binary frame into its UTF-8 text, inflating when gzipped.
pub fn decode_binary(data: &[u8]) -> Result<String, ClientError> {
    let bytes = if is_gzip(data) {
        decompress(data)?
    } else {
        data.to_vec()
    };
    String::from_utf8(bytes)
        .map_err(|e| ClientError::Protocol(format!("binary frame is not valid UTF-8: {e}")))
}
