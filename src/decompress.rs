// Content-Encoding decoding for captured bodies
//
// Decoding is best-effort: a corrupt stream is logged and the original
// (still compressed) bytes are returned. The client already received the raw
// bytes, so nothing on the capture side may fail because of a bad body.

use anyhow::{Context, Result};
use brotli::Decompressor;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;

/// Buffer size handed to the brotli decoder
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Supported content codings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl Encoding {
    /// Parse a single Content-Encoding token (case-insensitive)
    /// Returns None for codings we don't understand
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" | "brotli" => Some(Self::Brotli),
            "identity" | "" => Some(Self::Identity),
            _ => None,
        }
    }
}

/// Decode `bytes` according to a Content-Encoding header value
///
/// Stacked codings (`gzip, br`) are undone in reverse order. An unknown
/// coding anywhere in the list, or a decode failure, returns the input
/// unchanged.
pub fn decompress(bytes: &[u8], content_encoding: Option<&str>) -> Vec<u8> {
    let Some(header) = content_encoding else {
        return bytes.to_vec();
    };

    let mut encodings = Vec::new();
    for token in header.split(',') {
        match Encoding::from_token(token) {
            Some(Encoding::Identity) => {}
            Some(encoding) => encodings.push(encoding),
            None => {
                tracing::debug!(encoding = %header, "unknown content-encoding, passing through");
                return bytes.to_vec();
            }
        }
    }

    let mut current = bytes.to_vec();
    for encoding in encodings.iter().rev() {
        match decode(&current, *encoding) {
            Ok(decoded) => current = decoded,
            Err(e) => {
                tracing::warn!(
                    encoding = %header,
                    error = %e,
                    "decompression failed, keeping raw bytes"
                );
                return bytes.to_vec();
            }
        }
    }
    current
}

fn decode(bytes: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        Encoding::Identity => out.extend_from_slice(bytes),
        Encoding::Gzip => {
            GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .context("invalid gzip stream")?;
        }
        Encoding::Deflate => {
            // HTTP "deflate" is zlib-wrapped, but some servers send raw deflate
            if ZlibDecoder::new(bytes).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .context("invalid deflate stream")?;
            }
        }
        Encoding::Brotli => {
            Decompressor::new(bytes, BROTLI_BUFFER_SIZE)
                .read_to_end(&mut out)
                .context("invalid brotli stream")?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    const SAMPLE: &[u8] = br#"{"model":"claude-x","content":[{"type":"text","text":"hello hello hello"}]}"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn raw_deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 11, 22);
            writer.write_all(data).unwrap();
        }
        compressed
    }

    #[test]
    fn test_supported_encodings_decode() {
        assert_eq!(decompress(&gzip(SAMPLE), Some("gzip")), SAMPLE);
        assert_eq!(decompress(&zlib(SAMPLE), Some("deflate")), SAMPLE);
        assert_eq!(decompress(&raw_deflate(SAMPLE), Some("deflate")), SAMPLE);
        assert_eq!(decompress(&brotli(SAMPLE), Some("br")), SAMPLE);
        assert_eq!(decompress(&brotli(SAMPLE), Some("brotli")), SAMPLE);
    }

    #[test]
    fn test_encoding_tokens_are_case_insensitive() {
        assert_eq!(decompress(&gzip(SAMPLE), Some("GZIP")), SAMPLE);
        assert_eq!(decompress(&brotli(SAMPLE), Some(" Br ")), SAMPLE);
    }

    #[test]
    fn test_absent_identity_and_unknown_pass_through() {
        assert_eq!(decompress(SAMPLE, None), SAMPLE);
        assert_eq!(decompress(SAMPLE, Some("identity")), SAMPLE);
        assert_eq!(decompress(SAMPLE, Some("zstd")), SAMPLE);
    }

    #[test]
    fn test_corrupt_stream_returns_original_bytes() {
        // Valid gzip header followed by a deflate block with the reserved type
        let mut corrupt = gzip(SAMPLE)[..10].to_vec();
        corrupt.extend_from_slice(b"\xff\xff\xff\xff not deflate");
        assert_eq!(decompress(&corrupt, Some("gzip")), corrupt);
    }

    #[test]
    fn test_stacked_encodings_unwind_in_reverse() {
        let layered = brotli(&gzip(SAMPLE));
        assert_eq!(decompress(&layered, Some("gzip, br")), SAMPLE);
    }

    #[test]
    fn test_empty_body_stays_empty() {
        assert!(decompress(&[], Some("gzip")).is_empty());
    }
}
