//! Payload compressors.
//!
//! Compressors see whole frame payloads only; partial streams never reach
//! them. Every call is independent: there is no dictionary or window carried
//! from one frame to the next.

use crate::config::{ChannelConfig, CompressorKind};
use crate::error::{ChannelError, Result};
use std::io::Read;
use std::sync::Arc;

/// A stateless transform applied to frame payloads.
pub trait Compressor: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Reverse `compress`. Malformed input is a `ChannelError::Codec`.
    fn uncompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// zstd with a bounded decompression size.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
    max_output: usize,
}

impl ZstdCompressor {
    pub fn new(level: i32, max_output: usize) -> Self {
        Self { level, max_output }
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(input, self.level)
            .map_err(|e| ChannelError::Codec(format!("zstd compress failed: {e}")))
    }

    fn uncompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let decoder = zstd::stream::read::Decoder::new(input)
            .map_err(|e| ChannelError::Codec(format!("create zstd decoder: {e}")))?;

        // Read one byte past the limit so oversized output is detectable.
        let mut out = Vec::new();
        decoder
            .take(self.max_output as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| ChannelError::Codec(format!("read zstd stream: {e}")))?;

        if out.len() > self.max_output {
            return Err(ChannelError::Codec(format!(
                "decompressed payload exceeds {} bytes",
                self.max_output
            )));
        }
        Ok(out)
    }
}

/// Build the compressor selected by `config`, if any.
pub fn from_config(config: &ChannelConfig) -> Option<Arc<dyn Compressor>> {
    match config.compressor {
        CompressorKind::None => None,
        CompressorKind::Zstd => Some(Arc::new(ZstdCompressor::new(
            config.compression_level,
            config.max_frame_size,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_truncated_input_is_codec_error() {
        let zstd = ZstdCompressor::new(3, 1 << 20);
        let compressed = zstd.compress(&vec![7u8; 10_000]).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(matches!(zstd.uncompress(truncated), Err(ChannelError::Codec(_))));
        assert!(matches!(zstd.uncompress(b"not zstd at all"), Err(ChannelError::Codec(_))));
    }

    #[test]
    fn test_output_limit() {
        let compressed = ZstdCompressor::new(3, 1 << 20)
            .compress(&vec![0u8; 1000])
            .unwrap();
        let strict = ZstdCompressor::new(3, 999);
        assert!(matches!(strict.uncompress(&compressed), Err(ChannelError::Codec(_))));
        let exact = ZstdCompressor::new(3, 1000);
        assert_eq!(exact.uncompress(&compressed).unwrap().len(), 1000);
    }

    #[test]
    fn test_deterministic_output() {
        let zstd = ZstdCompressor::new(5, 1 << 20);
        let input = b"the same bytes in, the same bytes out".repeat(20);
        assert_eq!(zstd.compress(&input).unwrap(), zstd.compress(&input).unwrap());
    }

    #[test]
    fn test_from_config() {
        let mut config = ChannelConfig::default();
        assert!(from_config(&config).is_none());
        config.compressor = CompressorKind::Zstd;
        assert_eq!(from_config(&config).map(|c| c.name()), Some("zstd"));
    }

    proptest! {
        #[test]
        fn prop_uncompress_inverts_compress(
            input in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let zstd = ZstdCompressor::new(3, 1 << 16);
            let out = zstd.uncompress(&zstd.compress(&input).unwrap()).unwrap();
            prop_assert_eq!(out, input);
        }
    }
}
