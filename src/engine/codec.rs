//! Pluggable byte codecs behind the compression engine.

use std::io::{Read, Write};

use flate2::{
    Compression,
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};

use super::compression::Algorithm;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0:?} is not supported by this backend")]
    Unsupported(Algorithm),
    #[error("codec i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A native compressor/decompressor.
///
/// `Algorithm::None` never reaches a backend; the engine handles it.
pub trait CompressionBackend: Send {
    fn supports(&self, algorithm: Algorithm) -> bool;
    fn compress(&self, algorithm: Algorithm, level: u32, input: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, algorithm: Algorithm, input: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// gzip and zlib-wrapped deflate via `flate2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlateBackend;

impl CompressionBackend for FlateBackend {
    fn supports(&self, algorithm: Algorithm) -> bool {
        matches!(algorithm, Algorithm::Gzip | Algorithm::Deflate)
    }

    fn compress(&self, algorithm: Algorithm, level: u32, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let level = Compression::new(level.clamp(1, 9));
        match algorithm {
            Algorithm::Gzip => {
                let mut enc = GzEncoder::new(Vec::with_capacity(input.len() / 2), level);
                enc.write_all(input)?;
                Ok(enc.finish()?)
            }
            Algorithm::Deflate => {
                let mut enc = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), level);
                enc.write_all(input)?;
                Ok(enc.finish()?)
            }
            Algorithm::None => Err(CodecError::Unsupported(algorithm)),
        }
    }

    fn decompress(&self, algorithm: Algorithm, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(input.len() * 2);
        match algorithm {
            Algorithm::Gzip => {
                GzDecoder::new(input).read_to_end(&mut out)?;
            }
            Algorithm::Deflate => {
                ZlibDecoder::new(input).read_to_end(&mut out)?;
            }
            Algorithm::None => return Err(CodecError::Unsupported(algorithm)),
        }
        Ok(out)
    }
}

/// Backend for platforms without a native codec: supports nothing, which
/// forces the engine onto its pass-through path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneBackend;

impl CompressionBackend for NoneBackend {
    fn supports(&self, _algorithm: Algorithm) -> bool {
        false
    }

    fn compress(&self, algorithm: Algorithm, _level: u32, _input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unsupported(algorithm))
    }

    fn decompress(&self, algorithm: Algorithm, _input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unsupported(algorithm))
    }
}
