//! Payload codecs.
//!
//! The archive does not record which codec wrote it. Every entry payload
//! and the directory blob go through the same codec, chosen when the
//! archive is opened. Zlib is the default and matches archives produced by
//! the original packer.
//!
//! Decompression is always bounded by the caller's expected length, and a
//! result of any other length is an error. The expected length comes from
//! the archive and is not trusted for up-front allocation: buffers grow
//! with the decoded output instead.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Default level: zlib's own default, and a fast-but-decent zstd level.
pub const DEFAULT_LEVEL: i32 = 6;

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecId {
    None,
    #[default]
    Zlib,
    Zstd,
    Lz4,
}

impl CodecId {
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zlib => "zlib",
            CodecId::Zstd => "zstd",
            CodecId::Lz4  => "lz4",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CodecId::None),
            "zlib" => Some(CodecId::Zlib),
            "zstd" => Some(CodecId::Zstd),
            "lz4"  => Some(CodecId::Lz4),
            _      => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown codec '{s}' (expected zlib, zstd, lz4 or none)"))
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Decompressed {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Checks a decoded buffer against the length recorded for it.
pub fn expect_len(out: Vec<u8>, expected: usize) -> Result<Vec<u8>, CodecError> {
    if out.len() != expected {
        return Err(CodecError::LengthMismatch { expected, actual: out.len() });
    }
    Ok(out)
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn name(&self) -> &'static str { "none" }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        expect_len(data.to_vec(), expected_len)
    }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn name(&self) -> &'static str { "zlib" }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let level = flate2::Compression::new(level.clamp(0, 9) as u32);
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
        encoder.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        // One byte of headroom so an oversized stream shows up as a mismatch.
        let mut out = Vec::with_capacity(expected_len.min(data.len().saturating_mul(32)));
        flate2::read::ZlibDecoder::new(data)
            .take(expected_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        expect_len(out, expected_len)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn name(&self) -> &'static str { "zstd" }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        let mut out = Vec::new();
        decoder
            .take(expected_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        expect_len(out, expected_len)
    }
}

/// Upper bound on LZ4 block expansion: one length byte extends a match by 255.
const LZ4_MAX_RATIO: usize = 255;

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn name(&self) -> &'static str { "lz4" }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress(data))
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        // lz4_flex sizes its output buffer from `expected_len` before decoding.
        if expected_len > data.len().saturating_mul(LZ4_MAX_RATIO).saturating_add(64) {
            return Err(CodecError::Decompression(format!(
                "{} bytes cannot expand to {expected_len}",
                data.len()
            )));
        }
        let out = lz4_flex::decompress(data, expected_len)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        expect_len(out, expected_len)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Zlib => Box::new(ZlibCodec),
        CodecId::Zstd => Box::new(ZstdCodec),
        CodecId::Lz4  => Box::new(Lz4Codec),
    }
}
