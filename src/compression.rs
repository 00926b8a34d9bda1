// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Bodies smaller than this are stored uncompressed even when compression
/// is requested; the framing overhead would outweigh the savings.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Compression algorithm to use
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// LZ4 compression
    #[cfg(feature = "lz4")]
    Lz4,
}

impl CompressionType {
    /// Returns the preferred compression for document bodies.
    ///
    /// Falls back to [`CompressionType::None`] when the crate is built
    /// without a compressor.
    #[must_use]
    pub fn preferred() -> Self {
        #[cfg(feature = "lz4")]
        {
            Self::Lz4
        }

        #[cfg(not(feature = "lz4"))]
        {
            Self::None
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

/// Compresses a payload, returning `None` if the payload should be stored
/// verbatim (no compressor configured, or the payload is too small to be
/// worth it).
pub(crate) fn compress(bytes: &[u8], compression: CompressionType) -> Option<Vec<u8>> {
    if bytes.len() < MIN_COMPRESS_SIZE {
        return None;
    }

    match compression {
        CompressionType::None => None,

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => Some(lz4_flex::compress_prepend_size(bytes)),
    }
}

/// Decompresses a payload whose chunk header carried the compressed flag.
pub(crate) fn decompress(bytes: &[u8]) -> crate::Result<Vec<u8>> {
    #[cfg(feature = "lz4")]
    {
        lz4_flex::decompress_size_prepended(bytes).map_err(|_| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "lz4 decompression failed",
            ))
        })
    }

    #[cfg(not(feature = "lz4"))]
    {
        let _ = bytes;
        Err(crate::Error::InvalidArgument(
            "compressed chunk requires the lz4 feature",
        ))
    }
}
