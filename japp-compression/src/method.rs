// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Compression method identifiers and dispatch. */

use {
    crate::{
        classfile, entropy, lz4,
        pool::{ByteArrayPool, ByteArrayPoolBuilder},
        CompressionResult, Error,
    },
    log::trace,
    std::convert::TryFrom,
};

/// How a stored byte sequence is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    /// Bytes are stored verbatim.
    None,
    /// JVM class file transform backed by the byte array pool.
    Classfile,
    /// Entropy block.
    Fse,
    /// LZ4 style block.
    Lz4,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Classfile => "classfile",
            Self::Fse => "fse",
            Self::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CompressionMethod> for u8 {
    fn from(method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => 0,
            CompressionMethod::Classfile => 1,
            CompressionMethod::Fse => 2,
            CompressionMethod::Lz4 => 3,
        }
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Classfile),
            2 => Ok(Self::Fse),
            3 => Ok(Self::Lz4),
            _ => Err(Error::UnsupportedFormat(format!(
                "unknown compression method {}",
                value
            ))),
        }
    }
}

/// State shared by all compression calls of one packing session.
pub struct CompressContext<'a> {
    /// Receives class file strings.
    pub pool: &'a mut ByteArrayPoolBuilder,
    /// Use the hash chain LZ4 match finder instead of the fast one.
    pub lz4_high_compression: bool,
}

/// Compress `data` with `method`.
///
/// Returns `Ok(None)` if the method cannot make `data` smaller. `None`
/// always succeeds with a copy of the input. Pool entries added for a class
/// file are removed again unless its transformed form is returned.
pub fn compress(
    method: CompressionMethod,
    data: &[u8],
    context: &mut CompressContext,
) -> CompressionResult<Option<Vec<u8>>> {
    let mark = context.pool.len();

    let compressed = match method {
        CompressionMethod::None => return Ok(Some(data.to_vec())),
        CompressionMethod::Classfile => match classfile::compress(data, context.pool) {
            Ok(compressed) => compressed,
            Err(e) => {
                context.pool.truncate(mark);
                return Err(e);
            }
        },
        CompressionMethod::Fse => entropy::compress(data)?,
        CompressionMethod::Lz4 => {
            if context.lz4_high_compression {
                lz4::compress_high(data)
            } else {
                lz4::compress_fast(data)
            }
        }
    };

    trace!(
        "{} compressed {} bytes to {} bytes",
        method,
        data.len(),
        compressed.len()
    );

    Ok(if compressed.len() < data.len() {
        Some(compressed)
    } else {
        context.pool.truncate(mark);
        None
    })
}

/// Decompress `data` stored with `method` into exactly `size` bytes.
///
/// `pool` is only consulted by [CompressionMethod::Classfile].
pub fn decompress(
    method: CompressionMethod,
    data: &[u8],
    size: usize,
    pool: &ByteArrayPool,
) -> CompressionResult<Vec<u8>> {
    match method {
        CompressionMethod::None => {
            if data.len() != size {
                return Err(Error::malformed(
                    0,
                    format!(
                        "uncompressed data holds {} bytes; expected {}",
                        data.len(),
                        size
                    ),
                ));
            }

            Ok(data.to_vec())
        }
        CompressionMethod::Classfile => classfile::decompress(data, pool, size),
        CompressionMethod::Fse => entropy::decompress(data, size),
        CompressionMethod::Lz4 => lz4::decompress(data, size),
    }
}
