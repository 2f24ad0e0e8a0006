// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Codecs backing JApp packed application containers.

Resources inside a container are stored with one of the methods in
[CompressionMethod]:

* `None` stores bytes verbatim.
* `Fse` is an order-0 finite state entropy block (see [entropy]).
* `Lz4` is an LZ77 token stream compatible with LZ4 blocks (see [lz4]).
* `Classfile` rewrites a JVM class file so its constant pool strings are
  shared through a [pool::ByteArrayPool] and compresses what remains
  (see [classfile]).

Everything in this crate operates on byte slices and is free of I/O.
*/

pub mod bitstream;
pub mod classfile;
pub mod entropy;
pub mod fse;
pub mod lz4;
mod lz4_hc;
pub mod method;
pub mod pool;
pub mod varint;
pub mod xxhash;

pub use {
    method::{compress, decompress, CompressContext, CompressionMethod},
    pool::{ByteArrayPool, ByteArrayPoolBuilder},
    xxhash::xxhash64,
};

/// Broad classification of an [Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input violates the binary format.
    MalformedData,
    /// Input is well formed but uses something this implementation does not know.
    UnsupportedFormat,
    /// A declared size is larger than we are willing to allocate.
    CapacityExceeded,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed data at offset {offset}: {message}")]
    MalformedData { offset: usize, message: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("{what} of {size} bytes exceeds limit of {limit} bytes")]
    CapacityExceeded {
        what: &'static str,
        size: u64,
        limit: u64,
    },
}

impl Error {
    pub fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::MalformedData {
            offset,
            message: message.into(),
        }
    }

    /// Shift the offset of a [Error::MalformedData] by `base`.
    ///
    /// Used when a nested structure was parsed from a sub-slice.
    pub fn offset_by(self, base: usize) -> Self {
        match self {
            Self::MalformedData { offset, message } => Self::MalformedData {
                offset: base + offset,
                message,
            },
            e => e,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedData { .. } => ErrorKind::MalformedData,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        }
    }
}

/// Result type for this crate.
pub type CompressionResult<T> = Result<T, Error>;
