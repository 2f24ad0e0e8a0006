// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Reading and writing of JApp packed application containers.

A container is a single file laid out as:

```text
[stub]              optional leading bytes, e.g. a launcher shim
"JAPP"              content start
resource data       compressed blobs addressed by resource offsets
boot metadata       byte array pool plus resource group blocks
launch config       serialized configuration group tree
trailer             64 bytes: magic, version, flags, sizes, region offsets
```

[writer::JAppWriter] produces containers and [reader::JAppReader] opens
them. Resources are compressed with the codecs from `japp_compression`,
chosen per file by [compressor::DefaultCompressor].
*/

pub mod compressor;
pub mod config;
pub mod group;
pub mod reader;
pub mod resource;
pub mod serialization;
pub mod writer;

pub use {
    compressor::{Compressor, DefaultCompressor, ForcedCompressor},
    config::{
        ConditionEvaluator, ConfigGroup, ExternalCoordinates, ExternalReferenceResolver,
        Reference, ResolvedLaunch, ResolvedPath, RuntimeContext,
    },
    group::{BootMetadata, GroupSet, ResourceGroup},
    japp_compression::CompressionMethod,
    reader::{AccessMode, JAppReader, ReaderOptions, Trailer},
    resource::Resource,
    writer::{JAppWriter, ResourceTimes, WriterOptions},
};

/// Broad classification of an [Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    MalformedData,
    UnsupportedFormat,
    CapacityExceeded,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data at offset {offset}: {message}")]
    MalformedData { offset: u64, message: String },

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
    pub fn malformed(offset: u64, message: impl Into<String>) -> Self {
        Self::MalformedData {
            offset,
            message: message.into(),
        }
    }

    /// Rebase the offset of a [Error::MalformedData] onto `base`.
    pub fn offset_by(self, base: u64) -> Self {
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
            Self::Io(_) => ErrorKind::Io,
            Self::MalformedData { .. } => ErrorKind::MalformedData,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        }
    }
}

impl From<japp_compression::Error> for Error {
    fn from(e: japp_compression::Error) -> Self {
        match e {
            japp_compression::Error::MalformedData { offset, message } => Self::MalformedData {
                offset: offset as u64,
                message,
            },
            japp_compression::Error::UnsupportedFormat(message) => {
                Self::UnsupportedFormat(message)
            }
            japp_compression::Error::CapacityExceeded { what, size, limit } => {
                Self::CapacityExceeded { what, size, limit }
            }
        }
    }
}

/// Result type for this crate.
pub type PackedResult<T> = std::result::Result<T, Error>;
