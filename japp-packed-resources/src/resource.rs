// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resource records.

A record describes one stored blob:

```text
u8   magic (0x1b)
u8   compression method
u16  reserved, 0
u32  uncompressed size
u32  compressed size
u64  offset of the stored bytes, relative to the content start
u16  path length
     UTF-8 path
     fields: (u8 id, payload)*, terminated by END
```
*/

use {
    crate::{
        serialization::{ByteReader, ResourceField, RESOURCE_MAGIC},
        Error, PackedResult,
    },
    anyhow::{anyhow, Context, Result},
    byteorder::{LittleEndian, WriteBytesExt},
    chrono::{DateTime, TimeZone, Utc},
    japp_compression::CompressionMethod,
    std::{
        convert::TryFrom,
        io::Write,
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// Represents a stored resource.
#[derive(Debug)]
pub struct Resource {
    /// Path of the resource within its group.
    pub name: String,

    pub method: CompressionMethod,

    /// Size of the resource content.
    pub size: u32,

    /// Size of the stored bytes.
    pub compressed_size: u32,

    /// Offset of the stored bytes relative to the content start.
    pub offset: u64,

    /// XxHash64 of the resource content.
    pub checksum: Option<u64>,

    /// Milliseconds since the UNIX epoch.
    pub creation_time: Option<i64>,
    pub last_modified_time: Option<i64>,
    pub last_access_time: Option<i64>,

    verified: AtomicBool,
}

impl Clone for Resource {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            method: self.method,
            size: self.size,
            compressed_size: self.compressed_size,
            offset: self.offset,
            checksum: self.checksum,
            creation_time: self.creation_time,
            last_modified_time: self.last_modified_time,
            last_access_time: self.last_access_time,
            verified: AtomicBool::new(self.is_verified()),
        }
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.method == other.method
            && self.size == other.size
            && self.compressed_size == other.compressed_size
            && self.offset == other.offset
            && self.checksum == other.checksum
            && self.creation_time == other.creation_time
            && self.last_modified_time == other.last_modified_time
            && self.last_access_time == other.last_access_time
    }
}

impl Eq for Resource {}

fn to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        method: CompressionMethod,
        size: u32,
        compressed_size: u32,
        offset: u64,
    ) -> Self {
        Self {
            name: name.into(),
            method,
            size,
            compressed_size,
            offset,
            checksum: None,
            creation_time: None,
            last_modified_time: None,
            last_access_time: None,
            verified: AtomicBool::new(false),
        }
    }

    /// Whether the content was already checked against [Self::checksum].
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    /// Modification time, falling back to the creation time.
    pub fn effective_last_modified_time(&self) -> Option<i64> {
        self.last_modified_time.or(self.creation_time)
    }

    /// Access time, falling back to the effective modification time.
    pub fn effective_last_access_time(&self) -> Option<i64> {
        self.last_access_time
            .or_else(|| self.effective_last_modified_time())
    }

    pub fn creation_datetime(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.creation_time)
    }

    pub fn last_modified_datetime(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.effective_last_modified_time())
    }

    pub fn last_access_datetime(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.effective_last_access_time())
    }

    /// Parse a record from `reader`.
    pub fn read_from(reader: &mut ByteReader) -> PackedResult<Self> {
        let start = reader.position() as u64;

        let magic = reader.read_u8("resource magic")?;
        if magic != RESOURCE_MAGIC {
            return Err(Error::malformed(
                start,
                format!("bad resource magic 0x{:02x}", magic),
            ));
        }

        let method = CompressionMethod::try_from(reader.read_u8("resource method")?)?;

        if reader.read_u16("resource flags")? != 0 {
            return Err(Error::malformed(
                start + 2,
                "reserved resource flags are not 0",
            ));
        }

        let size = reader.read_u32("resource size")?;
        let compressed_size = reader.read_u32("resource compressed size")?;
        let offset = reader.read_u64("resource offset")?;
        let name = reader.read_short_string("resource path")?;

        if method == CompressionMethod::None && size != compressed_size {
            return Err(Error::malformed(
                start,
                format!(
                    "stored resource {} has size {} but compressed size {}",
                    name, size, compressed_size
                ),
            ));
        }

        let mut resource = Self::new(name, method, size, compressed_size, offset);

        loop {
            let field_offset = reader.position() as u64;
            let field = ResourceField::try_from(reader.read_u8("resource field")?)?;

            let slot = match field {
                ResourceField::End => break,
                ResourceField::Checksum => {
                    if resource.checksum.is_some() {
                        return Err(Error::malformed(field_offset, "duplicate checksum field"));
                    }
                    resource.checksum = Some(reader.read_u64("resource checksum")?);
                    continue;
                }
                ResourceField::FileCreateTime => &mut resource.creation_time,
                ResourceField::FileLastModifiedTime => &mut resource.last_modified_time,
                ResourceField::FileLastAccessTime => &mut resource.last_access_time,
            };

            if slot.is_some() {
                return Err(Error::malformed(
                    field_offset,
                    format!("duplicate resource field {:?}", field),
                ));
            }
            *slot = Some(reader.read_i64("resource time")?);
        }

        Ok(resource)
    }

    /// Serialize this record.
    pub fn write_to<W: Write>(&self, dest: &mut W) -> Result<()> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| anyhow!("resource path too long: {}", self.name))?;

        dest.write_u8(RESOURCE_MAGIC)
            .context("writing resource magic")?;
        dest.write_u8(self.method.into())
            .context("writing resource method")?;
        dest.write_u16::<LittleEndian>(0)
            .context("writing resource flags")?;
        dest.write_u32::<LittleEndian>(self.size)
            .context("writing resource size")?;
        dest.write_u32::<LittleEndian>(self.compressed_size)
            .context("writing resource compressed size")?;
        dest.write_u64::<LittleEndian>(self.offset)
            .context("writing resource offset")?;
        dest.write_u16::<LittleEndian>(name_len)
            .context("writing resource path length")?;
        dest.write_all(self.name.as_bytes())
            .context("writing resource path")?;

        if let Some(checksum) = self.checksum {
            dest.write_u8(ResourceField::Checksum.into())
                .context("writing checksum field")?;
            dest.write_u64::<LittleEndian>(checksum)
                .context("writing checksum")?;
        }

        for (field, value) in [
            (ResourceField::FileCreateTime, self.creation_time),
            (ResourceField::FileLastModifiedTime, self.last_modified_time),
            (ResourceField::FileLastAccessTime, self.last_access_time),
        ] {
            if let Some(value) = value {
                dest.write_u8(field.into())
                    .context("writing time field")?;
                dest.write_i64::<LittleEndian>(value)
                    .context("writing time")?;
            }
        }

        dest.write_u8(ResourceField::End.into())
            .context("writing end of resource")?;

        Ok(())
    }
}
