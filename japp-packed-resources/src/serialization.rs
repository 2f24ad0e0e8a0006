// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Declares the foundational data primitives inside JApp containers.

All integers are little endian. Strings are a `u32` byte length followed by
UTF-8. Nullable strings use [NULL_STRING_LENGTH] as the length of an absent
value.
*/

use {
    crate::{Error, PackedResult},
    anyhow::{anyhow, Context, Result},
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::{convert::TryFrom, io::Cursor, io::Write},
};

/// Leading magic of the container content and of the trailer.
pub const FILE_MAGIC: u32 = 0x5050414a;

pub const MAJOR_VERSION: i16 = -1;
pub const MINOR_VERSION: u16 = 0;

/// Size of the fixed trailer at the end of a container.
pub const TRAILER_SIZE: usize = 64;

/// `"BOOT"`: start of the boot metadata region.
pub const BOOT_MAGIC: u32 = 0x544f4f42;

/// `"CONF"`: start of every configuration group node.
pub const CONFIG_MAGIC: u32 = 0x464e4f43;

pub const RESOURCE_MAGIC: u8 = 0x1b;
pub const GROUP_MAGIC: u8 = 0xeb;
pub const REFERENCE_MAGIC: u8 = 0x01;

/// Size of a resource group block header.
pub const GROUP_HEADER_SIZE: usize = 24;

pub const NULL_STRING_LENGTH: u32 = u32::MAX;

/// Lowest release tier a multi-release override may target.
pub const MIN_RELEASE_TIER: i32 = 9;

/// Describes a field in a resource record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceField {
    End,
    Checksum,
    FileCreateTime,
    FileLastModifiedTime,
    FileLastAccessTime,
}

impl From<ResourceField> for u8 {
    fn from(field: ResourceField) -> Self {
        match field {
            ResourceField::End => 0x00,
            ResourceField::Checksum => 0x01,
            ResourceField::FileCreateTime => 0x02,
            ResourceField::FileLastModifiedTime => 0x03,
            ResourceField::FileLastAccessTime => 0x04,
        }
    }
}

impl TryFrom<u8> for ResourceField {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ResourceField::End),
            0x01 => Ok(ResourceField::Checksum),
            0x02 => Ok(ResourceField::FileCreateTime),
            0x03 => Ok(ResourceField::FileLastModifiedTime),
            0x04 => Ok(ResourceField::FileLastAccessTime),
            _ => Err(Error::UnsupportedFormat(format!(
                "unknown resource field 0x{:02x}",
                value
            ))),
        }
    }
}

/// Describes a field in a configuration group node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigField {
    End,
    Condition,
    MainClass,
    MainModule,
    ModulePath,
    ClassPath,
    JvmProperties,
    AddReads,
    AddExports,
    AddOpens,
    EnableNativeAccess,
    SubGroups,
}

impl From<ConfigField> for u8 {
    fn from(field: ConfigField) -> Self {
        match field {
            ConfigField::End => 0,
            ConfigField::Condition => 1,
            ConfigField::MainClass => 2,
            ConfigField::MainModule => 3,
            ConfigField::ModulePath => 4,
            ConfigField::ClassPath => 5,
            ConfigField::JvmProperties => 6,
            ConfigField::AddReads => 7,
            ConfigField::AddExports => 8,
            ConfigField::AddOpens => 9,
            ConfigField::EnableNativeAccess => 10,
            ConfigField::SubGroups => 11,
        }
    }
}

impl TryFrom<u8> for ConfigField {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConfigField::End),
            1 => Ok(ConfigField::Condition),
            2 => Ok(ConfigField::MainClass),
            3 => Ok(ConfigField::MainModule),
            4 => Ok(ConfigField::ModulePath),
            5 => Ok(ConfigField::ClassPath),
            6 => Ok(ConfigField::JvmProperties),
            7 => Ok(ConfigField::AddReads),
            8 => Ok(ConfigField::AddExports),
            9 => Ok(ConfigField::AddOpens),
            10 => Ok(ConfigField::EnableNativeAccess),
            11 => Ok(ConfigField::SubGroups),
            _ => Err(Error::UnsupportedFormat(format!(
                "unknown configuration field {}",
                value
            ))),
        }
    }
}

/// Kind of a module path or class path reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Local,
    External,
}

impl From<ReferenceKind> for u8 {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Local => 0,
            ReferenceKind::External => 1,
        }
    }
}

impl TryFrom<u8> for ReferenceKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReferenceKind::Local),
            1 => Ok(ReferenceKind::External),
            _ => Err(Error::UnsupportedFormat(format!(
                "unknown reference kind {}",
                value
            ))),
        }
    }
}

/// Bounds checked little endian reader over a metadata slice.
///
/// Failures are reported as [Error::MalformedData] at the offset being read.
pub struct ByteReader<'a> {
    reader: Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: Cursor::new(data),
        }
    }

    pub fn position(&self) -> usize {
        self.reader.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.reader.get_ref().len().saturating_sub(self.position())
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self, what: &str) -> Error {
        Error::malformed(self.position() as u64, format!("truncated {}", what))
    }

    fn read_with<T>(
        &mut self,
        what: &str,
        f: impl FnOnce(&mut Cursor<&'a [u8]>) -> std::io::Result<T>,
    ) -> PackedResult<T> {
        let offset = self.position() as u64;
        f(&mut self.reader).map_err(|_| Error::malformed(offset, format!("truncated {}", what)))
    }

    pub fn read_u8(&mut self, what: &str) -> PackedResult<u8> {
        self.read_with(what, |r| r.read_u8())
    }

    pub fn read_u16(&mut self, what: &str) -> PackedResult<u16> {
        self.read_with(what, |r| r.read_u16::<LittleEndian>())
    }

    pub fn read_i16(&mut self, what: &str) -> PackedResult<i16> {
        self.read_with(what, |r| r.read_i16::<LittleEndian>())
    }

    pub fn read_u32(&mut self, what: &str) -> PackedResult<u32> {
        self.read_with(what, |r| r.read_u32::<LittleEndian>())
    }

    pub fn read_i32(&mut self, what: &str) -> PackedResult<i32> {
        self.read_with(what, |r| r.read_i32::<LittleEndian>())
    }

    pub fn read_u64(&mut self, what: &str) -> PackedResult<u64> {
        self.read_with(what, |r| r.read_u64::<LittleEndian>())
    }

    pub fn read_i64(&mut self, what: &str) -> PackedResult<i64> {
        self.read_with(what, |r| r.read_i64::<LittleEndian>())
    }

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize, what: &str) -> PackedResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(self.truncated(what));
        }

        let start = self.position();
        let data: &'a [u8] = *self.reader.get_ref();
        self.reader.set_position((start + len) as u64);

        Ok(&data[start..start + len])
    }

    fn read_utf8(&mut self, len: usize, what: &str) -> PackedResult<String> {
        let start = self.position() as u64;
        let bytes = self.read_bytes(len, what)?;

        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::malformed(start, format!("{} is not valid UTF-8", what)))
    }

    /// Read a `u32` length prefixed string.
    pub fn read_string(&mut self, what: &str) -> PackedResult<String> {
        let offset = self.position() as u64;

        self.read_nullable_string(what)?
            .ok_or_else(|| Error::malformed(offset, format!("{} may not be null", what)))
    }

    pub fn read_nullable_string(&mut self, what: &str) -> PackedResult<Option<String>> {
        let len = self.read_u32(what)?;
        if len == NULL_STRING_LENGTH {
            return Ok(None);
        }

        self.read_utf8(len as usize, what).map(Some)
    }

    /// Read a `u16` length prefixed string.
    pub fn read_short_string(&mut self, what: &str) -> PackedResult<String> {
        let len = self.read_u16(what)?;
        self.read_utf8(len as usize, what)
    }

    /// Read a `u32` element count, rejecting counts that cannot fit in the
    /// remaining input given each element takes at least `min_size` bytes.
    pub fn read_count(&mut self, min_size: usize, what: &str) -> PackedResult<usize> {
        let offset = self.position() as u64;
        let count = self.read_u32(what)? as usize;

        if count > self.remaining() / min_size.max(1) {
            return Err(Error::malformed(
                offset,
                format!("{} count {} exceeds available data", what, count),
            ));
        }

        Ok(count)
    }

    /// Read a `u32` count followed by that many strings.
    pub fn read_string_list(&mut self, what: &str) -> PackedResult<Vec<String>> {
        let count = self.read_count(4, what)?;

        (0..count).map(|_| self.read_string(what)).collect()
    }
}

pub fn write_string<W: Write>(dest: &mut W, value: &str, what: &str) -> Result<()> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len != NULL_STRING_LENGTH)
        .ok_or_else(|| anyhow!("{} is too long", what))?;

    dest.write_u32::<LittleEndian>(len)
        .with_context(|| format!("writing {} length", what))?;
    dest.write_all(value.as_bytes())
        .with_context(|| format!("writing {}", what))?;

    Ok(())
}

pub fn write_nullable_string<W: Write>(dest: &mut W, value: Option<&str>, what: &str) -> Result<()> {
    match value {
        Some(value) => write_string(dest, value, what),
        None => dest
            .write_u32::<LittleEndian>(NULL_STRING_LENGTH)
            .with_context(|| format!("writing null {}", what)),
    }
}

pub fn write_string_list<W: Write>(dest: &mut W, values: &[String], what: &str) -> Result<()> {
    let count = u32::try_from(values.len()).context("too many strings")?;
    dest.write_u32::<LittleEndian>(count)
        .with_context(|| format!("writing {} count", what))?;

    for value in values {
        write_string(dest, value, what)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_spelling() {
        assert_eq!(&FILE_MAGIC.to_le_bytes(), b"JAPP");
        assert_eq!(&BOOT_MAGIC.to_le_bytes(), b"BOOT");
        assert_eq!(&CONFIG_MAGIC.to_le_bytes(), b"CONF");
    }

    #[test]
    fn test_field_ids() -> PackedResult<()> {
        for id in 0..=4u8 {
            assert_eq!(u8::from(ResourceField::try_from(id)?), id);
        }
        for id in 0..=11u8 {
            assert_eq!(u8::from(ConfigField::try_from(id)?), id);
        }

        assert_eq!(
            ResourceField::try_from(5).unwrap_err().kind(),
            crate::ErrorKind::UnsupportedFormat
        );
        assert_eq!(
            ConfigField::try_from(12).unwrap_err().kind(),
            crate::ErrorKind::UnsupportedFormat
        );
        assert!(ReferenceKind::try_from(2).is_err());

        Ok(())
    }

    #[test]
    fn test_strings() -> anyhow::Result<()> {
        let mut data = vec![];
        write_string(&mut data, "héllo", "greeting")?;
        write_nullable_string(&mut data, None, "nothing")?;
        write_string_list(&mut data, &["a".to_string(), "".to_string()], "list")?;

        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_string("greeting")?, "héllo");
        assert_eq!(reader.read_nullable_string("nothing")?, None);
        assert_eq!(reader.read_string_list("list")?, vec!["a", ""]);
        assert!(reader.is_empty());

        Ok(())
    }

    #[test]
    fn test_reader_errors() {
        let mut reader = ByteReader::new(&[1, 0, 0]);
        let err = reader.read_u32("count").unwrap_err();
        assert!(matches!(err, Error::MalformedData { offset: 0, .. }));

        let mut reader = ByteReader::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(reader.read_string("name").is_err());

        let mut reader = ByteReader::new(&[2, 0, 0, 0, 0xc3, 0x28]);
        assert!(reader.read_string("name").is_err());

        // A count that cannot possibly fit is rejected before allocating.
        let mut reader = ByteReader::new(&[0xfe, 0xff, 0xff, 0x7f]);
        assert!(reader.read_string_list("list").is_err());
    }
}
