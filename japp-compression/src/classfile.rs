// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! JVM class file transform.

Class files are dominated by `CONSTANT_Utf8` entries, and most of those are
class names and type descriptors repeated across every class of a library.
This transform moves those strings into the container wide
[ByteArrayPool](crate::pool::ByteArrayPool) so each distinct package path
and simple name is stored once.

The class file is scanned twice. The first pass walks the constant pool,
member descriptors and the attributes that reference strings (`Signature`,
`LocalVariableTable`, `LocalVariableTypeTable` and annotations, including
inside `Code`) to infer a [StringRole] for every `CONSTANT_Utf8` entry. The
second pass emits the constant pool with every `CONSTANT_Utf8` replaced by
one of:

* `0xff` text: varint pool index of the whole string.
* `0xfe` class name: varint index of the package, varint index of the
  simple name. An empty package means no `/` separator.
* `0xfd` descriptor: varint index of a skeleton. The skeleton is the
  descriptor with each `Lpkg/Name;` replaced by `L`, the package index and
  the name index. The `;` is implied.
* `0xfc` signature: as a descriptor, but the name ends at `;`, `<` or `:`
  and that character stays in the skeleton.

Other constants are copied unchanged. Everything after the constant pool is
then stored as a method byte (`None` or `Fse`) and the tail bytes.

Every role encoding falls back to text when a string does not fit its
expected shape, so arbitrary contents survive the transform.
*/

use {
    crate::{
        entropy,
        method::CompressionMethod,
        pool::{ByteArrayPool, ByteArrayPoolBuilder, MAX_ENTRY_SIZE},
        varint, CompressionResult, Error,
    },
    byteorder::{BigEndian, ByteOrder},
    std::convert::TryFrom,
};

pub const CLASS_MAGIC: u32 = 0xcafe_babe;

const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

const POOLED_TEXT: u8 = 0xff;
const POOLED_CLASS: u8 = 0xfe;
const POOLED_DESCRIPTOR: u8 = 0xfd;
const POOLED_SIGNATURE: u8 = 0xfc;

/// Nesting limit for annotation element values.
const MAX_ANNOTATION_DEPTH: usize = 64;

/// Payload size of a fixed size constant pool entry.
fn constant_size(tag: u8) -> Option<usize> {
    match tag {
        CONSTANT_INTEGER | CONSTANT_FLOAT => Some(4),
        CONSTANT_LONG | CONSTANT_DOUBLE => Some(8),
        CONSTANT_CLASS | CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE
        | CONSTANT_PACKAGE => Some(2),
        CONSTANT_FIELDREF
        | CONSTANT_METHODREF
        | CONSTANT_INTERFACE_METHODREF
        | CONSTANT_NAME_AND_TYPE
        | CONSTANT_DYNAMIC
        | CONSTANT_INVOKE_DYNAMIC => Some(4),
        CONSTANT_METHOD_HANDLE => Some(3),
        _ => None,
    }
}

/// How a `CONSTANT_Utf8` entry is referenced.
///
/// Variants are ordered by strength. When one entry is reached in two
/// roles the stronger wins, see [StringRole::merge].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StringRole {
    Text,
    Signature,
    ClassName,
    Descriptor,
}

impl StringRole {
    /// Combine two roles required of the same entry.
    ///
    /// Returns `None` for a class name that is also used as a signature,
    /// which no valid class file produces.
    pub fn merge(self, other: Self) -> Option<Self> {
        match (self.min(other), self.max(other)) {
            (StringRole::Signature, StringRole::ClassName) => None,
            (_, strongest) => Some(strongest),
        }
    }
}

/// Bounds checked big endian reader.
struct ClassReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ClassReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, len: usize) -> CompressionResult<&'a [u8]> {
        let start = self.position;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::malformed(start, "unexpected end of class file"))?;

        self.position = end;

        Ok(&self.data[start..end])
    }

    fn skip(&mut self, len: usize) -> CompressionResult<()> {
        self.take(len).map(|_| ())
    }

    fn u1(&mut self) -> CompressionResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> CompressionResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u4(&mut self) -> CompressionResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn varint(&mut self) -> CompressionResult<u32> {
        varint::decode(self.data, &mut self.position)
    }
}

/// Constant pool positions and inferred string roles of one class file.
struct ClassLayout<'a> {
    data: &'a [u8],
    /// Tag and payload offset of each slot. Slot 0 and the second slot of
    /// 8 byte constants are `None`.
    constants: Vec<Option<(u8, usize)>>,
    roles: Vec<StringRole>,
    tail_offset: usize,
}

impl<'a> ClassLayout<'a> {
    fn parse(data: &'a [u8]) -> CompressionResult<Self> {
        let mut reader = ClassReader::new(data);

        let magic = reader.u4()?;
        if magic != CLASS_MAGIC {
            return Err(Error::malformed(
                0,
                format!("bad class file magic 0x{:08x}", magic),
            ));
        }

        reader.skip(4)?;
        let count = reader.u2()? as usize;
        if count == 0 {
            return Err(Error::malformed(8, "constant pool count is 0"));
        }

        let mut constants = vec![None; count];
        let mut index = 1;

        while index < count {
            let tag_offset = reader.position;
            let tag = reader.u1()?;
            let payload = reader.position;

            if tag == CONSTANT_UTF8 {
                let len = reader.u2()? as usize;
                reader.skip(len)?;
            } else {
                let size = constant_size(tag).ok_or_else(|| {
                    Error::malformed(tag_offset, format!("invalid constant pool tag {}", tag))
                })?;
                reader.skip(size)?;
            }

            constants[index] = Some((tag, payload));

            index += if tag == CONSTANT_LONG || tag == CONSTANT_DOUBLE {
                2
            } else {
                1
            };
        }

        if index > count {
            return Err(Error::malformed(
                reader.position,
                "8 byte constant overflows the constant pool",
            ));
        }

        let mut layout = Self {
            data,
            constants,
            roles: vec![StringRole::Text; count],
            tail_offset: reader.position,
        };

        for index in 1..count {
            if let Some((tag, payload)) = layout.constants[index] {
                match tag {
                    CONSTANT_CLASS => {
                        layout.mark_at(payload, StringRole::ClassName)?;
                    }
                    CONSTANT_NAME_AND_TYPE => {
                        layout.mark_at(payload + 2, StringRole::Descriptor)?;
                    }
                    CONSTANT_METHOD_TYPE => {
                        layout.mark_at(payload, StringRole::Descriptor)?;
                    }
                    _ => {}
                }
            }
        }

        // access_flags, this_class, super_class
        reader.skip(6)?;
        let interfaces = reader.u2()? as usize;
        reader.skip(interfaces * 2)?;

        // Fields, then methods.
        for _ in 0..2 {
            let members = reader.u2()?;
            for _ in 0..members {
                // access_flags, name_index
                reader.skip(4)?;
                layout.mark_next(&mut reader, StringRole::Descriptor)?;
                layout.scan_attributes(&mut reader)?;
            }
        }

        layout.scan_attributes(&mut reader)?;

        Ok(layout)
    }

    fn utf8(&self, index: u16) -> Option<&'a [u8]> {
        match self.constants.get(index as usize) {
            Some(Some((CONSTANT_UTF8, payload))) => {
                let len = BigEndian::read_u16(&self.data[*payload..]) as usize;
                Some(&self.data[payload + 2..payload + 2 + len])
            }
            _ => None,
        }
    }

    fn mark(&mut self, index: u16, role: StringRole, offset: usize) -> CompressionResult<()> {
        if self.utf8(index).is_none() {
            return Err(Error::malformed(
                offset,
                format!("constant #{} is not CONSTANT_Utf8", index),
            ));
        }

        let slot = index as usize;
        let current = self.roles[slot];
        self.roles[slot] = current.merge(role).ok_or_else(|| {
            Error::malformed(
                offset,
                format!(
                    "constant #{} used as both {:?} and {:?}",
                    index, current, role
                ),
            )
        })?;

        Ok(())
    }

    /// Mark the constant whose u2 index is stored at `offset`.
    fn mark_at(&mut self, offset: usize, role: StringRole) -> CompressionResult<()> {
        let index = BigEndian::read_u16(&self.data[offset..offset + 2]);
        self.mark(index, role, offset)
    }

    /// Mark the constant whose u2 index is next in `reader`.
    fn mark_next(&mut self, reader: &mut ClassReader, role: StringRole) -> CompressionResult<()> {
        let offset = reader.position;
        let index = reader.u2()?;
        self.mark(index, role, offset)
    }

    fn scan_attributes(&mut self, reader: &mut ClassReader) -> CompressionResult<()> {
        let count = reader.u2()?;

        for _ in 0..count {
            let name_offset = reader.position;
            let name_index = reader.u2()?;
            let length = reader.u4()? as usize;
            let start = reader.position;

            if length > self.data.len() - start {
                return Err(Error::malformed(
                    name_offset + 2,
                    "attribute length exceeds class file",
                ));
            }

            let name = self.utf8(name_index).ok_or_else(|| {
                Error::malformed(name_offset, "attribute name is not CONSTANT_Utf8")
            })?;

            match name {
                b"Signature" => {
                    if length != 2 {
                        return Err(Error::malformed(
                            name_offset + 2,
                            format!("Signature attribute has length {}", length),
                        ));
                    }
                    self.mark_next(reader, StringRole::Signature)?;
                }
                b"Code" => {
                    // max_stack, max_locals
                    reader.skip(4)?;
                    let code_length = reader.u4()? as usize;
                    reader.skip(code_length)?;
                    let exceptions = reader.u2()? as usize;
                    reader.skip(exceptions * 8)?;
                    self.scan_attributes(reader)?;
                }
                b"LocalVariableTable" | b"LocalVariableTypeTable" => {
                    let role = if name == b"LocalVariableTable" {
                        StringRole::Descriptor
                    } else {
                        StringRole::Signature
                    };

                    let entries = reader.u2()?;
                    for _ in 0..entries {
                        // start_pc, length, name_index
                        reader.skip(6)?;
                        self.mark_next(reader, role)?;
                        // index
                        reader.skip(2)?;
                    }
                }
                b"RuntimeVisibleAnnotations" | b"RuntimeInvisibleAnnotations" => {
                    let annotations = reader.u2()?;
                    for _ in 0..annotations {
                        self.scan_annotation(reader, 0)?;
                    }
                }
                b"RuntimeVisibleParameterAnnotations"
                | b"RuntimeInvisibleParameterAnnotations" => {
                    let parameters = reader.u1()?;
                    for _ in 0..parameters {
                        let annotations = reader.u2()?;
                        for _ in 0..annotations {
                            self.scan_annotation(reader, 0)?;
                        }
                    }
                }
                _ => reader.skip(length)?,
            }

            if reader.position != start + length {
                return Err(Error::malformed(
                    start,
                    format!(
                        "attribute {} declares {} bytes but holds {}",
                        String::from_utf8_lossy(name),
                        length,
                        reader.position - start
                    ),
                ));
            }
        }

        Ok(())
    }

    fn scan_annotation(&mut self, reader: &mut ClassReader, depth: usize) -> CompressionResult<()> {
        if depth > MAX_ANNOTATION_DEPTH {
            return Err(Error::malformed(
                reader.position,
                "annotations nested too deeply",
            ));
        }

        self.mark_next(reader, StringRole::Descriptor)?;

        let pairs = reader.u2()?;
        for _ in 0..pairs {
            // element_name_index
            reader.skip(2)?;
            self.scan_element_value(reader, depth)?;
        }

        Ok(())
    }

    fn scan_element_value(&mut self, reader: &mut ClassReader, depth: usize) -> CompressionResult<()> {
        if depth > MAX_ANNOTATION_DEPTH {
            return Err(Error::malformed(
                reader.position,
                "annotations nested too deeply",
            ));
        }

        let tag_offset = reader.position;
        let tag = reader.u1()?;

        match tag {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => reader.skip(2)?,
            b'e' => {
                self.mark_next(reader, StringRole::Descriptor)?;
                // const_name_index
                reader.skip(2)?;
            }
            b'c' => self.mark_next(reader, StringRole::Descriptor)?,
            b'@' => self.scan_annotation(reader, depth + 1)?,
            b'[' => {
                let values = reader.u2()?;
                for _ in 0..values {
                    self.scan_element_value(reader, depth + 1)?;
                }
            }
            _ => {
                return Err(Error::malformed(
                    tag_offset,
                    format!("unknown element value tag 0x{:02x}", tag),
                ))
            }
        }

        Ok(())
    }
}

/// Split a binary class name into package and simple name.
///
/// Returns `None` when the split could not be reversed, i.e. the name
/// starts with `/`.
fn split_class_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
    match name.iter().rposition(|b| *b == b'/') {
        Some(0) => None,
        Some(slash) => Some((&name[..slash], &name[slash + 1..])),
        None => Some((&[], name)),
    }
}

enum SkeletonPiece<'a> {
    Byte(u8),
    Name(&'a [u8], &'a [u8]),
}

/// Split a descriptor or signature into skeleton bytes and class names.
fn skeleton_pieces(text: &[u8], signature: bool) -> Option<Vec<SkeletonPiece<'_>>> {
    let mut pieces = Vec::with_capacity(text.len());
    let mut i = 0;

    while i < text.len() {
        let b = text[i];
        pieces.push(SkeletonPiece::Byte(b));
        i += 1;

        if b != b'L' {
            continue;
        }

        let end = text[i..]
            .iter()
            .position(|c| {
                if signature {
                    matches!(c, b';' | b'<' | b':')
                } else {
                    *c == b';'
                }
            })
            .map(|p| i + p);

        let end = match end {
            Some(end) => end,
            None if signature => text.len(),
            None => return None,
        };

        let (package, name) = split_class_name(&text[i..end])?;
        pieces.push(SkeletonPiece::Name(package, name));

        // Descriptors imply the `;`. Signature terminators stay in the skeleton.
        i = if signature { end } else { end + 1 };
    }

    Some(pieces)
}

fn push_pooled(
    pool: &mut ByteArrayPoolBuilder,
    value: &[u8],
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    varint::encode_into(pool.add(value)?, output);
    Ok(())
}

fn encode_text(
    text: &[u8],
    pool: &mut ByteArrayPoolBuilder,
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    output.push(POOLED_TEXT);
    push_pooled(pool, text, output)
}

fn encode_skeleton(
    text: &[u8],
    signature: bool,
    pool: &mut ByteArrayPoolBuilder,
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    let pieces = match skeleton_pieces(text, signature) {
        Some(pieces) => pieces,
        None => return encode_text(text, pool, output),
    };

    let mut skeleton = Vec::with_capacity(text.len());
    for piece in pieces {
        match piece {
            SkeletonPiece::Byte(b) => skeleton.push(b),
            SkeletonPiece::Name(package, name) => {
                push_pooled(pool, package, &mut skeleton)?;
                push_pooled(pool, name, &mut skeleton)?;
            }
        }
    }

    if skeleton.len() > MAX_ENTRY_SIZE {
        return encode_text(text, pool, output);
    }

    output.push(if signature {
        POOLED_SIGNATURE
    } else {
        POOLED_DESCRIPTOR
    });
    push_pooled(pool, &skeleton, output)
}

fn encode_string(
    text: &[u8],
    role: StringRole,
    pool: &mut ByteArrayPoolBuilder,
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    match role {
        StringRole::Text => encode_text(text, pool, output),
        // Array classes are named by their descriptor.
        StringRole::ClassName if text.first() == Some(&b'[') => {
            encode_skeleton(text, false, pool, output)
        }
        StringRole::ClassName => match split_class_name(text) {
            Some((package, name)) => {
                output.push(POOLED_CLASS);
                push_pooled(pool, package, output)?;
                push_pooled(pool, name, output)
            }
            None => encode_text(text, pool, output),
        },
        StringRole::Descriptor => encode_skeleton(text, false, pool, output),
        StringRole::Signature => encode_skeleton(text, true, pool, output),
    }
}

/// Transform a class file, adding its strings to `pool`.
///
/// Fails with [Error::MalformedData] if `data` is not a structurally valid
/// class file.
pub fn compress(data: &[u8], pool: &mut ByteArrayPoolBuilder) -> CompressionResult<Vec<u8>> {
    let layout = ClassLayout::parse(data)?;

    let mut output = Vec::with_capacity(data.len());
    // magic, minor_version, major_version, constant_pool_count
    output.extend_from_slice(&data[0..10]);

    for (index, constant) in layout.constants.iter().enumerate() {
        let (tag, payload) = match constant {
            Some(constant) => *constant,
            None => continue,
        };

        if tag == CONSTANT_UTF8 {
            let len = BigEndian::read_u16(&data[payload..]) as usize;
            let text = &data[payload + 2..payload + 2 + len];
            encode_string(text, layout.roles[index], pool, &mut output)?;
        } else {
            let size = constant_size(tag).unwrap_or(0);
            output.push(tag);
            output.extend_from_slice(&data[payload..payload + size]);
        }
    }

    let tail = &data[layout.tail_offset..];
    let block = entropy::compress(tail)?;

    if block.len() < tail.len() {
        output.push(CompressionMethod::Fse.into());
        output.extend_from_slice(&block);
    } else {
        output.push(CompressionMethod::None.into());
        output.extend_from_slice(tail);
    }

    Ok(output)
}

fn pool_entry(pool: &ByteArrayPool, index: u32, offset: usize) -> CompressionResult<&[u8]> {
    pool.get(index).ok_or_else(|| {
        Error::malformed(
            offset,
            format!(
                "pool index {} out of range ({} entries)",
                index,
                pool.len()
            ),
        )
    })
}

fn push_class_name(
    pool: &ByteArrayPool,
    package: u32,
    name: u32,
    offset: usize,
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    let package = pool_entry(pool, package, offset)?;
    if !package.is_empty() {
        output.extend_from_slice(package);
        output.push(b'/');
    }
    output.extend_from_slice(pool_entry(pool, name, offset)?);

    Ok(())
}

fn expand_skeleton(
    pool: &ByteArrayPool,
    skeleton: &[u8],
    descriptor: bool,
    offset: usize,
    output: &mut Vec<u8>,
) -> CompressionResult<()> {
    let limit = output.len() + u16::MAX as usize;
    let mut i = 0;

    while i < skeleton.len() {
        if output.len() > limit {
            return Err(Error::malformed(
                offset,
                "reconstructed string exceeds 65535 bytes",
            ));
        }

        let b = skeleton[i];
        output.push(b);
        i += 1;

        if b == b'L' {
            let corrupt = |_| Error::malformed(offset, "corrupt descriptor skeleton");
            let package = varint::decode(skeleton, &mut i).map_err(corrupt)?;
            let name = varint::decode(skeleton, &mut i).map_err(corrupt)?;

            push_class_name(pool, package, name, offset, output)?;

            if descriptor {
                output.push(b';');
            }
        }
    }

    Ok(())
}

/// Reverse [compress], producing exactly `size` bytes.
pub fn decompress(data: &[u8], pool: &ByteArrayPool, size: usize) -> CompressionResult<Vec<u8>> {
    let mut reader = ClassReader::new(data);
    let mut output = Vec::with_capacity(size);

    let magic = reader.u4()?;
    if magic != CLASS_MAGIC {
        return Err(Error::malformed(
            0,
            format!("bad class file magic 0x{:08x}", magic),
        ));
    }
    output.extend_from_slice(&data[0..4]);
    output.extend_from_slice(reader.take(4)?);

    let count = reader.u2()?;
    output.extend_from_slice(&count.to_be_bytes());

    let mut index = 1;
    while index < count {
        let tag_offset = reader.position;
        let tag = reader.u1()?;

        match tag {
            CONSTANT_UTF8 => {
                let len = reader.u2()?;
                output.push(CONSTANT_UTF8);
                output.extend_from_slice(&len.to_be_bytes());
                output.extend_from_slice(reader.take(len as usize)?);
            }
            POOLED_TEXT | POOLED_CLASS | POOLED_DESCRIPTOR | POOLED_SIGNATURE => {
                output.push(CONSTANT_UTF8);
                let length_position = output.len();
                output.extend_from_slice(&[0, 0]);

                match tag {
                    POOLED_TEXT => {
                        let text = pool_entry(pool, reader.varint()?, tag_offset)?;
                        output.extend_from_slice(text);
                    }
                    POOLED_CLASS => {
                        let package = reader.varint()?;
                        let name = reader.varint()?;
                        push_class_name(pool, package, name, tag_offset, &mut output)?;
                    }
                    _ => {
                        let skeleton = pool_entry(pool, reader.varint()?, tag_offset)?;
                        expand_skeleton(
                            pool,
                            skeleton,
                            tag == POOLED_DESCRIPTOR,
                            tag_offset,
                            &mut output,
                        )?;
                    }
                }

                let len = output.len() - length_position - 2;
                if len > u16::MAX as usize {
                    return Err(Error::malformed(
                        tag_offset,
                        "reconstructed string exceeds 65535 bytes",
                    ));
                }
                BigEndian::write_u16(&mut output[length_position..], len as u16);
            }
            _ => {
                let len = constant_size(tag).ok_or_else(|| {
                    Error::malformed(tag_offset, format!("invalid constant pool tag {}", tag))
                })?;
                output.push(tag);
                output.extend_from_slice(reader.take(len)?);

                if tag == CONSTANT_LONG || tag == CONSTANT_DOUBLE {
                    index += 1;
                }
            }
        }

        if output.len() > size {
            return Err(Error::malformed(
                tag_offset,
                format!("constant pool exceeds declared class size {}", size),
            ));
        }

        index += 1;
    }

    let method_offset = reader.position;
    let method = CompressionMethod::try_from(reader.u1()?)?;
    let tail = &data[reader.position..];
    let tail_size = size.checked_sub(output.len()).ok_or_else(|| {
        Error::malformed(
            method_offset,
            format!("constant pool exceeds declared class size {}", size),
        )
    })?;

    match method {
        CompressionMethod::None => {
            if tail.len() != tail_size {
                return Err(Error::malformed(
                    reader.position,
                    format!(
                        "class file tail holds {} bytes; expected {}",
                        tail.len(),
                        tail_size
                    ),
                ));
            }
            output.extend_from_slice(tail);
        }
        CompressionMethod::Fse => {
            let tail = entropy::decompress(tail, tail_size)
                .map_err(|e| e.offset_by(reader.position))?;
            output.extend_from_slice(&tail);
        }
        method => {
            return Err(Error::malformed(
                method_offset,
                format!("class file tail cannot use compression method {}", method),
            ))
        }
    }

    Ok(output)
}
