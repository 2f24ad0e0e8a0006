// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deduplicated byte string pool shared by every class file in a container.

Entries are addressed by their insertion index. The serialized block is:

```text
u8   magic (0xf0)
u8   compression method of the byte payload (None or Fse)
u16  reserved, 0
u32  entry count
u32  uncompressed payload length
u32  compressed payload length
u16  entry sizes, one per entry
     payload
```

All integers are little endian.
*/

use {
    crate::{entropy, method::CompressionMethod, CompressionResult, Error},
    byteorder::{ByteOrder, LittleEndian},
    std::{collections::HashMap, convert::TryFrom},
};

pub const POOL_MAGIC: u8 = 0xf0;

const HEADER_SIZE: usize = 16;

/// Maximum size of a single pooled byte string.
pub const MAX_ENTRY_SIZE: usize = u16::MAX as usize;

/// Accumulates unique byte strings during packing.
#[derive(Clone, Debug, Default)]
pub struct ByteArrayPoolBuilder {
    indices: HashMap<Vec<u8>, u32>,
    sizes: Vec<u16>,
    bytes: Vec<u8>,
}

impl ByteArrayPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain the index of `data`, adding it if not already present.
    pub fn add(&mut self, data: &[u8]) -> CompressionResult<u32> {
        if let Some(index) = self.indices.get(data) {
            return Ok(*index);
        }

        if data.len() > MAX_ENTRY_SIZE {
            return Err(Error::CapacityExceeded {
                what: "pool entry",
                size: data.len() as u64,
                limit: MAX_ENTRY_SIZE as u64,
            });
        }

        let index = u32::try_from(self.sizes.len()).map_err(|_| Error::CapacityExceeded {
            what: "pool entry count",
            size: self.sizes.len() as u64,
            limit: u32::MAX as u64,
        })?;

        self.indices.insert(data.to_vec(), index);
        self.sizes.push(data.len() as u16);
        self.bytes.extend_from_slice(data);

        Ok(index)
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Drop every entry added after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.sizes.len() {
            return;
        }

        let keep = self.sizes[..len].iter().map(|s| *s as usize).sum::<usize>();

        let mut offset = keep;
        for size in &self.sizes[len..] {
            let end = offset + *size as usize;
            self.indices.remove(&self.bytes[offset..end]);
            offset = end;
        }

        self.sizes.truncate(len);
        self.bytes.truncate(keep);
    }

    /// Total length of all entries.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Obtain a read-only pool with the current contents.
    pub fn to_pool(&self) -> ByteArrayPool {
        ByteArrayPool::from_parts(self.bytes.clone(), &self.sizes)
    }

    /// Serialize the pool as a block.
    ///
    /// The payload is entropy coded when that saves space.
    pub fn to_block(&self) -> CompressionResult<Vec<u8>> {
        let compressed = if self.bytes.len() >= 16 {
            let block = entropy::compress(&self.bytes)?;
            if block.len() + 4 < self.bytes.len() {
                Some(block)
            } else {
                None
            }
        } else {
            None
        };

        let (method, payload) = match &compressed {
            Some(block) => (CompressionMethod::Fse, block.as_slice()),
            None => (CompressionMethod::None, self.bytes.as_slice()),
        };

        let mut res = Vec::with_capacity(HEADER_SIZE + self.sizes.len() * 2 + payload.len());
        res.push(POOL_MAGIC);
        res.push(method.into());
        res.extend_from_slice(&0u16.to_le_bytes());
        res.extend_from_slice(&(self.sizes.len() as u32).to_le_bytes());
        res.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        res.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        for size in &self.sizes {
            res.extend_from_slice(&size.to_le_bytes());
        }
        res.extend_from_slice(payload);

        Ok(res)
    }
}

/// Read-only pool resolved from a serialized block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteArrayPool {
    bytes: Vec<u8>,
    /// `(offset, size)` of each entry within `bytes`.
    entries: Vec<(u32, u16)>,
}

impl ByteArrayPool {
    fn from_parts(bytes: Vec<u8>, sizes: &[u16]) -> Self {
        let mut offset = 0u32;
        let entries = sizes
            .iter()
            .map(|size| {
                let entry = (offset, *size);
                offset += *size as u32;
                entry
            })
            .collect();

        Self { bytes, entries }
    }

    /// Parse a pool block starting at `*offset` in `data`.
    ///
    /// Pools whose decoded bytes would exceed `max_size` are refused before
    /// anything is allocated. On success `*offset` is advanced past the block.
    pub fn read_block(
        data: &[u8],
        offset: &mut usize,
        max_size: u64,
    ) -> CompressionResult<Self> {
        let start = *offset;

        let header = data
            .get(start..start + HEADER_SIZE)
            .ok_or_else(|| Error::malformed(start, "truncated byte array pool header"))?;

        if header[0] != POOL_MAGIC {
            return Err(Error::malformed(
                start,
                format!("bad byte array pool magic 0x{:02x}", header[0]),
            ));
        }

        let method = CompressionMethod::try_from(header[1])?;
        if LittleEndian::read_u16(&header[2..4]) != 0 {
            return Err(Error::malformed(start + 2, "reserved pool flags are not 0"));
        }

        let count = LittleEndian::read_u32(&header[4..8]) as usize;
        let uncompressed_size = LittleEndian::read_u32(&header[8..12]) as usize;
        let compressed_size = LittleEndian::read_u32(&header[12..16]) as usize;

        if uncompressed_size as u64 > max_size {
            return Err(Error::CapacityExceeded {
                what: "byte array pool",
                size: uncompressed_size as u64,
                limit: max_size,
            });
        }

        let sizes_start = start + HEADER_SIZE;
        let sizes_end = count
            .checked_mul(2)
            .and_then(|len| sizes_start.checked_add(len))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::malformed(sizes_start, "truncated byte array pool sizes"))?;

        let sizes = data[sizes_start..sizes_end]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect::<Vec<_>>();

        let total = sizes.iter().map(|s| *s as usize).sum::<usize>();
        if total != uncompressed_size {
            return Err(Error::malformed(
                start + 8,
                format!(
                    "pool entries hold {} bytes; header declares {}",
                    total, uncompressed_size
                ),
            ));
        }

        let payload = data
            .get(sizes_end..sizes_end + compressed_size)
            .ok_or_else(|| Error::malformed(sizes_end, "truncated byte array pool payload"))?;

        let bytes = match method {
            CompressionMethod::None => {
                if compressed_size != uncompressed_size {
                    return Err(Error::malformed(
                        start + 12,
                        "uncompressed pool payload length mismatch",
                    ));
                }
                payload.to_vec()
            }
            CompressionMethod::Fse => entropy::decompress(payload, uncompressed_size)
                .map_err(|e| e.offset_by(sizes_end))?,
            method => {
                return Err(Error::UnsupportedFormat(format!(
                    "byte array pool cannot use compression method {}",
                    method
                )))
            }
        };

        *offset = sizes_end + compressed_size;

        Ok(Self::from_parts(bytes, &sizes))
    }

    /// Obtain the entry at `index`.
    pub fn get(&self, index: u32) -> Option<&[u8]> {
        let (offset, size) = *self.entries.get(index as usize)?;
        let offset = offset as usize;

        Some(&self.bytes[offset..offset + size as usize])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup() -> CompressionResult<()> {
        let mut builder = ByteArrayPoolBuilder::new();

        assert_eq!(builder.add(b"java/lang")?, 0);
        assert_eq!(builder.add(b"Object")?, 1);
        assert_eq!(builder.add(b"java/lang")?, 0);
        assert_eq!(builder.add(b"")?, 2);
        assert_eq!(builder.add(b"Object")?, 1);
        assert_eq!(builder.add(b"String")?, 3);

        assert_eq!(builder.len(), 4);
        assert_eq!(builder.byte_len(), 9 + 6 + 6);

        let pool = builder.to_pool();
        assert_eq!(pool.get(0), Some(&b"java/lang"[..]));
        assert_eq!(pool.get(2), Some(&b""[..]));
        assert_eq!(pool.get(3), Some(&b"String"[..]));
        assert_eq!(pool.get(4), None);

        Ok(())
    }

    #[test]
    fn test_truncate() -> CompressionResult<()> {
        let mut builder = ByteArrayPoolBuilder::new();
        builder.add(b"java/lang")?;
        builder.add(b"Object")?;
        builder.add(b"org/example")?;
        builder.add(b"Widget")?;

        builder.truncate(2);
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.byte_len(), 15);
        assert_eq!(builder.to_pool().get(2), None);

        // Dropped entries are assigned fresh indices again.
        assert_eq!(builder.add(b"Widget")?, 2);
        assert_eq!(builder.add(b"Object")?, 1);

        builder.truncate(10);
        assert_eq!(builder.len(), 3);

        builder.truncate(0);
        assert!(builder.is_empty());
        assert_eq!(builder.add(b"Object")?, 0);

        Ok(())
    }

    #[test]
    fn test_oversized_entry() {
        let mut builder = ByteArrayPoolBuilder::new();
        let err = builder.add(&vec![0u8; MAX_ENTRY_SIZE + 1]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CapacityExceeded);
        assert!(builder.is_empty());

        assert_eq!(builder.add(&vec![0u8; MAX_ENTRY_SIZE]).unwrap(), 0);
    }

    #[test]
    fn test_block_round_trip() -> CompressionResult<()> {
        let mut builder = ByteArrayPoolBuilder::new();
        for i in 0..500 {
            builder.add(format!("org/example/pkg{}", i % 20).as_bytes())?;
            builder.add(format!("Widget{}", i).as_bytes())?;
        }

        let block = builder.to_block()?;
        // Repetitive names compress.
        assert_eq!(block[1], u8::from(CompressionMethod::Fse));

        let mut data = b"prefix".to_vec();
        data.extend_from_slice(&block);
        data.extend_from_slice(b"suffix");

        let mut offset = 6;
        let pool = ByteArrayPool::read_block(&data, &mut offset, 1 << 30)?;
        assert_eq!(offset, 6 + block.len());
        assert_eq!(pool, builder.to_pool());
        assert_eq!(pool.get(1), Some(&b"Widget0"[..]));

        Ok(())
    }

    #[test]
    fn test_empty_block() -> CompressionResult<()> {
        let block = ByteArrayPoolBuilder::new().to_block()?;
        assert_eq!(block.len(), HEADER_SIZE);

        let mut offset = 0;
        let pool = ByteArrayPool::read_block(&block, &mut offset, 1 << 30)?;
        assert!(pool.is_empty());

        Ok(())
    }

    #[test]
    fn test_bad_blocks() -> CompressionResult<()> {
        let mut builder = ByteArrayPoolBuilder::new();
        builder.add(b"abc")?;
        let block = builder.to_block()?;

        let mut bad = block.clone();
        bad[0] = 0xf1;
        assert!(ByteArrayPool::read_block(&bad, &mut 0, 1 << 30).is_err());

        let mut bad = block.clone();
        bad[1] = 9;
        let err = ByteArrayPool::read_block(&bad, &mut 0, 1 << 30).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedFormat);

        // Declared size disagrees with the entry table.
        let mut bad = block.clone();
        bad[8] = 4;
        assert!(ByteArrayPool::read_block(&bad, &mut 0, 1 << 30).is_err());

        // Entry count running past the input.
        let mut bad = block.clone();
        bad[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(ByteArrayPool::read_block(&bad, &mut 0, 1 << 30).is_err());

        assert!(ByteArrayPool::read_block(&block[..block.len() - 1], &mut 0, 1 << 30).is_err());

        Ok(())
    }

    #[test]
    fn test_pool_size_limit() -> CompressionResult<()> {
        let mut builder = ByteArrayPoolBuilder::new();
        builder.add(&[b'x'; 1000])?;
        let block = builder.to_block()?;

        let err = ByteArrayPool::read_block(&block, &mut 0, 999).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CapacityExceeded);
        assert!(ByteArrayPool::read_block(&block, &mut 0, 1000).is_ok());

        // Many maximal entries behind a tiny run-length payload.
        let count = 2048u32;
        let mut bad = vec![POOL_MAGIC, u8::from(CompressionMethod::Fse), 0, 0];
        bad.extend_from_slice(&count.to_le_bytes());
        bad.extend_from_slice(&(count * u16::MAX as u32).to_le_bytes());
        bad.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..count {
            bad.extend_from_slice(&u16::MAX.to_le_bytes());
        }
        bad.extend_from_slice(&[1, b'x']);

        let err = ByteArrayPool::read_block(&bad, &mut 0, 1 << 20).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CapacityExceeded);

        Ok(())
    }
}
