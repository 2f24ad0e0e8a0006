// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resource groups and the boot metadata region.

The boot metadata region is:

```text
u32  magic ("BOOT")
u32  group count
     byte array pool block
     group blocks
```

Each group block has a 24 byte header followed by its body, the
concatenated resource records, which may be entropy coded:

```text
u8   magic (0xeb)
u8   compression method of the body (None or Fse)
u16  reserved, 0
u32  uncompressed body length
u32  stored body length
u32  resource count
u64  XxHash64 of the uncompressed body
```
*/

use {
    crate::{
        resource::Resource,
        serialization::{
            ByteReader, BOOT_MAGIC, GROUP_HEADER_SIZE, GROUP_MAGIC, MIN_RELEASE_TIER,
        },
        Error, PackedResult,
    },
    anyhow::{Context, Result},
    byteorder::{LittleEndian, WriteBytesExt},
    japp_compression::{xxhash64, ByteArrayPool, CompressionMethod},
    log::{debug, trace},
    std::{
        collections::{BTreeMap, HashMap},
        convert::TryFrom,
        io::Write,
    },
};

/// An ordered collection of resources with unique paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceGroup {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
}

impl ResourceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, replacing and returning any resource with the same path.
    pub fn insert(&mut self, resource: Resource) -> Option<Resource> {
        match self.index.get(&resource.name) {
            Some(position) => Some(std::mem::replace(&mut self.resources[*position], resource)),
            None => {
                self.index
                    .insert(resource.name.clone(), self.resources.len());
                self.resources.push(resource);
                None
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.index.get(path).map(|position| &self.resources[*position])
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate resources in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    fn body(&self) -> Result<Vec<u8>> {
        let mut body = vec![];
        for resource in &self.resources {
            resource.write_to(&mut body)?;
        }

        Ok(body)
    }

    /// Serialize this group as a block.
    ///
    /// The body is entropy coded if it is at least `threshold` bytes and
    /// coding saves more than 4 bytes.
    pub fn write_block<W: Write>(&self, dest: &mut W, threshold: usize) -> Result<()> {
        let body = self.body()?;
        let checksum = xxhash64(&body);

        let compressed = if body.len() >= threshold {
            let block = japp_compression::entropy::compress(&body)
                .context("compressing resource group")?;
            if block.len() + 4 < body.len() {
                Some(block)
            } else {
                None
            }
        } else {
            None
        };

        let (method, payload) = match &compressed {
            Some(data) => (CompressionMethod::Fse, data.as_slice()),
            None => (CompressionMethod::None, body.as_slice()),
        };

        trace!(
            "resource group of {} entries: {} body bytes stored as {} ({} bytes)",
            self.len(),
            body.len(),
            method,
            payload.len()
        );

        dest.write_u8(GROUP_MAGIC)
            .context("writing group magic")?;
        dest.write_u8(method.into())
            .context("writing group method")?;
        dest.write_u16::<LittleEndian>(0)
            .context("writing group flags")?;
        dest.write_u32::<LittleEndian>(u32::try_from(body.len()).context("group too large")?)
            .context("writing group length")?;
        dest.write_u32::<LittleEndian>(payload.len() as u32)
            .context("writing group compressed length")?;
        dest.write_u32::<LittleEndian>(u32::try_from(self.len()).context("group too large")?)
            .context("writing group count")?;
        dest.write_u64::<LittleEndian>(checksum)
            .context("writing group checksum")?;
        dest.write_all(payload).context("writing group body")?;

        Ok(())
    }

    /// Parse a group block from `reader`.
    ///
    /// `max_size` bounds the declared body length.
    pub fn read_block(
        reader: &mut ByteReader,
        verify_checksum: bool,
        max_size: u64,
    ) -> PackedResult<Self> {
        let start = reader.position() as u64;

        let magic = reader.read_u8("group magic")?;
        if magic != GROUP_MAGIC {
            return Err(Error::malformed(
                start,
                format!("bad resource group magic 0x{:02x}", magic),
            ));
        }

        let method = CompressionMethod::try_from(reader.read_u8("group method")?)?;
        if reader.read_u16("group flags")? != 0 {
            return Err(Error::malformed(start + 2, "reserved group flags are not 0"));
        }

        let size = reader.read_u32("group length")?;
        let compressed_size = reader.read_u32("group compressed length")?;
        let count = reader.read_u32("group count")?;
        let checksum = reader.read_u64("group checksum")?;

        if size as u64 > max_size {
            return Err(Error::CapacityExceeded {
                what: "resource group",
                size: size as u64,
                limit: max_size,
            });
        }

        let payload_start = reader.position() as u64;
        let payload = reader.read_bytes(compressed_size as usize, "group body")?;

        let body = match method {
            CompressionMethod::None => {
                if compressed_size != size {
                    return Err(Error::malformed(
                        start + 8,
                        "stored group length mismatch",
                    ));
                }
                payload.to_vec()
            }
            CompressionMethod::Fse => {
                japp_compression::entropy::decompress(payload, size as usize)
                    .map_err(|e| Error::from(e).offset_by(payload_start))?
            }
            method => {
                return Err(Error::UnsupportedFormat(format!(
                    "resource group cannot use compression method {}",
                    method
                )))
            }
        };

        if verify_checksum {
            let actual = xxhash64(&body);
            if actual != checksum {
                return Err(Error::malformed(
                    start + 16,
                    format!(
                        "resource group checksum mismatch (expected={:x}, actual={:x})",
                        checksum, actual
                    ),
                ));
            }
        }

        let mut group = Self::new();
        let mut body_reader = ByteReader::new(&body);
        for _ in 0..count {
            let record_offset = body_reader.position() as u64;
            let resource = Resource::read_from(&mut body_reader)?;

            if group.insert(resource).is_some() {
                return Err(Error::malformed(
                    record_offset,
                    "duplicate resource path in group",
                ));
            }
        }

        if !body_reader.is_empty() {
            return Err(Error::malformed(
                body_reader.position() as u64,
                format!(
                    "{} bytes left after {} resources",
                    body_reader.remaining(),
                    count
                ),
            ));
        }

        Ok(group)
    }
}

/// A base group plus release tiered override groups.
///
/// Groups are referenced by their index in [BootMetadata::groups].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSet {
    base: u32,
    releases: BTreeMap<i32, u32>,
}

impl GroupSet {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            releases: BTreeMap::new(),
        }
    }

    /// Register `group` as the override for runtimes at release `tier` or later.
    pub fn add_release(&mut self, tier: i32, group: u32) -> PackedResult<()> {
        if tier < MIN_RELEASE_TIER {
            return Err(Error::malformed(
                0,
                format!("release tier {} is below {}", tier, MIN_RELEASE_TIER),
            ));
        }

        if self.releases.insert(tier, group).is_some() {
            return Err(Error::malformed(0, format!("duplicate release tier {}", tier)));
        }

        Ok(())
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn releases(&self) -> &BTreeMap<i32, u32> {
        &self.releases
    }

    /// Groups applicable to `release`, most specific first.
    ///
    /// The first of these that holds a path provides it.
    pub fn groups_for(&self, release: i32) -> Vec<u32> {
        self.releases
            .range(..=release)
            .rev()
            .map(|(_, group)| *group)
            .chain(std::iter::once(self.base))
            .collect()
    }

    /// Look up a value through the tiers applicable to `release`.
    pub fn resolve<T>(&self, release: i32, lookup: impl FnMut(u32) -> Option<T>) -> Option<T> {
        self.groups_for(release).into_iter().find_map(lookup)
    }
}

/// Parsed boot metadata region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootMetadata {
    pub pool: ByteArrayPool,
    pub groups: Vec<ResourceGroup>,
}

impl BootMetadata {
    /// Parse the region in `data`.
    pub fn read_from(data: &[u8], verify_checksums: bool, max_size: u64) -> PackedResult<Self> {
        let mut reader = ByteReader::new(data);

        let magic = reader.read_u32("boot metadata magic")?;
        if magic != BOOT_MAGIC {
            return Err(Error::malformed(
                0,
                format!("bad boot metadata magic 0x{:08x}", magic),
            ));
        }

        let count = reader.read_u32("group count")?;
        // Every group needs at least its header.
        if count as usize > reader.remaining() / GROUP_HEADER_SIZE {
            return Err(Error::malformed(4, format!("impossible group count {}", count)));
        }

        let mut offset = reader.position();
        let pool = ByteArrayPool::read_block(data, &mut offset, max_size)?;
        reader.read_bytes(offset - reader.position(), "byte array pool")?;

        let groups = (0..count)
            .map(|_| ResourceGroup::read_block(&mut reader, verify_checksums, max_size))
            .collect::<PackedResult<Vec<_>>>()?;

        if !reader.is_empty() {
            return Err(Error::malformed(
                reader.position() as u64,
                "trailing bytes after resource groups",
            ));
        }

        debug!(
            "parsed boot metadata: {} groups, {} pooled strings",
            groups.len(),
            pool.len()
        );

        Ok(Self { pool, groups })
    }
}

/// Write a boot metadata region.
pub fn write_boot_metadata<W: Write>(
    dest: &mut W,
    pool_block: &[u8],
    groups: &[ResourceGroup],
    threshold: usize,
) -> Result<()> {
    dest.write_u32::<LittleEndian>(BOOT_MAGIC)
        .context("writing boot metadata magic")?;
    dest.write_u32::<LittleEndian>(u32::try_from(groups.len()).context("too many groups")?)
        .context("writing group count")?;
    dest.write_all(pool_block)
        .context("writing byte array pool")?;

    for group in groups {
        group.write_block(dest, threshold)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::ErrorKind, japp_compression::ByteArrayPoolBuilder};

    fn sample_group(count: usize) -> ResourceGroup {
        let mut group = ResourceGroup::new();
        for i in 0..count {
            let mut resource = Resource::new(
                format!("org/example/app/Resource{}.properties", i),
                CompressionMethod::Lz4,
                1000 + i as u32,
                400 + i as u32,
                4 + 2000 * i as u64,
            );
            resource.checksum = Some(i as u64 * 31);
            group.insert(resource);
        }
        group
    }

    #[test]
    fn test_insert_replaces() {
        let mut group = ResourceGroup::new();
        assert!(group
            .insert(Resource::new("a", CompressionMethod::None, 1, 1, 4))
            .is_none());
        assert!(group
            .insert(Resource::new("b", CompressionMethod::None, 2, 2, 5))
            .is_none());

        let old = group.insert(Resource::new("a", CompressionMethod::None, 3, 3, 7));
        assert_eq!(old.map(|r| r.size), Some(1));
        assert_eq!(group.len(), 2);
        assert_eq!(group.get("a").map(|r| r.offset), Some(7));
        assert_eq!(
            group.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_compressed_three_resources() -> Result<()> {
        let group = sample_group(3);

        let mut data = vec![];
        group.write_block(&mut data, 16)?;
        assert_eq!(data[1], u8::from(CompressionMethod::Fse));

        let mut reader = ByteReader::new(&data);
        let parsed = ResourceGroup::read_block(&mut reader, true, 1 << 30)?;
        assert!(reader.is_empty());

        assert_eq!(parsed.len(), 3);
        for (a, b) in parsed.iter().zip(group.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.offset, b.offset);
            assert_eq!(a.size, b.size);
            assert_eq!(a.compressed_size, b.compressed_size);
        }
        assert_eq!(parsed, group);

        Ok(())
    }

    #[test]
    fn test_small_group_stored() -> Result<()> {
        let mut group = ResourceGroup::new();
        group.insert(Resource::new("x", CompressionMethod::None, 0, 0, 4));

        let mut data = vec![];
        group.write_block(&mut data, 16)?;
        assert_eq!(data[1], u8::from(CompressionMethod::None));

        let parsed = ResourceGroup::read_block(&mut ByteReader::new(&data), true, 1 << 30)?;
        assert_eq!(parsed, group);

        Ok(())
    }

    #[test]
    fn test_bad_group_blocks() -> Result<()> {
        let group = sample_group(2);
        let mut data = vec![];
        group.write_block(&mut data, usize::MAX)?;

        // Flip a byte of the body.
        let mut bad = data.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        let err = ResourceGroup::read_block(&mut ByteReader::new(&bad), true, 1 << 30).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedData);

        // The damaged record no longer parses either.
        assert!(ResourceGroup::read_block(&mut ByteReader::new(&bad), false, 1 << 30).is_err());

        // Count larger than the records present.
        let mut bad = data.clone();
        bad[12] = 3;
        assert!(ResourceGroup::read_block(&mut ByteReader::new(&bad), true, 1 << 30).is_err());

        let err = ResourceGroup::read_block(&mut ByteReader::new(&data), true, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

        let mut bad = data.clone();
        bad[0] = 0;
        assert!(ResourceGroup::read_block(&mut ByteReader::new(&bad), true, 1 << 30).is_err());

        Ok(())
    }

    #[test]
    fn test_group_set_tiers() -> PackedResult<()> {
        let mut set = GroupSet::new(0);
        set.add_release(11, 2)?;
        set.add_release(9, 1)?;
        set.add_release(17, 3)?;

        assert_eq!(set.groups_for(8), vec![0]);
        assert_eq!(set.groups_for(9), vec![1, 0]);
        assert_eq!(set.groups_for(16), vec![2, 1, 0]);
        assert_eq!(set.groups_for(21), vec![3, 2, 1, 0]);

        // Group 2 lacks the path so the tier 9 override supplies it.
        let has = |group: u32| if group == 2 { None } else { Some(group) };
        assert_eq!(set.resolve(11, has), Some(1));

        assert_eq!(
            set.add_release(8, 4).unwrap_err().kind(),
            ErrorKind::MalformedData
        );
        assert!(set.add_release(11, 4).is_err());

        Ok(())
    }

    #[test]
    fn test_boot_metadata() -> Result<()> {
        let mut pool = ByteArrayPoolBuilder::new();
        pool.add(b"java/lang")?;

        let groups = vec![sample_group(3), ResourceGroup::new(), sample_group(40)];

        let mut data = vec![];
        write_boot_metadata(&mut data, &pool.to_block()?, &groups, 16)?;

        let metadata = BootMetadata::read_from(&data, true, 1 << 30)?;
        assert_eq!(metadata.groups, groups);
        assert_eq!(metadata.pool.get(0), Some(&b"java/lang"[..]));

        let err = BootMetadata::read_from(&data, true, 8).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CapacityExceeded);

        let mut bad = data.clone();
        bad.push(0);
        assert!(BootMetadata::read_from(&bad, true, 1 << 30).is_err());

        let mut bad = data;
        bad[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert!(BootMetadata::read_from(&bad, true, 1 << 30).is_err());

        Ok(())
    }
}
