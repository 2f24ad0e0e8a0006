// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading of JApp containers.

A container is located from its trailer, the last 64 bytes of the file:

```text
u32  magic ("JAPP")
i16  major version (-1)
u16  minor version (0)
u64  flags, 0
u64  content size, including the trailer
u64  boot metadata offset
u64  launch configuration offset
     24 reserved bytes
```

Offsets are relative to the content start, which is the file size minus
the content size.
*/

use {
    crate::{
        config::ConfigGroup,
        group::{BootMetadata, GroupSet, ResourceGroup},
        resource::Resource,
        serialization::{ByteReader, FILE_MAGIC, MAJOR_VERSION, MINOR_VERSION, TRAILER_SIZE},
        Error, PackedResult,
    },
    anyhow::Context,
    byteorder::{LittleEndian, WriteBytesExt},
    japp_compression::{decompress, xxhash64, CompressionMethod},
    log::{debug, trace},
    once_cell::sync::OnceCell,
    rayon::prelude::*,
    std::{
        borrow::Cow,
        fs::File,
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
        sync::Mutex,
    },
};

/// Bytes read from the end of the file when opening.
const TAIL_WINDOW_SIZE: u64 = 8192;

/// Default ceiling for a metadata region.
pub const DEFAULT_MAX_METADATA_SIZE: u64 = 1 << 30;

/// Default ceiling for the decoded size of a single resource.
pub const DEFAULT_MAX_RESOURCE_SIZE: u64 = 1 << 30;

/// The fixed size record at the end of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    pub major_version: i16,
    pub minor_version: u16,
    pub flags: u64,
    pub content_size: u64,
    pub boot_offset: u64,
    pub launcher_offset: u64,
}

impl Trailer {
    /// Parse and validate a trailer of a file of `file_size` bytes.
    ///
    /// `data` holds the final [TRAILER_SIZE] bytes of the file.
    pub fn parse(data: &[u8], file_size: u64) -> PackedResult<Self> {
        let base = file_size.saturating_sub(TRAILER_SIZE as u64);
        Self::parse_fields(data, file_size).map_err(|e| e.offset_by(base))
    }

    fn parse_fields(data: &[u8], file_size: u64) -> PackedResult<Self> {
        if data.len() != TRAILER_SIZE || file_size < TRAILER_SIZE as u64 {
            return Err(Error::malformed(0, "file too small to hold a trailer"));
        }

        let mut reader = ByteReader::new(data);

        let magic = reader.read_u32("trailer magic")?;
        if magic != FILE_MAGIC {
            return Err(Error::malformed(
                0,
                format!("bad trailer magic 0x{:08x}", magic),
            ));
        }

        let major_version = reader.read_i16("major version")?;
        let minor_version = reader.read_u16("minor version")?;
        if major_version != MAJOR_VERSION || minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "container version {}.{}",
                major_version, minor_version
            )));
        }

        let flags = reader.read_u64("flags")?;
        if flags != 0 {
            return Err(Error::UnsupportedFormat(format!(
                "container flags 0x{:x}",
                flags
            )));
        }

        let content_size = reader.read_u64("content size")?;
        let boot_offset = reader.read_u64("boot metadata offset")?;
        let launcher_offset = reader.read_u64("launch configuration offset")?;

        if content_size < TRAILER_SIZE as u64 || content_size > file_size {
            return Err(Error::malformed(
                16,
                format!(
                    "content size {} does not fit file of {} bytes",
                    content_size, file_size
                ),
            ));
        }

        let trailer_offset = content_size - TRAILER_SIZE as u64;
        if boot_offset < 4 || boot_offset > launcher_offset || launcher_offset > trailer_offset {
            return Err(Error::malformed(
                24,
                format!(
                    "metadata offsets {} and {} are outside the content",
                    boot_offset, launcher_offset
                ),
            ));
        }

        Ok(Self {
            major_version,
            minor_version,
            flags,
            content_size,
            boot_offset,
            launcher_offset,
        })
    }

    /// Offset of the trailer relative to the content start.
    pub fn trailer_offset(&self) -> u64 {
        self.content_size - TRAILER_SIZE as u64
    }

    pub fn write_to<W: Write>(&self, dest: &mut W) -> anyhow::Result<()> {
        dest.write_u32::<LittleEndian>(FILE_MAGIC)
            .context("writing trailer magic")?;
        dest.write_i16::<LittleEndian>(self.major_version)
            .context("writing major version")?;
        dest.write_u16::<LittleEndian>(self.minor_version)
            .context("writing minor version")?;
        dest.write_u64::<LittleEndian>(self.flags)
            .context("writing flags")?;
        dest.write_u64::<LittleEndian>(self.content_size)
            .context("writing content size")?;
        dest.write_u64::<LittleEndian>(self.boot_offset)
            .context("writing boot metadata offset")?;
        dest.write_u64::<LittleEndian>(self.launcher_offset)
            .context("writing launch configuration offset")?;
        dest.write_all(&[0; 24]).context("writing reserved")?;

        Ok(())
    }
}

/// How resource bytes are obtained from the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Map the whole file into memory.
    Mapped,
    /// Seek and read through a shared file handle.
    PositionedRead,
}

/// Settings for [JAppReader].
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    pub access: AccessMode,
    /// Metadata regions larger than this are refused.
    pub max_metadata_size: u64,
    /// Resources that decode to more than this are refused.
    pub max_resource_size: u64,
    /// Check resource checksums on first read.
    pub verify_checksums: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            access: AccessMode::Mapped,
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
            verify_checksums: true,
        }
    }
}

impl ReaderOptions {
    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn max_metadata_size(mut self, size: u64) -> Self {
        self.max_metadata_size = size;
        self
    }

    pub fn max_resource_size(mut self, size: u64) -> Self {
        self.max_resource_size = size;
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
}

enum Source {
    Mapped(memmap2::Mmap),
    File(Mutex<File>),
}

/// An open container.
///
/// All methods take `&self`; a reader can be shared between threads.
pub struct JAppReader {
    source: Source,
    options: ReaderOptions,
    trailer: Trailer,
    /// Absolute offset of the content start.
    base: u64,
    /// The last bytes of the file, read when opening.
    tail: Vec<u8>,
    tail_start: u64,
    boot: OnceCell<BootMetadata>,
    config: OnceCell<ConfigGroup>,
}

impl JAppReader {
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> PackedResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < TRAILER_SIZE as u64 {
            return Err(Error::malformed(
                0,
                format!("file of {} bytes cannot hold a trailer", file_size),
            ));
        }

        let tail_len = file_size.min(TAIL_WINDOW_SIZE);
        let tail_start = file_size - tail_len;
        let mut tail = vec![0; tail_len as usize];
        file.seek(SeekFrom::Start(tail_start))?;
        file.read_exact(&mut tail)?;

        let trailer = Trailer::parse(&tail[tail.len() - TRAILER_SIZE..], file_size)?;
        let base = file_size - trailer.content_size;

        let source = match options.access {
            // Containers are never modified in place.
            AccessMode::Mapped => Source::Mapped(unsafe { memmap2::Mmap::map(&file) }?),
            AccessMode::PositionedRead => Source::File(Mutex::new(file)),
        };

        let reader = Self {
            source,
            options,
            trailer,
            base,
            tail,
            tail_start,
            boot: OnceCell::new(),
            config: OnceCell::new(),
        };

        if reader.read_at(base, 4)?.as_ref() != &FILE_MAGIC.to_le_bytes()[..] {
            return Err(Error::malformed(base, "content does not start with JAPP magic"));
        }

        debug!(
            "opened {}: {} bytes, content at {}, boot metadata at {}, launch configuration at {}",
            path.display(),
            file_size,
            base,
            trailer.boot_offset,
            trailer.launcher_offset
        );

        Ok(reader)
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    /// Absolute offset of the content start, the length of any stub.
    pub fn content_start(&self) -> u64 {
        self.base
    }

    /// Read `len` bytes at absolute file offset `offset`.
    fn read_at(&self, offset: u64, len: usize) -> PackedResult<Cow<'_, [u8]>> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::malformed(offset, "read past end of file"))?;

        if offset >= self.tail_start {
            let start = (offset - self.tail_start) as usize;
            return self
                .tail
                .get(start..start + len)
                .map(Cow::Borrowed)
                .ok_or_else(|| Error::malformed(offset, "read past end of file"));
        }

        match &self.source {
            Source::Mapped(map) => map
                .get(offset as usize..end as usize)
                .map(Cow::Borrowed)
                .ok_or_else(|| Error::malformed(offset, "read past end of file")),
            Source::File(file) => {
                let mut buffer = vec![0; len];
                {
                    let mut file = file.lock().map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "container file lock poisoned",
                        ))
                    })?;
                    file.seek(SeekFrom::Start(offset))?;
                    file.read_exact(&mut buffer)?;
                }

                Ok(Cow::Owned(buffer))
            }
        }
    }

    /// Read a metadata region given offsets relative to the content start.
    fn read_region(&self, start: u64, end: u64, what: &'static str) -> PackedResult<Cow<'_, [u8]>> {
        let size = end - start;
        if size > self.options.max_metadata_size {
            return Err(Error::CapacityExceeded {
                what,
                size,
                limit: self.options.max_metadata_size,
            });
        }

        self.read_at(self.base + start, size as usize)
    }

    /// Resource groups and the byte array pool, parsed on first use.
    pub fn boot_metadata(&self) -> PackedResult<&BootMetadata> {
        self.boot.get_or_try_init(|| {
            let start = self.trailer.boot_offset;
            let data = self.read_region(start, self.trailer.launcher_offset, "boot metadata")?;

            BootMetadata::read_from(
                &data,
                self.options.verify_checksums,
                self.options.max_metadata_size,
            )
            .map_err(|e| e.offset_by(self.base + start))
        })
    }

    /// Root of the launch configuration tree, parsed on first use.
    pub fn config(&self) -> PackedResult<&ConfigGroup> {
        self.config.get_or_try_init(|| {
            let start = self.trailer.launcher_offset;
            let data = self.read_region(
                start,
                self.trailer.trailer_offset(),
                "launch configuration",
            )?;

            let mut reader = ByteReader::new(&data);
            let config =
                ConfigGroup::read_from(&mut reader).map_err(|e| e.offset_by(self.base + start))?;

            if !reader.is_empty() {
                return Err(Error::malformed(
                    self.base + start + reader.position() as u64,
                    "trailing bytes after launch configuration",
                ));
            }

            Ok(config)
        })
    }

    pub fn groups(&self) -> PackedResult<&[ResourceGroup]> {
        Ok(&self.boot_metadata()?.groups)
    }

    pub fn group(&self, index: u32) -> PackedResult<Option<&ResourceGroup>> {
        Ok(self.boot_metadata()?.groups.get(index as usize))
    }

    /// Find resource `path` in group `group`.
    pub fn find(&self, group: u32, path: &str) -> PackedResult<Option<&Resource>> {
        Ok(self.group(group)?.and_then(|g| g.get(path)))
    }

    /// Find resource `path` as seen by a runtime at `release`.
    pub fn find_for_release(
        &self,
        set: &GroupSet,
        path: &str,
        release: i32,
    ) -> PackedResult<Option<&Resource>> {
        let groups = &self.boot_metadata()?.groups;

        Ok(set.resolve(release, |index| groups.get(index as usize)?.get(path)))
    }

    /// Obtain the content of `resource`.
    ///
    /// The checksum is verified on the first read of each resource when
    /// checksum verification is enabled.
    pub fn read(&self, resource: &Resource) -> PackedResult<Vec<u8>> {
        self.read_resource(resource, self.options.verify_checksums)
    }

    fn read_resource(&self, resource: &Resource, verify: bool) -> PackedResult<Vec<u8>> {
        let end = resource
            .offset
            .checked_add(resource.compressed_size as u64)
            .filter(|end| resource.offset >= 4 && *end <= self.trailer.boot_offset)
            .ok_or_else(|| {
                Error::malformed(
                    self.base.saturating_add(resource.offset),
                    format!("resource {} lies outside the data region", resource.name),
                )
            })?;

        if resource.size as u64 > self.options.max_resource_size {
            return Err(Error::CapacityExceeded {
                what: "resource",
                size: resource.size as u64,
                limit: self.options.max_resource_size,
            });
        }

        let absolute = self.base + resource.offset;
        let stored = self.read_at(absolute, (end - resource.offset) as usize)?;

        let data = match resource.method {
            CompressionMethod::None => stored.into_owned(),
            method => {
                let pool = &self.boot_metadata()?.pool;
                decompress(method, &stored, resource.size as usize, pool)
                    .map_err(|e| Error::from(e).offset_by(absolute))?
            }
        };

        trace!(
            "read {} ({} bytes stored as {}, {} bytes)",
            resource.name,
            data.len(),
            resource.method,
            resource.compressed_size
        );

        if verify && !resource.is_verified() {
            if let Some(expected) = resource.checksum {
                let actual = xxhash64(&data);
                if actual != expected {
                    return Err(Error::malformed(
                        absolute,
                        format!(
                            "checksum mismatch for {} (expected={:x}, actual={:x})",
                            resource.name, expected, actual
                        ),
                    ));
                }
            }
            resource.mark_verified();
        }

        Ok(data)
    }

    /// Read and checksum every resource, in parallel.
    ///
    /// Returns the number of resources carrying a checksum.
    pub fn verify_all(&self) -> PackedResult<usize> {
        let resources = self
            .groups()?
            .iter()
            .flat_map(|group| group.iter())
            .collect::<Vec<_>>();

        resources
            .par_iter()
            .try_for_each(|resource| self.read_resource(resource, true).map(|_| ()))?;

        let count = resources.iter().filter(|r| r.checksum.is_some()).count();
        debug!("verified {} of {} resources", count, resources.len());

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::{Reference, RuntimeContext},
            writer::{JAppWriter, ResourceTimes, WriterOptions},
            ErrorKind,
        },
        std::path::PathBuf,
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn text(seed: usize, len: usize) -> Vec<u8> {
        let mut data = vec![];
        let mut i = seed;
        while data.len() < len {
            data.extend_from_slice(format!("line {} of resource {}\n", i, seed).as_bytes());
            i += 1;
        }
        data.truncate(len);
        data
    }

    /// A small class file: `org/example/Main` with a few string constants.
    fn class_file() -> Vec<u8> {
        fn utf8(constants: &mut Vec<u8>, text: &str) {
            constants.push(1);
            constants.extend_from_slice(&(text.len() as u16).to_be_bytes());
            constants.extend_from_slice(text.as_bytes());
        }

        let mut constants = vec![];

        // #1..#4: this and super class.
        utf8(&mut constants, "org/example/Main");
        constants.extend_from_slice(&[7, 0, 1]);
        utf8(&mut constants, "java/lang/Object");
        constants.extend_from_slice(&[7, 0, 3]);

        // #5..#20: string constants.
        for i in 0..8u16 {
            utf8(&mut constants, &format!("greeting number {} from the example", i));
            constants.push(8);
            constants.extend_from_slice(&(5 + 2 * i).to_be_bytes());
        }

        let mut class = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 61, 0, 21];
        class.extend_from_slice(&constants);
        for value in [0x21u16, 2, 4, 0, 0, 0, 0] {
            class.extend_from_slice(&value.to_be_bytes());
        }
        class
    }

    fn write_container(dir: &Path, options: WriterOptions) -> anyhow::Result<PathBuf> {
        let mut writer = JAppWriter::new(Vec::new(), options)?;

        let app = writer.add_group()?;
        writer.add_resource(
            app,
            "a.txt",
            &text(1, 5000),
            ResourceTimes {
                creation: Some(1_000),
                last_modified: Some(2_000),
                last_access: None,
            },
        )?;
        writer.add_resource(app, "tiny.txt", b"tiny", ResourceTimes::default())?;
        writer.add_resource(app, "empty", b"", ResourceTimes::default())?;
        writer.add_resource(app, "image.png", &text(2, 3000), ResourceTimes::default())?;
        writer.add_resource(
            app,
            "org/example/Main.class",
            &class_file(),
            ResourceTimes::default(),
        )?;

        let override17 = writer.add_group()?;
        writer.add_resource(override17, "a.txt", b"override for 17", ResourceTimes::default())?;

        let mut set = GroupSet::new(app);
        set.add_release(17, override17)?;
        writer.config_mut().main_class = Some("org.example.Main".to_string());
        writer.config_mut().class_path.push(Reference::Local {
            name: Some("app".to_string()),
            groups: set,
        });

        let data = writer.finish()?;
        let path = dir.join("app.japp");
        std::fs::write(&path, data)?;

        Ok(path)
    }

    #[test]
    fn test_round_trip_both_modes() -> anyhow::Result<()> {
        init_logging();
        let dir = tempfile::tempdir()?;
        let path = write_container(dir.path(), WriterOptions::default())?;

        for access in [AccessMode::Mapped, AccessMode::PositionedRead] {
            let reader = JAppReader::open(&path, ReaderOptions::default().access(access))?;
            assert_eq!(reader.content_start(), 0);

            let a = reader.find(0, "a.txt")?.expect("a.txt present");
            assert_ne!(a.method, CompressionMethod::None);
            assert_eq!(reader.read(a)?, text(1, 5000));
            assert!(a.is_verified());
            assert_eq!(a.creation_time, Some(1_000));
            assert_eq!(a.effective_last_access_time(), Some(2_000));

            let png = reader.find(0, "image.png")?.expect("image.png present");
            assert_eq!(png.method, CompressionMethod::None);
            assert_eq!(reader.read(png)?, text(2, 3000));

            let class = reader
                .find(0, "org/example/Main.class")?
                .expect("class present");
            assert_eq!(class.method, CompressionMethod::Classfile);
            assert_eq!(reader.read(class)?, class_file());
            assert!(!reader.boot_metadata()?.pool.is_empty());

            assert_eq!(reader.read(reader.find(0, "tiny.txt")?.expect("tiny"))?, b"tiny");
            assert!(reader.read(reader.find(0, "empty")?.expect("empty"))?.is_empty());
            assert!(reader.find(0, "missing")?.is_none());
            assert!(reader.find(7, "a.txt")?.is_none());

            let config = reader.config()?;
            assert_eq!(config.main_class.as_deref(), Some("org.example.Main"));

            let launch = config.resolve(
                &RuntimeContext::new("linux", "x86_64", None, 17),
                &|_: &str, _: &RuntimeContext| true,
            );
            let set = match &launch.class_path[0] {
                Reference::Local { groups, .. } => groups.clone(),
                Reference::External { .. } => panic!("expected a local reference"),
            };

            let newer = reader.find_for_release(&set, "a.txt", 21)?.expect("override");
            assert_eq!(reader.read(newer)?, b"override for 17");
            let older = reader.find_for_release(&set, "a.txt", 11)?.expect("base");
            assert_eq!(older.size, 5000);
            let fallback = reader
                .find_for_release(&set, "tiny.txt", 21)?
                .expect("base entry");
            assert_eq!(fallback.size, 4);

            assert_eq!(reader.verify_all()?, 6);
        }

        Ok(())
    }

    #[test]
    fn test_repeated_byte_resource() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = JAppWriter::new(
            Vec::new(),
            WriterOptions {
                method: Some(CompressionMethod::Lz4),
                ..Default::default()
            },
        )?;
        let group = writer.add_group()?;
        writer.add_resource(group, "a.txt", &vec![0x41; 100_000], ResourceTimes::default())?;

        let path = dir.path().join("a.japp");
        std::fs::write(&path, writer.finish()?)?;

        let reader = JAppReader::open(&path, ReaderOptions::default())?;
        let resource = reader.find(group, "a.txt")?.expect("a.txt present");
        assert_eq!(resource.method, CompressionMethod::Lz4);
        assert!(resource.compressed_size < 1000);
        assert!(resource.checksum.is_some());

        let data = reader.read(resource)?;
        assert_eq!(data.len(), 100_000);
        assert!(data.iter().all(|b| *b == 0x41));
        assert!(resource.is_verified());

        Ok(())
    }

    #[test]
    fn test_stub_prefix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let stub = b"#!/bin/sh\nexit 1\n".to_vec();
        let path = write_container(
            dir.path(),
            WriterOptions {
                stub: Some(stub.clone()),
                ..Default::default()
            },
        )?;

        let reader = JAppReader::open(&path, ReaderOptions::default())?;
        assert_eq!(reader.content_start(), stub.len() as u64);
        let a = reader.find(0, "a.txt")?.expect("a.txt present");
        assert_eq!(reader.read(a)?, text(1, 5000));

        // An offset at the end of the address space lies outside the data.
        let far = Resource::new("far", CompressionMethod::None, 3, 3, u64::MAX - 1);
        assert_eq!(reader.read(&far).unwrap_err().kind(), ErrorKind::MalformedData);

        Ok(())
    }

    #[test]
    fn test_concurrent_reads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = JAppWriter::new(Vec::new(), WriterOptions::default())?;
        let group = writer.add_group()?;
        for i in 0..64 {
            writer.add_resource(
                group,
                &format!("res/{}.txt", i),
                &text(i, 2000 + i * 37),
                ResourceTimes::default(),
            )?;
        }
        let path = dir.path().join("many.japp");
        std::fs::write(&path, writer.finish()?)?;

        for access in [AccessMode::Mapped, AccessMode::PositionedRead] {
            let reader = JAppReader::open(&path, ReaderOptions::default().access(access))?;

            (0..64usize)
                .into_par_iter()
                .flat_map(|i| vec![i; 4])
                .try_for_each(|i| -> PackedResult<()> {
                    let resource = reader
                        .find(group, &format!("res/{}.txt", i))?
                        .ok_or_else(|| Error::malformed(0, "missing resource"))?;
                    assert_eq!(reader.read(resource)?, text(i, 2000 + i * 37));
                    Ok(())
                })?;
        }

        Ok(())
    }

    #[test]
    fn test_corrupt_resource_detected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_container(dir.path(), WriterOptions::default())?;

        let mut data = std::fs::read(&path)?;
        // image.png is stored verbatim; damage one of its bytes.
        let offset = {
            let reader = JAppReader::open(&path, ReaderOptions::default())?;
            let png = reader.find(0, "image.png")?.expect("image.png present");
            png.offset as usize + 10
        };
        data[offset] ^= 0xff;
        std::fs::write(&path, &data)?;

        let reader = JAppReader::open(&path, ReaderOptions::default())?;
        let png = reader.find(0, "image.png")?.expect("image.png present");
        assert_eq!(reader.read(png).unwrap_err().kind(), ErrorKind::MalformedData);
        assert!(reader.verify_all().is_err());

        let reader = JAppReader::open(&path, ReaderOptions::default().verify_checksums(false))?;
        let png = reader.find(0, "image.png")?.expect("image.png present");
        assert_eq!(reader.read(png)?.len(), 3000);

        Ok(())
    }

    fn container_bytes() -> anyhow::Result<Vec<u8>> {
        let mut writer = JAppWriter::new(Vec::new(), WriterOptions::default())?;
        let group = writer.add_group()?;
        writer.add_resource(group, "x.txt", &text(3, 100), ResourceTimes::default())?;
        writer.finish()
    }

    fn open_bytes(data: &[u8]) -> PackedResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.japp");
        std::fs::write(&path, data)?;

        let reader = JAppReader::open(&path, ReaderOptions::default())?;
        reader.boot_metadata()?;
        reader.config()?;

        Ok(())
    }

    #[test]
    fn test_malformed_containers() -> anyhow::Result<()> {
        let data = container_bytes()?;
        let len = data.len();
        assert!(open_bytes(&data).is_ok());

        assert_eq!(
            open_bytes(&data[..20]).err().map(|e| e.kind()),
            Some(ErrorKind::MalformedData)
        );

        let mut bad = data.clone();
        bad[len - 64] = b'X';
        assert_eq!(
            open_bytes(&bad).err().map(|e| e.kind()),
            Some(ErrorKind::MalformedData)
        );

        // Future major version.
        let mut bad = data.clone();
        bad[len - 60..len - 58].copy_from_slice(&1i16.to_le_bytes());
        assert_eq!(
            open_bytes(&bad).err().map(|e| e.kind()),
            Some(ErrorKind::UnsupportedFormat)
        );

        // Reserved flags.
        let mut bad = data.clone();
        bad[len - 56] = 1;
        assert!(open_bytes(&bad).is_err());

        // Content size larger than the file.
        let mut bad = data.clone();
        bad[len - 48..len - 40].copy_from_slice(&(len as u64 + 1).to_le_bytes());
        assert!(open_bytes(&bad).is_err());

        // Boot metadata after the launch configuration.
        let mut bad = data.clone();
        bad[len - 40..len - 32].copy_from_slice(&(len as u64).to_le_bytes());
        assert!(open_bytes(&bad).is_err());

        // Content magic damaged.
        let mut bad = data.clone();
        bad[0] = 0;
        assert!(open_bytes(&bad).is_err());

        // Boot metadata magic damaged.
        let boot_offset = Trailer::parse(&data[len - 64..], len as u64)?.boot_offset as usize;
        let mut bad = data.clone();
        bad[boot_offset] ^= 0xff;
        assert_eq!(
            open_bytes(&bad).err().map(|e| e.kind()),
            Some(ErrorKind::MalformedData)
        );

        Ok(())
    }

    #[test]
    fn test_metadata_ceiling() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_container(dir.path(), WriterOptions::default())?;

        let reader = JAppReader::open(&path, ReaderOptions::default().max_metadata_size(8))?;
        assert_eq!(
            reader.boot_metadata().err().map(|e| e.kind()),
            Some(ErrorKind::CapacityExceeded)
        );

        Ok(())
    }

    #[test]
    fn test_resource_ceiling() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_container(dir.path(), WriterOptions::default())?;

        let reader = JAppReader::open(&path, ReaderOptions::default().max_resource_size(4096))?;
        let a = reader.find(0, "a.txt")?.expect("a.txt present");
        assert_eq!(reader.read(a).unwrap_err().kind(), ErrorKind::CapacityExceeded);
        assert!(reader.verify_all().is_err());

        let png = reader.find(0, "image.png")?.expect("image.png present");
        assert_eq!(reader.read(png)?, text(2, 3000));

        // A size field claiming far more than the stored bytes can hold.
        let claimed = Resource::new("big", CompressionMethod::Lz4, u32::MAX, 1, a.offset);
        assert_eq!(
            JAppReader::open(&path, ReaderOptions::default())?
                .read(&claimed)
                .unwrap_err()
                .kind(),
            ErrorKind::CapacityExceeded
        );

        Ok(())
    }
}
