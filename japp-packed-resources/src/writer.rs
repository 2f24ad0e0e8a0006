// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing of JApp containers. */

use {
    crate::{
        compressor::{Compressor, DefaultCompressor, ForcedCompressor},
        config::ConfigGroup,
        group::{write_boot_metadata, ResourceGroup},
        reader::Trailer,
        resource::Resource,
        serialization::{FILE_MAGIC, MAJOR_VERSION, MINOR_VERSION, TRAILER_SIZE},
    },
    anyhow::{anyhow, Context, Result},
    byteorder::{LittleEndian, WriteBytesExt},
    japp_compression::{xxhash64, ByteArrayPoolBuilder, CompressContext, CompressionMethod},
    log::debug,
    std::{
        convert::TryFrom,
        io::Write,
        path::Path,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Settings for [JAppWriter].
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Use the slower, denser LZ4 match finder.
    pub lz4_high_compression: bool,

    /// Resource group bodies smaller than this are never compressed.
    pub group_compression_threshold: usize,

    /// Bytes written before the container content, e.g. a launcher script.
    pub stub: Option<Vec<u8>>,

    /// Use this method for every resource instead of choosing per file.
    pub method: Option<CompressionMethod>,

    /// Record an XxHash64 checksum of every resource.
    pub checksums: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            lz4_high_compression: true,
            group_compression_threshold: 16,
            stub: None,
            method: None,
            checksums: true,
        }
    }
}

/// Timestamps recorded for a resource, in milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceTimes {
    pub creation: Option<i64>,
    pub last_modified: Option<i64>,
    pub last_access: Option<i64>,
}

fn system_time_millis(time: std::io::Result<SystemTime>) -> Option<i64> {
    let time = time.ok()?;

    Some(match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).ok()?,
        Err(before) => -i64::try_from(before.duration().as_millis()).ok()?,
    })
}

impl ResourceTimes {
    /// Obtain the times of a filesystem entry. Times the platform does not
    /// report are left empty.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            creation: system_time_millis(metadata.created()),
            last_modified: system_time_millis(metadata.modified()),
            last_access: system_time_millis(metadata.accessed()),
        }
    }
}

/// Produces a container.
///
/// Resources are written as they are added. Metadata and the trailer are
/// written by [JAppWriter::finish].
pub struct JAppWriter<W: Write> {
    dest: W,
    options: WriterOptions,
    compressor: Box<dyn Compressor>,
    /// Bytes written since the start of the content.
    position: u64,
    pool: ByteArrayPoolBuilder,
    groups: Vec<ResourceGroup>,
    config: ConfigGroup,
}

impl<W: Write> JAppWriter<W> {
    /// Start a container, writing the stub and content magic.
    pub fn new(mut dest: W, options: WriterOptions) -> Result<Self> {
        if let Some(stub) = &options.stub {
            dest.write_all(stub).context("writing stub")?;
        }

        dest.write_u32::<LittleEndian>(FILE_MAGIC)
            .context("writing content magic")?;

        let compressor: Box<dyn Compressor> = match options.method {
            Some(method) => Box::new(ForcedCompressor(method)),
            None => Box::new(DefaultCompressor),
        };

        Ok(Self {
            dest,
            options,
            compressor,
            position: 4,
            pool: ByteArrayPoolBuilder::new(),
            groups: vec![],
            config: ConfigGroup::new(),
        })
    }

    /// Replace the per resource compression policy.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.compressor = compressor;
    }

    /// Start a new, empty resource group and return its index.
    pub fn add_group(&mut self) -> Result<u32> {
        let index = u32::try_from(self.groups.len()).context("too many resource groups")?;
        self.groups.push(ResourceGroup::new());

        Ok(index)
    }

    pub fn group(&self, index: u32) -> Option<&ResourceGroup> {
        self.groups.get(index as usize)
    }

    /// Root of the launch configuration tree.
    pub fn config_mut(&mut self) -> &mut ConfigGroup {
        &mut self.config
    }

    pub fn set_config(&mut self, config: ConfigGroup) {
        self.config = config;
    }

    /// Compress and write `data` as resource `path` of `group`.
    pub fn add_resource(
        &mut self,
        group: u32,
        path: &str,
        data: &[u8],
        times: ResourceTimes,
    ) -> Result<&Resource> {
        if group as usize >= self.groups.len() {
            return Err(anyhow!("resource group {} does not exist", group));
        }
        if self.groups[group as usize].get(path).is_some() {
            return Err(anyhow!("duplicate resource {} in group {}", path, group));
        }

        let size = u32::try_from(data.len())
            .map_err(|_| anyhow!("resource {} is too large ({} bytes)", path, data.len()))?;

        let mut context = CompressContext {
            pool: &mut self.pool,
            lz4_high_compression: self.options.lz4_high_compression,
        };
        let (method, stored) = self
            .compressor
            .compress(path, data, &mut context)
            .with_context(|| format!("compressing {}", path))?;

        let compressed_size = u32::try_from(stored.len())
            .map_err(|_| anyhow!("stored form of {} is too large", path))?;

        let mut resource = Resource::new(path, method, size, compressed_size, self.position);
        if self.options.checksums {
            resource.checksum = Some(xxhash64(data));
        }
        resource.creation_time = times.creation;
        resource.last_modified_time = times.last_modified;
        resource.last_access_time = times.last_access;

        self.dest
            .write_all(&stored)
            .with_context(|| format!("writing resource {}", path))?;
        self.position += stored.len() as u64;

        let group = &mut self.groups[group as usize];
        group.insert(resource);

        group
            .get(path)
            .ok_or_else(|| anyhow!("resource {} vanished after insertion", path))
    }

    /// Add the file at `source` as resource `path`, recording its timestamps.
    pub fn add_file(&mut self, group: u32, path: &str, source: &Path) -> Result<&Resource> {
        let metadata = std::fs::metadata(source)
            .with_context(|| format!("reading metadata of {}", source.display()))?;
        let data =
            std::fs::read(source).with_context(|| format!("reading {}", source.display()))?;

        self.add_resource(group, path, &data, ResourceTimes::from_metadata(&metadata))
    }

    /// Write metadata regions and the trailer, returning the destination.
    pub fn finish(mut self) -> Result<W> {
        let boot_offset = self.position;

        let mut boot = vec![];
        write_boot_metadata(
            &mut boot,
            &self
                .pool
                .to_block()
                .context("serializing byte array pool")?,
            &self.groups,
            self.options.group_compression_threshold,
        )?;
        self.dest
            .write_all(&boot)
            .context("writing boot metadata")?;
        self.position += boot.len() as u64;

        let launcher_offset = self.position;

        let mut config = vec![];
        self.config.write_to(&mut config)?;
        self.dest
            .write_all(&config)
            .context("writing launch configuration")?;
        self.position += config.len() as u64;

        let trailer = Trailer {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            flags: 0,
            content_size: self.position + TRAILER_SIZE as u64,
            boot_offset,
            launcher_offset,
        };
        trailer.write_to(&mut self.dest)?;

        debug!(
            "wrote container: {} groups, {} pooled strings, boot metadata at {} ({} bytes), \
             launch configuration at {} ({} bytes), {} content bytes",
            self.groups.len(),
            self.pool.len(),
            boot_offset,
            boot.len(),
            launcher_offset,
            config.len(),
            trailer.content_size
        );

        self.dest.flush().context("flushing container")?;

        Ok(self.dest)
    }
}
