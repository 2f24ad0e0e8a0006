// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Selection of a compression method per resource. */

use {
    japp_compression::{compress, CompressContext, CompressionMethod, CompressionResult},
    log::{trace, warn},
};

/// Inputs at or below this size are always stored.
const MIN_COMPRESS_SIZE: usize = 16;

/// Extensions of formats that are already compressed.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "png", "apng", "jpg", "jpeg", "webp", "heic", "heif", "avif", "aac", "flac", "mp3", "mp4",
    "mkv", "webm", "gz", "tgz", "xz", "br", "zst", "bz2", "tbz2",
];

/// Chooses how a resource is stored.
pub trait Compressor {
    /// Encode `data`, the content of resource `path`.
    ///
    /// The returned bytes are what gets stored for `method`.
    fn compress(
        &self,
        path: &str,
        data: &[u8],
        context: &mut CompressContext,
    ) -> CompressionResult<(CompressionMethod, Vec<u8>)>;
}

fn extension(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    file_name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Picks a method from the file name and keeps whatever is smallest.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCompressor;

impl DefaultCompressor {
    fn compress_general(
        &self,
        data: &[u8],
        context: &mut CompressContext,
    ) -> CompressionResult<Option<(CompressionMethod, Vec<u8>)>> {
        let mut best: Option<(CompressionMethod, Vec<u8>)> = None;

        for method in [CompressionMethod::Lz4, CompressionMethod::Fse] {
            if let Some(compressed) = compress(method, data, context)? {
                if best
                    .as_ref()
                    .map_or(true, |(_, current)| compressed.len() < current.len())
                {
                    best = Some((method, compressed));
                }
            }
        }

        Ok(best)
    }
}

impl Compressor for DefaultCompressor {
    fn compress(
        &self,
        path: &str,
        data: &[u8],
        context: &mut CompressContext,
    ) -> CompressionResult<(CompressionMethod, Vec<u8>)> {
        if data.len() <= MIN_COMPRESS_SIZE {
            return Ok((CompressionMethod::None, data.to_vec()));
        }

        let ext = extension(path).map(|ext| ext.to_ascii_lowercase());

        let chosen = match ext.as_deref() {
            Some("class") => match compress(CompressionMethod::Classfile, data, context) {
                Ok(Some(compressed)) => Some((CompressionMethod::Classfile, compressed)),
                Ok(None) => self.compress_general(data, context)?,
                Err(e) => {
                    trace!("{} is not a transformable class file: {}", path, e);
                    self.compress_general(data, context)?
                }
            },
            Some(ext) if COMPRESSED_EXTENSIONS.contains(&ext) => {
                return Ok((CompressionMethod::None, data.to_vec()))
            }
            _ => self.compress_general(data, context)?,
        };

        Ok(match chosen {
            Some((method, compressed)) => {
                trace!(
                    "{}: {} bytes stored as {} ({} bytes)",
                    path,
                    data.len(),
                    method,
                    compressed.len()
                );
                (method, compressed)
            }
            None => {
                warn!(
                    "{} ({} bytes) does not compress; storing uncompressed",
                    path,
                    data.len()
                );
                (CompressionMethod::None, data.to_vec())
            }
        })
    }
}

/// Always uses one method, storing uncompressed when it does not help.
#[derive(Clone, Copy, Debug)]
pub struct ForcedCompressor(pub CompressionMethod);

impl Compressor for ForcedCompressor {
    fn compress(
        &self,
        path: &str,
        data: &[u8],
        context: &mut CompressContext,
    ) -> CompressionResult<(CompressionMethod, Vec<u8>)> {
        match compress(self.0, data, context)? {
            Some(compressed) => Ok((self.0, compressed)),
            None => {
                warn!(
                    "{} does not compress with {}; storing uncompressed",
                    path, self.0
                );
                Ok((CompressionMethod::None, data.to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, japp_compression::ByteArrayPoolBuilder};

    fn text(len: usize) -> Vec<u8> {
        b"lorem ipsum dolor sit amet "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    fn run(compressor: &dyn Compressor, path: &str, data: &[u8]) -> (CompressionMethod, Vec<u8>) {
        let mut pool = ByteArrayPoolBuilder::new();
        let mut context = CompressContext {
            pool: &mut pool,
            lz4_high_compression: true,
        };

        compressor
            .compress(path, data, &mut context)
            .expect("compression should not fail")
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("a/b/c.txt"), Some("txt"));
        assert_eq!(extension("a.d/README"), None);
        assert_eq!(extension("archive.tar.gz"), Some("gz"));
    }

    #[test]
    fn test_small_inputs_stored() {
        let data = text(16);
        assert_eq!(
            run(&DefaultCompressor, "a.txt", &data),
            (CompressionMethod::None, data.clone())
        );
    }

    #[test]
    fn test_compressed_formats_stored() {
        let data = text(4096);
        for path in ["img/logo.PNG", "lib/native.tar.gz", "sound.flac"] {
            assert_eq!(run(&DefaultCompressor, path, &data).0, CompressionMethod::None);
        }
    }

    #[test]
    fn test_text_compresses() {
        let data = text(4096);
        let (method, compressed) = run(&DefaultCompressor, "notes.txt", &data);
        assert!(matches!(method, CompressionMethod::Lz4 | CompressionMethod::Fse));
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_invalid_class_falls_back() {
        let data = text(4096);
        let (method, _) = run(&DefaultCompressor, "org/example/Broken.class", &data);
        assert_ne!(method, CompressionMethod::Classfile);
        assert_ne!(method, CompressionMethod::None);
    }

    #[test]
    fn test_forced() {
        let data = text(4096);
        assert_eq!(
            run(&ForcedCompressor(CompressionMethod::Fse), "x.png", &data).0,
            CompressionMethod::Fse
        );

        let noise = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect::<Vec<_>>();
        assert_eq!(
            run(&ForcedCompressor(CompressionMethod::Lz4), "x.bin", &noise).0,
            CompressionMethod::None
        );
    }
}
