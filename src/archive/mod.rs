//! Archive builder: sealed staging tree to compressed initramfs image.
//!
//! Entries are written in path order with sequential inode numbers and one
//! fixed mtime, so the same tree always produces the same cpio bytes. The
//! image is written to a temporary file next to the output and renamed into
//! place only after compression finished; a failed build leaves no file at
//! the output path.

pub mod compress;
pub mod newc;

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::config::{BuildConfig, Compression};
use crate::error::{BuildError, BuildResult};
use crate::staging::{EntryKind, EntrySource, SealedTree};
use compress::Encoder;
use newc::{Header, NewcWriter};

/// Summary of a written image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub entries: usize,
}

/// Serialize `tree` as an uncompressed newc stream into `out`.
pub fn write_payload<W: Write>(tree: &SealedTree, mtime: u32, out: W) -> BuildResult<W> {
    let mut writer = NewcWriter::new(out);

    for (index, entry) in tree.entries().iter().enumerate() {
        let name = entry.path.to_string_lossy();
        let mut header = Header {
            ino: index as u32 + 1,
            mode: entry.st_mode(),
            uid: entry.uid,
            gid: entry.gid,
            nlink: if entry.is_dir() { 2 } else { 1 },
            mtime,
            ..Header::default()
        };

        match &entry.kind {
            EntryKind::Dir => writer.write_entry(&name, header, &[])?,
            EntryKind::Symlink(target) => {
                writer.write_entry(&name, header, target.as_os_str().as_bytes())?
            }
            EntryKind::CharDevice { major, minor } => {
                header.rdevmajor = *major;
                header.rdevminor = *minor;
                writer.write_entry(&name, header, &[])?
            }
            EntryKind::File(EntrySource::Inline(bytes)) => writer.write_entry(&name, header, bytes)?,
            EntryKind::File(EntrySource::Host(source)) => {
                let unreadable = |e: io::Error| BuildError::Serialization {
                    path: source.clone(),
                    reason: e.to_string(),
                };
                let file = File::open(source).map_err(unreadable)?;
                let len = file.metadata().map_err(unreadable)?.len();
                header.filesize = u32::try_from(len).map_err(|_| BuildError::Serialization {
                    path: source.clone(),
                    reason: format!("{} bytes does not fit a newc entry", len),
                })?;
                writer
                    .write_entry_from(&name, header, file)
                    .map_err(unreadable)?;
            }
        }
    }

    Ok(writer.finish()?)
}

/// The uncompressed payload as bytes.
pub fn payload(tree: &SealedTree, mtime: u32) -> BuildResult<Vec<u8>> {
    write_payload(tree, mtime, Vec::new())
}

/// Serialize and compress `tree` in memory.
pub fn build(tree: &SealedTree, config: &BuildConfig) -> BuildResult<Vec<u8>> {
    encode(tree, config.mtime(), config.compression(), Vec::new())
}

fn encode<W: Write>(tree: &SealedTree, mtime: u32, compression: Compression, out: W) -> BuildResult<W> {
    let compression_failed = |e: io::Error| BuildError::Compression(format!("{}: {}", compression, e));

    let encoder = Encoder::new(out, compression).map_err(compression_failed)?;
    let encoder = match write_payload(tree, mtime, encoder) {
        Ok(encoder) => encoder,
        Err(BuildError::Io(e)) if compression != Compression::None => return Err(compression_failed(e)),
        Err(e) => return Err(e),
    };
    encoder.finish().map_err(compression_failed)
}

/// Write the compressed image to the configured output path atomically and
/// record its SHA-256 next to it (`<output>.sha256`).
pub fn write_image(tree: &SealedTree, config: &BuildConfig) -> BuildResult<ImageInfo> {
    let output = config.output();
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let temp = NamedTempFile::new_in(&dir)?;
    let writer = BufWriter::new(temp);
    let writer = encode(tree, config.mtime(), config.compression(), writer)?;
    let temp = writer.into_inner().map_err(|e| BuildError::Io(e.into_error()))?;
    temp.as_file().sync_all()?;
    temp.persist(output).map_err(|e| BuildError::Io(e.error))?;

    let size = fs::metadata(output)?.len();
    let sha256 = sha256_file(output)?;
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(
        checksum_path(output),
        format!("{}  {}\n", sha256, file_name),
    )?;

    Ok(ImageInfo {
        path: output.to_path_buf(),
        size,
        sha256,
        entries: tree.len(),
    })
}

/// `<image>.sha256`
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}
