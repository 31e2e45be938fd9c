//! ELF link metadata: which shared libraries and which program interpreter a
//! file needs.
//!
//! Reads the ELF headers directly (no `ldd`), so inspecting a binary never
//! executes it and works for a host root that is not the running system.

use ::elf::abi;
use ::elf::endian::AnyEndian;
use ::elf::ElfBytes;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Dynamic link requirements of one ELF file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// `PT_INTERP`, e.g. `/lib64/ld-linux-x86-64.so.2`. `None` for shared
    /// libraries and static executables.
    pub interpreter: Option<PathBuf>,
    /// `DT_NEEDED` sonames in file order.
    pub needed: Vec<String>,
}

impl LinkInfo {
    pub fn is_static(&self) -> bool {
        self.interpreter.is_none() && self.needed.is_empty()
    }
}

/// Source of link metadata. The collector only sees this trait, so tests can
/// describe a dependency graph without real binaries.
pub trait LinkInspector {
    /// Returns `Ok(None)` when `path` is not an ELF file (scripts, data).
    fn inspect(&self, path: &Path) -> BuildResult<Option<LinkInfo>>;
}

/// [`LinkInspector`] backed by the `elf` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfInspector;

impl LinkInspector for ElfInspector {
    fn inspect(&self, path: &Path) -> BuildResult<Option<LinkInfo>> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BuildError::MissingFile(path.to_path_buf()),
            _ => BuildError::Io(e),
        })?;
        parse_link_info(&data).map_err(|reason| BuildError::Serialization {
            path: path.to_path_buf(),
            reason,
        })
    }
}

/// Extract interpreter and NEEDED entries from raw file contents.
pub fn parse_link_info(data: &[u8]) -> Result<Option<LinkInfo>, String> {
    if !data.starts_with(ELF_MAGIC) {
        return Ok(None);
    }
    let file = ElfBytes::<AnyEndian>::minimal_parse(data).map_err(|e| e.to_string())?;

    let mut info = LinkInfo::default();

    if let Some(segments) = file.segments() {
        for phdr in segments.iter().filter(|p| p.p_type == abi::PT_INTERP) {
            let raw = file.segment_data(&phdr).map_err(|e| e.to_string())?;
            let interp = raw.split(|b| *b == 0).next().unwrap_or_default();
            if !interp.is_empty() {
                info.interpreter = Some(PathBuf::from(String::from_utf8_lossy(interp).into_owned()));
            }
        }
    }

    let Some(dynamic) = file.dynamic().map_err(|e| e.to_string())? else {
        return Ok(Some(info));
    };
    let offsets: Vec<usize> = dynamic
        .iter()
        .filter(|d| d.d_tag == abi::DT_NEEDED)
        .filter_map(|d| usize::try_from(d.d_val()).ok())
        .collect();
    if offsets.is_empty() {
        return Ok(Some(info));
    }

    let Some((_, strings)) = file.dynamic_symbol_table().map_err(|e| e.to_string())? else {
        return Ok(Some(info));
    };
    for offset in offsets {
        let name = strings.get(offset).map_err(|e| e.to_string())?;
        if !info.needed.iter().any(|n| n == name) {
            info.needed.push(name.to_string());
        }
    }

    Ok(Some(info))
}

/// Directories searched for shared libraries, relative to the host root.
pub const LIBRARY_DIRS: &[&str] = &[
    "lib64",
    "usr/lib64",
    "lib",
    "usr/lib",
    "lib/x86_64-linux-gnu",
    "usr/lib/x86_64-linux-gnu",
    "lib/aarch64-linux-gnu",
    "usr/lib/aarch64-linux-gnu",
];

/// Finds libraries by soname under a host root.
#[derive(Debug, Clone)]
pub struct LibrarySearch {
    root: PathBuf,
    dirs: Vec<PathBuf>,
}

impl LibrarySearch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: LIBRARY_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Add a directory (absolute, image-style) searched after the defaults.
    pub fn with_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let rel = dir.strip_prefix("/").unwrap_or(dir).to_path_buf();
        if !self.dirs.contains(&rel) {
            self.dirs.push(rel);
        }
        self
    }

    /// Image path (`/usr/lib64/libc.so.6`) of the first match for `soname`.
    pub fn find(&self, soname: &str) -> Option<PathBuf> {
        if soname.contains('/') {
            let path = Path::new(soname);
            let rel = path.strip_prefix("/").unwrap_or(path);
            return self
                .root
                .join(rel)
                .symlink_metadata()
                .is_ok()
                .then(|| Path::new("/").join(rel));
        }
        self.dirs
            .iter()
            .map(|dir| dir.join(soname))
            .find(|rel| self.root.join(rel).symlink_metadata().is_ok())
            .map(|rel| Path::new("/").join(rel))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
