//! The staging tree: everything that will ship in the image.
//!
//! The tree is a manifest rather than a directory on disk. Entries name a
//! target path inside the image plus where the content comes from; nothing is
//! copied until the archive builder streams it. This keeps staging free of
//! host-side side effects and makes two trees cheap to compare.
//!
//! Staging is append-only. Adding an entry that is already present with the
//! same content is a no-op (that is what makes collection idempotent);
//! adding a different entry at an occupied path is a [`BuildError::StagingConflict`].

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{BuildError, BuildResult};

/// Where a regular file's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// A file on the build host (absolute host path).
    Host(PathBuf),
    /// Generated content.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File(EntrySource),
    Symlink(PathBuf),
    CharDevice { major: u32, minor: u32 },
}

impl EntryKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Dir => "dir",
            EntryKind::File(_) => "file",
            EntryKind::Symlink(_) => "symlink",
            EntryKind::CharDevice { .. } => "chardev",
        }
    }

    /// File type bits for `st_mode`.
    pub fn type_bits(&self) -> u32 {
        match self {
            EntryKind::Dir => 0o040000,
            EntryKind::File(_) => 0o100000,
            EntryKind::Symlink(_) => 0o120000,
            EntryKind::CharDevice { .. } => 0o020000,
        }
    }
}

/// One path in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    /// Absolute path inside the image.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits only; the type comes from `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl StagedEntry {
    pub fn new(path: impl AsRef<Path>, kind: EntryKind, mode: u32) -> BuildResult<Self> {
        Ok(Self {
            path: normalize(path.as_ref())?,
            kind,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
        })
    }

    pub fn dir(path: impl AsRef<Path>) -> BuildResult<Self> {
        Self::new(path, EntryKind::Dir, 0o755)
    }

    pub fn host_file(path: impl AsRef<Path>, source: impl Into<PathBuf>, mode: u32) -> BuildResult<Self> {
        Self::new(path, EntryKind::File(EntrySource::Host(source.into())), mode)
    }

    pub fn inline(path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>, mode: u32) -> BuildResult<Self> {
        Self::new(path, EntryKind::File(EntrySource::Inline(bytes.into())), mode)
    }

    pub fn symlink(path: impl AsRef<Path>, target: impl Into<PathBuf>) -> BuildResult<Self> {
        Self::new(path, EntryKind::Symlink(target.into()), 0o777)
    }

    pub fn char_device(path: impl AsRef<Path>, major: u32, minor: u32, mode: u32) -> BuildResult<Self> {
        Self::new(path, EntryKind::CharDevice { major, minor }, mode)
    }

    pub fn owned_by(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Full `st_mode` (type bits plus permissions).
    pub fn st_mode(&self) -> u32 {
        self.kind.type_bits() | self.mode
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir)
    }
}

/// Make `path` absolute and lexically clean. `..` is rejected: it could
/// escape the image root.
fn normalize(path: &Path) -> BuildResult<PathBuf> {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(c) => out.push(c),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::Configuration(format!(
                    "image path '{}' must not contain '..'",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// In-progress image contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingTree {
    entries: BTreeMap<PathBuf, StagedEntry>,
}

impl StagingTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, creating missing parent directories.
    ///
    /// Returns `Ok(true)` if the entry is new, `Ok(false)` if an identical
    /// entry was already staged.
    pub fn insert(&mut self, entry: StagedEntry) -> BuildResult<bool> {
        if let Some(parent) = entry.path.parent() {
            self.ensure_dirs(parent)?;
        }
        match self.entries.get(&entry.path) {
            Some(existing) if *existing == entry => Ok(false),
            // A directory created implicitly may be restated with other bits.
            Some(existing) if existing.is_dir() && entry.is_dir() => {
                self.entries.insert(entry.path.clone(), entry);
                Ok(false)
            }
            Some(_) => Err(BuildError::StagingConflict(entry.path)),
            None => {
                self.entries.insert(entry.path.clone(), entry);
                Ok(true)
            }
        }
    }

    /// Add an entry unless something already occupies its path.
    pub fn insert_if_absent(&mut self, entry: StagedEntry) -> BuildResult<bool> {
        if self.entries.contains_key(&entry.path) {
            return Ok(false);
        }
        self.insert(entry)
    }

    fn ensure_dirs(&mut self, dir: &Path) -> BuildResult<()> {
        let mut here = PathBuf::from("/");
        for comp in dir.components().skip(1) {
            here.push(comp);
            match self.entries.get(&here) {
                Some(e) if e.is_dir() => {}
                Some(_) => return Err(BuildError::StagingConflict(here)),
                None => {
                    let entry = StagedEntry::dir(&here)?;
                    self.entries.insert(here.clone(), entry);
                }
            }
        }
        Ok(())
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) -> BuildResult<bool> {
        self.insert(StagedEntry::dir(path)?)
    }

    pub fn add_host_file(
        &mut self,
        path: impl AsRef<Path>,
        source: impl Into<PathBuf>,
        mode: u32,
    ) -> BuildResult<bool> {
        self.insert(StagedEntry::host_file(path, source, mode)?)
    }

    pub fn add_bytes(&mut self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>, mode: u32) -> BuildResult<bool> {
        self.insert(StagedEntry::inline(path, bytes, mode)?)
    }

    pub fn add_symlink(&mut self, path: impl AsRef<Path>, target: impl Into<PathBuf>) -> BuildResult<bool> {
        self.insert(StagedEntry::symlink(path, target)?)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&StagedEntry> {
        self.entries.get(path.as_ref())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.entries.contains_key(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedEntry> {
        self.entries.values()
    }

    /// Stop accepting entries.
    pub fn finalize(self) -> SealedTree {
        SealedTree {
            entries: self.entries.into_values().collect(),
        }
    }
}

/// A finished staging tree. Read-only, entries sorted by path, so every
/// directory precedes its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedTree {
    entries: Vec<StagedEntry>,
}

impl SealedTree {
    pub fn entries(&self) -> &[StagedEntry] {
        &self.entries
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&StagedEntry> {
        let path = path.as_ref();
        self.entries
            .binary_search_by(|e| e.path.as_path().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
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
    fn test_parents_created() {
        let mut tree = StagingTree::new();
        tree.add_bytes("/etc/zboot/version", b"0.1.0".to_vec(), 0o644).unwrap();
        assert!(tree.get("/etc").unwrap().is_dir());
        assert!(tree.get("/etc/zboot").unwrap().is_dir());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_identical_entry_is_noop() {
        let mut tree = StagingTree::new();
        assert!(tree.add_host_file("/bin/busybox", "/bin/busybox", 0o755).unwrap());
        let before = tree.clone();
        assert!(!tree.add_host_file("/bin/busybox", "/bin/busybox", 0o755).unwrap());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_conflicting_entry_rejected() {
        let mut tree = StagingTree::new();
        tree.add_symlink("/bin/sh", "bash").unwrap();
        let err = tree.add_symlink("/bin/sh", "busybox").unwrap_err();
        assert!(matches!(err, BuildError::StagingConflict(p) if p == Path::new("/bin/sh")));
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let mut tree = StagingTree::new();
        tree.add_symlink("/sbin/modprobe", "/bin/kmod").unwrap();
        let applet = StagedEntry::symlink("/sbin/modprobe", "/bin/busybox").unwrap();
        assert!(!tree.insert_if_absent(applet).unwrap());
        assert_eq!(
            tree.get("/sbin/modprobe").unwrap().kind,
            EntryKind::Symlink(PathBuf::from("/bin/kmod"))
        );
    }

    #[test]
    fn test_file_under_file_is_conflict() {
        let mut tree = StagingTree::new();
        tree.add_bytes("/etc/keyfile", b"k".to_vec(), 0o400).unwrap();
        assert!(tree.add_bytes("/etc/keyfile/nested", b"x".to_vec(), 0o644).is_err());
    }

    #[test]
    fn test_relative_and_dotdot_paths() {
        let entry = StagedEntry::dir("lib/modules").unwrap();
        assert_eq!(entry.path, PathBuf::from("/lib/modules"));
        assert!(StagedEntry::dir("/lib/../etc").is_err());
    }

    #[test]
    fn test_sealed_tree_sorted_parents_first() {
        let mut tree = StagingTree::new();
        tree.add_bytes("/usr/lib64/libz.so.1", b"z".to_vec(), 0o755).unwrap();
        tree.add_dir("/dev").unwrap();
        tree.add_bytes("/init", b"i".to_vec(), 0o755).unwrap();
        let sealed = tree.finalize();
        let paths: Vec<&Path> = sealed.entries().iter().map(|e| e.path.as_path()).collect();
        let pos = |p: &str| paths.iter().position(|x| *x == Path::new(p)).unwrap();
        assert!(pos("/usr") < pos("/usr/lib64"));
        assert!(pos("/usr/lib64") < pos("/usr/lib64/libz.so.1"));
        assert!(sealed.get("/init").is_some());
    }

    #[test]
    fn test_st_mode() {
        let dev = StagedEntry::char_device("/dev/console", 5, 1, 0o600).unwrap();
        assert_eq!(dev.st_mode(), 0o020600);
        let link = StagedEntry::symlink("/bin/sh", "bash").unwrap();
        assert_eq!(link.st_mode(), 0o120777);
    }
}
