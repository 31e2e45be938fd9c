//! Kernel module dependency resolution.
//!
//! Reads the kernel's own metadata (`modules.dep`, `modules.builtin`,
//! `modules.softdep`) and computes the closure of a requested module list.
//!
//! Module names are normalised the way kmod does it: `dm-crypt` and
//! `dm_crypt` are the same module.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};

/// Metadata files staged next to the modules so `modprobe` works in the image.
/// `modules.dep` is regenerated for the staged subset instead of copied.
pub const MODULE_METADATA_FILES: &[&str] = &[
    "modules.order",
    "modules.builtin",
    "modules.builtin.modinfo",
    "modules.softdep",
];

/// Suffixes a module file may carry.
const MODULE_SUFFIXES: &[&str] = &[".ko.zst", ".ko.xz", ".ko.gz", ".ko"];

/// Normalise a module name (`dm-crypt` -> `dm_crypt`).
pub fn normalize_name(name: &str) -> String {
    name.trim().replace('-', "_")
}

/// Derive a module name from a path such as `kernel/fs/zfs/zfs.ko.xz`.
pub fn module_name_from_path(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    MODULE_SUFFIXES
        .iter()
        .find_map(|suffix| file.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .map(normalize_name)
}

/// One line of `modules.dep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub name: String,
    /// Path relative to `/lib/modules/<kernel>`.
    pub path: PathBuf,
    /// Hard dependencies, by normalised name.
    pub deps: Vec<String>,
}

/// Parsed module metadata for one kernel version.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    kernel: String,
    entries: BTreeMap<String, ModuleEntry>,
    builtin: BTreeSet<String>,
    softdeps: BTreeMap<String, SoftDeps>,
}

/// `pre:` and `post:` lists of one `softdep` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftDeps {
    pub pre: Vec<String>,
    pub post: Vec<String>,
}

impl ModuleIndex {
    /// Load metadata from `/lib/modules/<kernel>` (under the given directory).
    ///
    /// `modules.dep` is mandatory; `modules.builtin` and `modules.softdep`
    /// are used when present.
    pub fn load(modules_dir: &Path, kernel: &str) -> BuildResult<Self> {
        let dep_path = modules_dir.join("modules.dep");
        let dep = fs::read_to_string(&dep_path).map_err(|e| BuildError::MetadataUnavailable {
            path: dep_path.clone(),
            reason: e.to_string(),
        })?;
        let builtin = read_optional(&modules_dir.join("modules.builtin"))?;
        let softdep = read_optional(&modules_dir.join("modules.softdep"))?;
        Ok(Self::parse(kernel, &dep, &builtin, &softdep))
    }

    /// Build an index from metadata file contents.
    pub fn parse(kernel: &str, dep: &str, builtin: &str, softdep: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in dep.lines() {
            let Some((path, deps)) = line.split_once(':') else {
                continue;
            };
            let Some(name) = module_name_from_path(path.trim()) else {
                continue;
            };
            let deps = deps
                .split_whitespace()
                .filter_map(module_name_from_path)
                .collect();
            entries.insert(
                name.clone(),
                ModuleEntry {
                    name,
                    path: PathBuf::from(path.trim()),
                    deps,
                },
            );
        }

        let builtin = builtin
            .lines()
            .filter_map(|l| module_name_from_path(l.trim()))
            .collect();

        Self {
            kernel: kernel.to_string(),
            entries,
            builtin,
            softdeps: parse_softdeps(softdep),
        }
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.entries.get(&normalize_name(name))
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin.contains(&normalize_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some() || self.is_builtin(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the transitive closure of `requested`.
    ///
    /// Breadth-first over hard and soft dependencies, each module visited at
    /// most once, so cycles terminate. The result is a set: request order
    /// does not change it. Soft dependencies widen the closure but are kept
    /// apart from the hard ones.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> BuildResult<ModuleSet> {
        let mut set = ModuleSet::default();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for name in requested {
            let name = normalize_name(name.as_ref());
            if !self.contains(&name) {
                return Err(BuildError::UnknownModule {
                    module: name,
                    kernel: self.kernel.clone(),
                });
            }
            if !set.requested.contains(&name) {
                set.requested.push(name.clone());
            }
            if seen.insert(name.clone()) {
                queue.push_back(name);
            }
        }

        while let Some(name) = queue.pop_front() {
            let Some(entry) = self.entries.get(&name) else {
                // Built into the kernel: nothing to ship, nothing to follow.
                set.modules.insert(
                    name.clone(),
                    ResolvedModule {
                        name,
                        path: None,
                        deps: Vec::new(),
                        soft: SoftDeps::default(),
                    },
                );
                continue;
            };

            for dep in &entry.deps {
                if !self.contains(dep) {
                    return Err(BuildError::UnknownModule {
                        module: dep.clone(),
                        kernel: self.kernel.clone(),
                    });
                }
            }

            // Soft dependencies are best effort: missing ones are skipped.
            let mut soft = SoftDeps::default();
            if let Some(declared) = self.softdeps.get(&name) {
                for (from, into) in [(&declared.pre, &mut soft.pre), (&declared.post, &mut soft.post)] {
                    for dep in from {
                        if self.contains(dep) {
                            into.push(dep.clone());
                        } else {
                            tracing::debug!(module = %name, softdep = %dep, "soft dependency not available");
                        }
                    }
                }
            }

            for dep in entry.deps.iter().chain(&soft.pre).chain(&soft.post) {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }

            set.modules.insert(
                name.clone(),
                ResolvedModule {
                    name,
                    path: Some(entry.path.clone()),
                    deps: entry.deps.clone(),
                    soft,
                },
            );
        }

        Ok(set)
    }
}

/// Resolve `requested` against the metadata of `kernel` under `modules_root`
/// (usually `/lib/modules`).
pub fn resolve<S: AsRef<str>>(
    modules_root: &Path,
    kernel: &str,
    requested: &[S],
) -> BuildResult<ModuleSet> {
    ModuleIndex::load(&modules_root.join(kernel), kernel)?.resolve(requested)
}

fn read_optional(path: &Path) -> BuildResult<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(BuildError::MetadataUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Parse `softdep <module> pre: a b post: c` lines. Names before any
/// `pre:`/`post:` marker count as `pre:`.
fn parse_softdeps(content: &str) -> BTreeMap<String, SoftDeps> {
    let mut softdeps: BTreeMap<String, SoftDeps> = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        if words.next() != Some("softdep") {
            continue;
        }
        let Some(module) = words.next() else {
            continue;
        };
        let deps = softdeps.entry(normalize_name(module)).or_default();
        let mut post = false;
        for word in words {
            match word {
                "pre:" => post = false,
                "post:" => post = true,
                _ => {
                    let dep = normalize_name(word);
                    let list = if post { &mut deps.post } else { &mut deps.pre };
                    if !list.contains(&dep) {
                        list.push(dep);
                    }
                }
            }
        }
    }
    softdeps
}

/// A module in a resolved closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub name: String,
    /// Path relative to the kernel's module directory; `None` for built-ins.
    pub path: Option<PathBuf>,
    /// Hard dependencies, as listed in `modules.dep`.
    pub deps: Vec<String>,
    /// Soft dependencies that are available for this kernel.
    pub soft: SoftDeps,
}

impl ResolvedModule {
    pub fn is_builtin(&self) -> bool {
        self.path.is_none()
    }
}

/// The closure of a module request.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    requested: Vec<String>,
    modules: BTreeMap<String, ResolvedModule>,
}

/// Two sets are equal when they hold the same modules, whatever was asked for.
impl PartialEq for ModuleSet {
    fn eq(&self, other: &Self) -> bool {
        self.modules == other.modules
    }
}

impl Eq for ModuleSet {}

impl ModuleSet {
    /// Names in the closure.
    pub fn closure(&self) -> BTreeSet<String> {
        self.modules.keys().cloned().collect()
    }

    /// Names as originally requested (normalised, deduplicated).
    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedModule> {
        self.modules.get(&normalize_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules that have a file to ship.
    pub fn loadable(&self) -> impl Iterator<Item = &ResolvedModule> {
        self.modules.values().filter(|m| !m.is_builtin())
    }

    /// Loadable modules ordered so every module comes after its hard and
    /// `pre:` dependencies, and before its `post:` ones.
    ///
    /// Depth-first post-order over names in sorted order; a module already on
    /// the stack is not re-entered, so cycles terminate.
    pub fn load_order(&self) -> Vec<&ResolvedModule> {
        fn visit<'a>(
            set: &'a ModuleSet,
            name: &str,
            done: &mut BTreeSet<String>,
            out: &mut Vec<&'a ResolvedModule>,
        ) {
            if !done.insert(name.to_string()) {
                return;
            }
            let Some(module) = set.modules.get(name) else {
                return;
            };
            let mut before: Vec<&String> = module.deps.iter().chain(&module.soft.pre).collect();
            before.sort();
            for dep in before {
                visit(set, dep, done, out);
            }
            if !module.is_builtin() {
                out.push(module);
            }
            for dep in &module.soft.post {
                visit(set, dep, done, out);
            }
        }

        let mut done = BTreeSet::new();
        let mut out = Vec::new();
        for name in self.modules.keys() {
            visit(self, name, &mut done, &mut out);
        }
        out
    }

    /// `modules.dep` restricted to this set (paths relative to the kernel dir).
    /// Only hard dependencies are written; soft ones stay in `modules.softdep`.
    pub fn dep_file(&self) -> String {
        let mut lines: Vec<String> = self
            .loadable()
            .map(|m| {
                let deps: Vec<String> = m
                    .deps
                    .iter()
                    .filter_map(|d| self.modules.get(d))
                    .filter_map(|d| d.path.as_ref())
                    .map(|p| p.display().to_string())
                    .collect();
                let path = m.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
                if deps.is_empty() {
                    format!("{}:", path)
                } else {
                    format!("{}: {}", path, deps.join(" "))
                }
            })
            .collect();
        lines.sort();
        let mut content = lines.join("\n");
        content.push('\n');
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DEP: &str = "\
extra/zfs/zfs.ko.xz: extra/spl/spl.ko.xz
extra/spl/spl.ko.xz:
kernel/drivers/md/dm-crypt.ko.xz: kernel/drivers/md/dm-mod.ko.xz
kernel/drivers/md/dm-mod.ko.xz:
kernel/drivers/nvme/host/nvme.ko: kernel/drivers/nvme/host/nvme-core.ko
kernel/drivers/nvme/host/nvme-core.ko:
kernel/fs/a.ko: kernel/fs/b.ko
kernel/fs/b.ko: kernel/fs/a.ko
";

    const BUILTIN: &str = "kernel/crypto/aes_generic.ko\nkernel/lib/crc32c.ko\n";

    const SOFTDEP: &str = "\
# comment
softdep dm_crypt pre: aes_generic post: missing_mod nvme
";

    fn index() -> ModuleIndex {
        ModuleIndex::parse("6.6.30", DEP, BUILTIN, SOFTDEP)
    }

    #[test]
    fn test_module_name_from_path() {
        assert_eq!(
            module_name_from_path("kernel/drivers/md/dm-crypt.ko.xz"),
            Some("dm_crypt".to_string())
        );
        assert_eq!(module_name_from_path("extra/zfs.ko.zst"), Some("zfs".to_string()));
        assert_eq!(module_name_from_path("README"), None);
    }

    #[test]
    fn test_zfs_pulls_in_spl() {
        let set = index().resolve(&["zfs"]).unwrap();
        let expected: BTreeSet<String> = ["spl", "zfs"].iter().map(|s| s.to_string()).collect();
        assert_eq!(set.closure(), expected);
    }

    #[test]
    fn test_unknown_module_is_error() {
        let err = index().resolve(&["nonexistent"]).unwrap_err();
        assert!(matches!(err, BuildError::UnknownModule { ref module, .. } if module == "nonexistent"));
    }

    #[test]
    fn test_builtin_request_needs_no_file() {
        let set = index().resolve(&["crc32c"]).unwrap();
        assert!(set.contains("crc32c"));
        assert!(set.get("crc32c").unwrap().is_builtin());
        assert_eq!(set.loadable().count(), 0);
    }

    #[test]
    fn test_softdeps_included_missing_ignored() {
        let set = index().resolve(&["dm-crypt"]).unwrap();
        assert!(set.contains("dm_mod"));
        assert!(set.contains("aes_generic"));
        assert!(!set.contains("missing_mod"));
    }

    #[test]
    fn test_parse_softdeps_keeps_pre_and_post_apart() {
        let parsed = parse_softdeps("softdep crc32c pre: crc32c-intel post: crc32c-generic\nsoftdep foo bar\n");
        assert_eq!(parsed["crc32c"].pre, vec!["crc32c_intel"]);
        assert_eq!(parsed["crc32c"].post, vec!["crc32c_generic"]);
        assert_eq!(parsed["foo"].pre, vec!["bar"]);
    }

    #[test]
    fn test_post_softdep_loads_after_module() {
        let set = index().resolve(&["dm-crypt"]).unwrap();
        assert!(set.contains("nvme"));
        assert!(set.contains("nvme_core"));

        let order: Vec<&str> = set.load_order().iter().map(|m| m.name.as_str()).collect();
        let pos = |n: &str| order.iter().position(|m| *m == n).unwrap();
        assert!(pos("dm_mod") < pos("dm_crypt"));
        assert!(pos("dm_crypt") < pos("nvme"));
        assert!(pos("nvme_core") < pos("nvme"));
    }

    #[test]
    fn test_softdeps_not_written_as_hard_dependencies() {
        let set = index().resolve(&["dm-crypt"]).unwrap();
        let dm_crypt = set.get("dm_crypt").unwrap();
        assert_eq!(dm_crypt.deps, vec!["dm_mod"]);
        assert_eq!(dm_crypt.soft.pre, vec!["aes_generic"]);
        assert_eq!(dm_crypt.soft.post, vec!["nvme"]);

        let dep = set.dep_file();
        assert!(dep
            .lines()
            .any(|l| l == "kernel/drivers/md/dm-crypt.ko.xz: kernel/drivers/md/dm-mod.ko.xz"));
    }

    #[test]
    fn test_cycle_terminates() {
        let set = index().resolve(&["a"]).unwrap();
        let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(set.closure(), expected);
        assert_eq!(set.load_order().len(), 2);
    }

    #[test]
    fn test_load_order_puts_dependencies_first() {
        let set = index().resolve(&["zfs", "nvme"]).unwrap();
        let order: Vec<&str> = set.load_order().iter().map(|m| m.name.as_str()).collect();
        let pos = |n: &str| order.iter().position(|m| *m == n).unwrap();
        assert!(pos("spl") < pos("zfs"));
        assert!(pos("nvme_core") < pos("nvme"));
    }

    #[test]
    fn test_dep_file_only_lists_staged_modules() {
        let set = index().resolve(&["dm-crypt"]).unwrap();
        let dep = set.dep_file();
        assert!(dep.contains("kernel/drivers/md/dm-crypt.ko.xz: kernel/drivers/md/dm-mod.ko.xz"));
        assert!(dep.contains("kernel/drivers/md/dm-mod.ko.xz:"));
        assert!(!dep.contains("zfs"));
        assert!(!dep.contains("a.ko"));
    }

    #[test]
    fn test_requested_order_preserved() {
        let set = index().resolve(&["zfs", "dm-crypt", "zfs"]).unwrap();
        assert_eq!(set.requested(), &["zfs".to_string(), "dm_crypt".to_string()]);
    }

    #[test]
    fn test_missing_metadata_is_reported() {
        let err = ModuleIndex::load(Path::new("/nonexistent/modules/6.6.30"), "6.6.30").unwrap_err();
        assert!(matches!(err, BuildError::MetadataUnavailable { .. }));
    }

    fn names() -> impl Strategy<Value = Vec<&'static str>> {
        prop::collection::vec(
            prop::sample::select(vec!["zfs", "spl", "dm-crypt", "nvme", "a", "b", "crc32c"]),
            1..6,
        )
    }

    proptest! {
        #[test]
        fn prop_resolve_is_idempotent(requested in names()) {
            let index = index();
            let once = index.resolve(&requested).unwrap();
            let closure: Vec<String> = once.closure().into_iter().collect();
            let twice = index.resolve(&closure).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_resolve_ignores_request_order(requested in names()) {
            let index = index();
            let forward = index.resolve(&requested).unwrap();
            let mut reversed = requested.clone();
            reversed.reverse();
            let backward = index.resolve(&reversed).unwrap();
            prop_assert_eq!(forward.closure(), backward.closure());
        }
    }
}
