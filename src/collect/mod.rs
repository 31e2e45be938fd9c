//! Archive content collector.
//!
//! Fills a [`StagingTree`] with everything the image needs: the init, the
//! base and feature tool sets, udev, firmware, kernel modules, and the full
//! shared library closure of every ELF file staged. All sources are read
//! relative to the configured host root.
//!
//! Collection only adds entries, and adding an identical entry twice is a
//! no-op, so collecting into an already collected tree changes nothing.

pub mod layout;

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::{BuildConfig, Feature, KeymapSource};
use crate::elf::{ElfInspector, LibrarySearch, LinkInspector};
use crate::error::{BuildError, BuildResult};
use crate::manifest::{self, BootManifest, ModuleLoad};
use crate::modules::{ModuleSet, MODULE_METADATA_FILES};
use crate::process::Cmd;
use crate::staging::{EntryKind, EntrySource, StagedEntry, StagingTree};

/// Where `loadkeys` may live on the host, in order of preference.
pub const LOADKEYS_PATHS: &[&str] = &["/usr/bin/loadkeys", "/bin/loadkeys"];

/// What a collection run did.
#[derive(Debug, Clone)]
pub struct CollectReport {
    /// Non-fatal problems (missing optional files, keymap dump failure).
    pub warnings: Vec<String>,
    /// ELF executables whose dependencies were followed.
    pub executables: usize,
    /// Shared libraries pulled in by dependency resolution.
    pub libraries: usize,
    /// Kernel module files staged.
    pub modules: usize,
    /// The manifest written to the image.
    pub manifest: BootManifest,
}

/// Collect everything for `config` into `tree`, inspecting ELF files on disk.
pub fn collect(
    tree: &mut StagingTree,
    modules: &ModuleSet,
    config: &BuildConfig,
) -> BuildResult<CollectReport> {
    Collector::new(config, ElfInspector).collect(tree, modules)
}

pub struct Collector<'a, I: LinkInspector> {
    config: &'a BuildConfig,
    inspector: I,
    search: LibrarySearch,
    warnings: Vec<String>,
}

impl<'a, I: LinkInspector> Collector<'a, I> {
    pub fn new(config: &'a BuildConfig, inspector: I) -> Self {
        let sys = &config.settings().system_directory;
        let search = LibrarySearch::new(config.host_root())
            .with_dir(&sys.lib64)
            .with_dir(&sys.lib);
        Self {
            config,
            inspector,
            search,
            warnings: Vec::new(),
        }
    }

    pub fn collect(mut self, tree: &mut StagingTree, modules: &ModuleSet) -> BuildResult<CollectReport> {
        let config = self.config;
        let settings = config.settings();

        self.stage_layout(tree)?;

        let init = config.init_binary();
        if !init.exists() {
            return Err(BuildError::MissingFile(init.to_path_buf()));
        }
        self.stage_file(tree, Path::new("/init"), init)?;

        for file in &settings.base.files {
            if *file == settings.base.udev_path {
                continue;
            }
            self.stage_required(tree, file)?;
        }
        let udevd = self.host(&settings.base.udev_path);
        if !udevd.exists() {
            return Err(BuildError::MissingFile(settings.base.udev_path.clone()));
        }
        self.stage_file(tree, Path::new(manifest::UDEVD_PATH), &udevd)?;

        if config.has_feature(Feature::Zfs) {
            for file in &settings.zfs.files {
                self.stage_required(tree, file)?;
            }
            for file in &settings.zfs.optional_files {
                self.stage_optional(tree, file)?;
            }
            self.stage_libgcc(tree)?;
        }

        if config.has_feature(Feature::Luks) {
            self.stage_luks(tree)?;
        }

        if let Some(source) = config.keymap() {
            self.stage_keymap(tree, source)?;
        }

        self.stage_dir_tree(tree, &settings.udev_config_directory)?;
        self.stage_dir_tree(tree, &settings.udev_lib_directory)?;
        self.stage_dir_tree(tree, &settings.modprobe_directory)?;

        if settings.firmware.enabled {
            self.stage_firmware(tree)?;
        }

        let module_count = self.stage_modules(tree, modules)?;

        let (executables, libraries) = self.stage_library_closure(tree)?;
        self.stage_links(tree)?;

        let manifest = self.manifest(tree, modules);
        let json = manifest.to_json()?;
        tree.add_bytes(manifest::MANIFEST_PATH, json, 0o644)?;

        for warning in &self.warnings {
            tracing::warn!("{}", warning);
        }

        Ok(CollectReport {
            warnings: self.warnings,
            executables,
            libraries,
            modules: module_count,
            manifest,
        })
    }

    fn host(&self, image_path: &Path) -> PathBuf {
        self.config.host_path(image_path)
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Stage the host file `source` at `image`, keeping its permission bits.
    fn stage_file(&self, tree: &mut StagingTree, image: &Path, source: &Path) -> BuildResult<bool> {
        let meta = fs::metadata(source).map_err(|_| BuildError::MissingFile(source.to_path_buf()))?;
        tree.add_host_file(image, source, meta.permissions().mode())
    }

    fn stage_required(&self, tree: &mut StagingTree, path: &Path) -> BuildResult<bool> {
        let source = self.host(path);
        if !source.exists() {
            return Err(BuildError::MissingFile(path.to_path_buf()));
        }
        self.stage_file(tree, path, &source)
    }

    fn stage_optional(&mut self, tree: &mut StagingTree, path: &Path) -> BuildResult<bool> {
        let source = self.host(path);
        if !source.exists() {
            self.warn(format!("optional file not found: {}", path.display()));
            return Ok(false);
        }
        self.stage_file(tree, path, &source)
    }

    fn stage_layout(&self, tree: &mut StagingTree) -> BuildResult<()> {
        for dir in layout::BASE_DIRS {
            tree.add_dir(dir)?;
        }
        for (path, major, minor, mode) in layout::DEVICE_NODES {
            tree.insert(StagedEntry::char_device(path, *major, *minor, *mode)?)?;
        }
        tree.add_bytes("/etc/mtab", Vec::new(), 0o644)?;
        tree.add_bytes(
            manifest::VERSION_PATH,
            format!("{}\n", env!("CARGO_PKG_VERSION")),
            0o644,
        )?;
        Ok(())
    }

    /// Copy a host directory tree as is. Absent directories are skipped.
    fn stage_dir_tree(&self, tree: &mut StagingTree, dir: &Path) -> BuildResult<usize> {
        let host_dir = self.host(dir);
        if !host_dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "directory absent on host, skipping");
            return Ok(0);
        }

        let mut count = 0;
        for entry in WalkDir::new(&host_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| BuildError::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(&host_dir)
                .map_err(|e| BuildError::Configuration(e.to_string()))?;
            let image = dir.join(rel);
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                tree.add_symlink(&image, target)?;
            } else if file_type.is_dir() {
                let mode = entry.metadata().map_err(|e| BuildError::Io(e.into()))?.permissions().mode();
                let mut dir_entry = StagedEntry::dir(&image)?;
                dir_entry.mode = mode & 0o7777;
                tree.insert(dir_entry)?;
            } else {
                self.stage_file(tree, &image, entry.path())?;
            }
            count += 1;
        }
        Ok(count)
    }

    /// libpthread loads libgcc_s with dlopen, so no NEEDED entry points at it.
    fn stage_libgcc(&mut self, tree: &mut StagingTree) -> BuildResult<()> {
        let lib64 = self.config.settings().system_directory.lib64.clone();
        let found = self.search.find(layout::LIBGCC).map(|image| self.host(&image));
        let found = found.or_else(|| {
            layout::LIBGCC_SEARCH_DIRS
                .iter()
                .map(|dir| self.config.host_root().join(dir))
                .filter(|dir| dir.is_dir())
                .flat_map(|dir| WalkDir::new(dir).sort_by_file_name().into_iter().flatten())
                .find(|e| e.file_name() == layout::LIBGCC)
                .map(|e| e.path().to_path_buf())
        });

        let Some(source) = found else {
            return Err(BuildError::UnresolvedLibrary {
                binary: PathBuf::from("/sbin/zfs"),
                library: layout::LIBGCC.to_string(),
            });
        };
        let image = lib64.join(layout::LIBGCC);
        self.stage_file(tree, &image, &source)?;
        tree.insert_if_absent(StagedEntry::symlink(lib64.join("libgcc_s.so"), layout::LIBGCC)?)?;
        Ok(())
    }

    fn stage_luks(&mut self, tree: &mut StagingTree) -> BuildResult<()> {
        let config = self.config;
        let luks = &config.settings().luks;
        for file in &luks.files {
            self.stage_required(tree, file)?;
        }
        if luks.use_keyfile {
            if let Some(path) = &luks.keyfile_path {
                let source = self.host(path);
                if !source.is_file() {
                    return Err(BuildError::MissingFile(path.clone()));
                }
                tree.add_host_file(manifest::KEYFILE_PATH, source, 0o400)?;
            }
        }
        if luks.use_detached_header {
            if let Some(path) = &luks.detached_header_path {
                let source = self.host(path);
                if !source.is_file() {
                    return Err(BuildError::MissingFile(path.clone()));
                }
                tree.add_host_file(manifest::HEADER_PATH, source, 0o400)?;
            }
        }
        Ok(())
    }

    fn stage_keymap(&mut self, tree: &mut StagingTree, source: &KeymapSource) -> BuildResult<()> {
        match source {
            KeymapSource::File(path) => {
                let host = self.host(path);
                if !host.is_file() {
                    return Err(BuildError::MissingFile(path.clone()));
                }
                tree.add_host_file(manifest::KEYMAP_PATH, host, 0o644)?;
            }
            KeymapSource::Dump => match Cmd::new("dumpkeys").run() {
                Ok(result) if !result.stdout.is_empty() => {
                    tree.add_bytes(manifest::KEYMAP_PATH, result.stdout.into_bytes(), 0o644)?;
                }
                Ok(_) => self.warn("dumpkeys produced no output, keymap not embedded".into()),
                Err(e) => self.warn(format!("could not dump the host keymap: {:#}", e)),
            },
        }
        // The init loads the keymap with loadkeys; busybox loadkmap cannot
        // read this format.
        for tool in LOADKEYS_PATHS {
            let host = self.host(Path::new(tool));
            if host.exists() {
                self.stage_file(tree, Path::new(tool), &host)?;
                return Ok(());
            }
        }
        Err(BuildError::MissingFile(PathBuf::from(LOADKEYS_PATHS[0])))
    }

    fn stage_firmware(&mut self, tree: &mut StagingTree) -> BuildResult<()> {
        let config = self.config;
        let settings = config.settings();
        let fw_dir = settings.firmware_directory.clone();
        if !self.host(&fw_dir).is_dir() {
            return Err(BuildError::Configuration(format!(
                "firmware directory {} does not exist",
                fw_dir.display()
            )));
        }
        if settings.firmware.copy_all {
            self.stage_dir_tree(tree, &fw_dir)?;
            return Ok(());
        }
        for file in &settings.firmware.files {
            self.stage_required(tree, &fw_dir.join(file))?;
        }
        for dir in &settings.firmware.directories {
            if self.stage_dir_tree(tree, &fw_dir.join(dir))? == 0 {
                self.warn(format!("firmware directory {} is empty or missing", dir.display()));
            }
        }
        Ok(())
    }

    fn image_modules_dir(&self) -> PathBuf {
        self.config
            .settings()
            .modules_directory
            .join(self.config.kernel_version())
    }

    fn stage_modules(&self, tree: &mut StagingTree, modules: &ModuleSet) -> BuildResult<usize> {
        let host_dir = self.config.modules_dir();
        let image_dir = self.image_modules_dir();
        tree.add_dir(&image_dir)?;

        let mut count = 0;
        for module in modules.loadable() {
            let Some(rel) = &module.path else { continue };
            let source = host_dir.join(rel);
            if !source.exists() {
                return Err(BuildError::MissingFile(source));
            }
            self.stage_file(tree, &image_dir.join(rel), &source)?;
            count += 1;
        }

        for name in MODULE_METADATA_FILES {
            let source = host_dir.join(name);
            if source.is_file() {
                self.stage_file(tree, &image_dir.join(name), &source)?;
            }
        }
        tree.add_bytes(image_dir.join("modules.dep"), modules.dep_file(), 0o644)?;
        Ok(count)
    }

    /// Follow interpreter and NEEDED entries of every staged host file until
    /// nothing new turns up. Each soname is resolved once.
    fn stage_library_closure(&self, tree: &mut StagingTree) -> BuildResult<(usize, usize)> {
        let settings = self.config.settings();
        let skip = [self.image_modules_dir(), settings.firmware_directory.clone()];

        let mut queue: VecDeque<(PathBuf, PathBuf)> = tree
            .iter()
            .filter(|e| !skip.iter().any(|dir| e.path.starts_with(dir)))
            .filter_map(|e| match &e.kind {
                EntryKind::File(EntrySource::Host(source)) => Some((e.path.clone(), source.clone())),
                _ => None,
            })
            .collect();

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut libraries: Vec<PathBuf> = Vec::new();
        let mut executables = 0;

        while let Some((image, source)) = queue.pop_front() {
            let Some(info) = self.inspector.inspect(&source)? else {
                continue;
            };

            let mut wanted: Vec<String> = Vec::new();
            if let Some(interp) = &info.interpreter {
                executables += 1;
                wanted.push(interp.to_string_lossy().into_owned());
            }
            wanted.extend(info.needed.iter().cloned());

            for soname in wanted {
                if !seen.insert(soname.clone()) {
                    continue;
                }
                let found = self.search.find(&soname).ok_or_else(|| BuildError::UnresolvedLibrary {
                    binary: image.clone(),
                    library: soname.clone(),
                })?;
                let host = self.host(&found);
                tracing::debug!(binary = %image.display(), library = %found.display(), "library dependency");
                // An interpreter is referenced by path: stage it at that path.
                let target = if soname.starts_with('/') {
                    PathBuf::from(&soname)
                } else {
                    found.clone()
                };
                self.stage_file(tree, &target, &host)?;
                libraries.push(target.clone());
                queue.push_back((target, host));
            }
        }

        // The image has no ld.so.cache: make libraries from /usr/lib* visible
        // in the loader's default directory.
        let lib64 = &settings.system_directory.lib64;
        for lib in &libraries {
            let (Some(parent), Some(name)) = (lib.parent(), lib.file_name()) else {
                continue;
            };
            if parent == lib64 || parent == settings.system_directory.lib {
                continue;
            }
            tree.insert_if_absent(StagedEntry::symlink(lib64.join(name), lib)?)?;
        }

        Ok((executables, libraries.len()))
    }

    fn stage_links(&self, tree: &mut StagingTree) -> BuildResult<()> {
        let settings = self.config.settings();
        let bin = &settings.system_directory.bin;
        let sbin = &settings.system_directory.sbin;

        if tree.contains(bin.join("bash")) {
            tree.add_symlink(bin.join("sh"), "bash")?;
        }

        let kmod = [bin.join("kmod"), sbin.join("kmod")]
            .into_iter()
            .find(|p| tree.contains(p));
        if let Some(kmod) = &kmod {
            for link in &settings.base.kmod_links {
                tree.insert_if_absent(StagedEntry::symlink(sbin.join(link), kmod)?)?;
            }
        }

        let busybox = bin.join("busybox");
        if let Some(entry) = tree.get(&busybox) {
            let applets = match &entry.kind {
                EntryKind::File(EntrySource::Host(source)) => busybox_applets(source),
                _ => fallback_applets(),
            };
            for applet in applets {
                if applet == "busybox" {
                    continue;
                }
                if kmod.is_some() && settings.base.kmod_links.contains(&applet) {
                    continue;
                }
                let (in_bin, in_sbin) = (bin.join(&applet), sbin.join(&applet));
                if tree.contains(&in_bin) || tree.contains(&in_sbin) {
                    continue;
                }
                let link = if layout::SBIN_APPLETS.contains(&applet.as_str()) {
                    StagedEntry::symlink(in_sbin, &busybox)?
                } else {
                    StagedEntry::symlink(in_bin, "busybox")?
                };
                tree.insert_if_absent(link)?;
            }
        }
        Ok(())
    }

    fn manifest(&self, tree: &StagingTree, modules: &ModuleSet) -> BootManifest {
        let config = self.config;
        let image_dir = self.image_modules_dir();
        let present = |p: &str| tree.contains(p).then(|| PathBuf::from(p));

        let mut manifest = BootManifest::new(config.kernel_version());
        manifest.features = config.features().iter().copied().collect();
        manifest.modules = modules
            .load_order()
            .into_iter()
            .filter_map(|m| {
                m.path.as_ref().map(|rel| ModuleLoad {
                    name: m.name.clone(),
                    path: image_dir.join(rel),
                })
            })
            .collect();
        manifest.keymap = present(manifest::KEYMAP_PATH);
        manifest.embedded_keyfile = present(manifest::KEYFILE_PATH);
        manifest.detached_header = present(manifest::HEADER_PATH);
        manifest.cachefile = present(manifest::CACHEFILE_PATH);
        manifest.retry = config.retry().clone();
        manifest
    }
}

/// Applet names reported by the host's busybox, or a built-in list when it
/// cannot be run (foreign architecture, not executable).
fn busybox_applets(busybox: &Path) -> Vec<String> {
    match Cmd::new(busybox.to_string_lossy()).arg("--list").run() {
        Ok(result) if !result.stdout_trimmed().is_empty() => result
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && !l.contains('/'))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        _ => {
            tracing::debug!(busybox = %busybox.display(), "busybox --list unavailable, using built-in applet list");
            fallback_applets()
        }
    }
}

fn fallback_applets() -> Vec<String> {
    layout::FALLBACK_APPLETS.iter().map(|s| s.to_string()).collect()
}
