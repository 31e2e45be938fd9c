//! Shared test utilities for zboot integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use zboot::config::{BuildConfigBuilder, BuildConfig, Compression, Settings};

pub const KERNEL: &str = "6.6.30-gentoo";

/// A fake host system to collect from, plus an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Host root the collector reads from
    pub host: PathBuf,
    /// Where images are written
    pub out: PathBuf,
    /// Stand-in for the zboot-init binary
    pub init: PathBuf,
}

impl TestEnv {
    /// Host tree with the default base and ZFS file sets and a small
    /// module tree for [`KERNEL`] (`zfs` depends on `spl`).
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let host = temp_dir.path().join("host");
        let out = temp_dir.path().join("out");
        fs::create_dir_all(&host).expect("Failed to create host root");
        fs::create_dir_all(&out).expect("Failed to create output dir");

        let init = temp_dir.path().join("zboot-init");
        fs::write(&init, "zboot-init stand-in\n").expect("Failed to write init");
        fs::set_permissions(&init, fs::Permissions::from_mode(0o755)).unwrap();

        let env = Self {
            _temp_dir: temp_dir,
            host,
            out,
            init,
        };

        let settings = Settings::defaults();
        for file in settings.base.files.iter().chain(&settings.zfs.files) {
            env.executable(file);
        }
        // Exits non-zero without output, so the built-in applet list is used.
        env.write("/bin/busybox", "#!/bin/false\n", 0o755);
        env.file("/usr/lib/gcc/x86_64-pc-linux-gnu/13/libgcc_s.so.1");
        env.file("/lib/udev/rules.d/90-zfs.rules");
        env.file("/etc/hostid");

        let modules = format!("/lib/modules/{}", KERNEL);
        env.file(&format!("{}/extra/zfs.ko", modules));
        env.file(&format!("{}/extra/spl.ko", modules));
        env.file(&format!("{}/kernel/drivers/nvme/host/nvme.ko", modules));
        env.file(&format!("{}/kernel/drivers/nvme/host/nvme-core.ko", modules));
        env.write(
            &format!("{}/modules.dep", modules),
            "extra/zfs.ko: extra/spl.ko\n\
             extra/spl.ko:\n\
             kernel/drivers/nvme/host/nvme.ko: kernel/drivers/nvme/host/nvme-core.ko\n\
             kernel/drivers/nvme/host/nvme-core.ko:\n",
            0o644,
        );
        env.write(
            &format!("{}/modules.builtin", modules),
            "kernel/crypto/sha256_generic.ko\n",
            0o644,
        );
        env
    }

    /// Absolute host path for an image path.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.host
            .join(path.as_ref().strip_prefix("/").unwrap_or(path.as_ref()))
    }

    pub fn write(&self, path: impl AsRef<Path>, content: &str, mode: u32) -> PathBuf {
        let full = self.host_path(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();
        fs::set_permissions(&full, fs::Permissions::from_mode(mode)).unwrap();
        full
    }

    /// Regular file whose content is its own path.
    pub fn file(&self, path: &str) -> PathBuf {
        self.write(path, path, 0o644)
    }

    /// Executable stand-in. Not ELF, so no library closure is followed.
    pub fn executable(&self, path: impl AsRef<Path>) -> PathBuf {
        let content = format!("{}\n", path.as_ref().display());
        self.write(path, &content, 0o755)
    }

    /// Builder pointed at this host root with uncompressed output and a
    /// fixed timestamp.
    pub fn builder(&self) -> BuildConfigBuilder {
        BuildConfig::builder(KERNEL)
            .settings(Settings::defaults())
            .host_root(&self.host)
            .init_binary(&self.init)
            .output_dir(&self.out)
            .compression(Compression::None)
            .mtime(1_700_000_000)
    }

    pub fn config(&self) -> BuildConfig {
        self.builder().build().expect("valid config")
    }
}

/// One entry read back from a newc archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub mode: u32,
    pub mtime: u32,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }
}

fn hex_field(bytes: &[u8], offset: usize) -> u32 {
    let text = std::str::from_utf8(&bytes[offset..offset + 8]).expect("ascii header");
    u32::from_str_radix(text, 16).expect("hex header field")
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse an uncompressed newc stream, trailer excluded.
pub fn read_newc(bytes: &[u8]) -> Vec<ArchiveEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;
    loop {
        let header = &bytes[pos..pos + 110];
        assert_eq!(&header[..6], b"070701", "bad magic at offset {}", pos);
        let mode = hex_field(header, 14);
        let mtime = hex_field(header, 46);
        let filesize = hex_field(header, 54) as usize;
        let namesize = hex_field(header, 94) as usize;

        let name_start = pos + 110;
        let name = String::from_utf8(bytes[name_start..name_start + namesize - 1].to_vec()).unwrap();
        let data_start = align4(name_start + namesize);
        let data = bytes[data_start..data_start + filesize].to_vec();
        pos = align4(data_start + filesize);

        if name == "TRAILER!!!" {
            break;
        }
        entries.push(ArchiveEntry {
            name,
            mode,
            mtime,
            data,
        });
    }
    entries
}

pub fn find<'a>(entries: &'a [ArchiveEntry], name: &str) -> Option<&'a ArchiveEntry> {
    entries.iter().find(|e| e.name == name)
}
