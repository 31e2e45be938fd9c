//! Side effects of the boot pipeline.
//!
//! Every stage talks to the machine through [`BootSystem`], so the pipeline
//! can be driven by a scripted fake in tests. [`HostSystem`] is the real
//! implementation used by `zboot-init`: external tools through [`Cmd`],
//! pseudo filesystem mounts through `nix`.

use std::fs;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sys::termios::{self, LocalFlags, SetArg};

use crate::error::{BootError, BootResult};
use crate::manifest::{ModuleLoad, UDEVD_PATH};
use crate::process::Cmd;

use super::mount::{PoolImportRequest, PoolSelector};

/// Operations the boot stages need from the running system.
pub trait BootSystem {
    fn mount_pseudo_filesystems(&mut self) -> BootResult<()>;

    /// Insert one module. A module that is already loaded is not an error.
    fn load_module(&mut self, module: &ModuleLoad) -> BootResult<()>;

    fn start_udev(&mut self) -> BootResult<()>;

    /// Wait for the device event queue to drain. `Ok(false)` on timeout.
    fn settle(&mut self, timeout: Duration) -> BootResult<bool>;

    fn load_keymap(&mut self, path: &Path) -> BootResult<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_executable(&self, path: &Path) -> bool;

    /// Read key material. A missing file is [`BootError::KeyfileMissing`].
    fn read_key(&mut self, path: &Path) -> BootResult<Vec<u8>>;

    /// Mount the device holding the keyfile read-only.
    fn mount_key_drive(&mut self, device: &str, target: &Path) -> BootResult<()>;

    /// Ask the operator for a secret without echoing it.
    fn prompt_secret(&mut self, prompt: &str) -> BootResult<String>;

    /// Decrypt a GPG keyfile. `Ok(None)` means the passphrase was wrong.
    fn gpg_decrypt(&mut self, keyfile: &Path, passphrase: &str) -> BootResult<Option<Vec<u8>>>;

    /// Open a LUKS device as `/dev/mapper/<mapping>`. `Ok(false)` means the
    /// key was rejected.
    fn luks_open(
        &mut self,
        device: &str,
        mapping: &str,
        key: &[u8],
        header: Option<&Path>,
    ) -> BootResult<bool>;

    fn imported_pools(&mut self) -> BootResult<Vec<String>>;

    /// Try one import. `Ok(false)` means the pool's devices were not found.
    fn import_pool(&mut self, request: &PoolImportRequest) -> BootResult<bool>;

    fn bootfs(&mut self, pool: &str) -> BootResult<Option<String>>;

    fn dataset_exists(&mut self, dataset: &str) -> BootResult<bool>;

    /// Encryption root of `dataset` when its key is not loaded yet.
    fn locked_encryption_root(&mut self, dataset: &str) -> BootResult<Option<String>>;

    /// Load a ZFS native encryption key. `Ok(false)` means it was rejected.
    fn zfs_load_key(&mut self, encryption_root: &str, key: &[u8]) -> BootResult<bool>;

    fn mount_dataset(&mut self, dataset: &str, target: &Path, options: Option<&str>)
        -> BootResult<()>;

    fn sleep(&mut self, duration: Duration);

    /// Hand over to the real init. Only returns on failure.
    fn switch_root(&mut self, new_root: &Path, init: &Path, args: &[String]) -> BootResult<()>;

    /// Run one interactive shell session.
    fn rescue_shell(&mut self) -> BootResult<()>;
}

/// Pseudo filesystems mounted before the pipeline starts:
/// (source, target, fstype, data).
const PSEUDO_FILESYSTEMS: &[(&str, &str, &str, Option<&str>)] = &[
    ("proc", "/proc", "proc", None),
    ("sysfs", "/sys", "sysfs", None),
    ("devtmpfs", "/dev", "devtmpfs", Some("mode=0755")),
    ("tmpfs", "/run", "tmpfs", Some("mode=0755")),
];

/// Scratch space for decrypted keys and the GPG home.
const RUNTIME_DIR: &str = "/run/zboot";

/// Whether gpg failed because of the passphrase rather than its setup.
/// A missing agent or unreadable input reports "No secret key" or similar.
fn gpg_rejected_passphrase(stderr: &str) -> bool {
    stderr.contains("Bad session key") || stderr.contains("Bad passphrase")
}

/// The machine `zboot-init` is running on.
#[derive(Debug, Default)]
pub struct HostSystem;

impl HostSystem {
    pub fn new() -> Self {
        Self
    }

    fn tool(cmd: Cmd) -> BootResult<crate::process::CommandResult> {
        let line = cmd.display();
        tracing::debug!(command = %line, "running");
        cmd.run().map_err(|e| BootError::command(line, format!("{:#}", e)))
    }

    fn runtime_dir() -> BootResult<PathBuf> {
        let dir = PathBuf::from(RUNTIME_DIR);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(dir)
    }
}

impl BootSystem for HostSystem {
    fn mount_pseudo_filesystems(&mut self) -> BootResult<()> {
        for (source, target, fstype, data) in PSEUDO_FILESYSTEMS {
            fs::create_dir_all(target)?;
            match mount(
                Some(*source),
                *target,
                Some(*fstype),
                MsFlags::MS_NOSUID,
                *data,
            ) {
                Ok(()) | Err(Errno::EBUSY) => {}
                Err(e) => {
                    return Err(BootError::MountFailed {
                        target: target.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn load_module(&mut self, module: &ModuleLoad) -> BootResult<()> {
        let cmd = Cmd::new("insmod").arg_path(&module.path).allow_fail();
        let line = cmd.display();
        let result = cmd
            .run()
            .map_err(|e| BootError::command(line.as_str(), format!("{:#}", e)))?;
        if result.success() || result.stderr.contains("File exists") {
            Ok(())
        } else {
            Err(BootError::command(line, result.stderr_trimmed()))
        }
    }

    fn start_udev(&mut self) -> BootResult<()> {
        // The daemon keeps our stdio open, so it must not run with pipes.
        Cmd::new(UDEVD_PATH)
            .args(["--daemon", "--resolve-names=never"])
            .run_interactive()
            .map_err(|e| BootError::command(UDEVD_PATH, format!("{:#}", e)))?;
        Self::tool(Cmd::new("udevadm").args(["trigger", "--action=add", "--type=subsystems"]))?;
        Self::tool(Cmd::new("udevadm").args(["trigger", "--action=add", "--type=devices"]))?;
        Ok(())
    }

    fn settle(&mut self, timeout: Duration) -> BootResult<bool> {
        let result = Self::tool(
            Cmd::new("udevadm")
                .arg("settle")
                .arg(format!("--timeout={}", timeout.as_secs().max(1)))
                .allow_fail(),
        )?;
        Ok(result.success())
    }

    fn load_keymap(&mut self, path: &Path) -> BootResult<()> {
        Self::tool(Cmd::new("loadkeys").arg_path(path)).map(|_| ())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_executable(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn read_key(&mut self, path: &Path) -> BootResult<Vec<u8>> {
        fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BootError::KeyfileMissing(path.to_path_buf()),
            _ => BootError::Io(e),
        })
    }

    fn mount_key_drive(&mut self, device: &str, target: &Path) -> BootResult<()> {
        fs::create_dir_all(target)?;
        Cmd::new("mount")
            .args(["-o", "ro", device])
            .arg_path(target)
            .error_msg(format!("cannot mount key drive {}", device))
            .run()
            .map_err(|e| BootError::MountFailed {
                target: target.display().to_string(),
                reason: format!("{:#}", e),
            })
            .map(|_| ())
    }

    fn prompt_secret(&mut self, prompt: &str) -> BootResult<String> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(&stdin).ok();
        if let Some(ref attrs) = saved {
            let mut quiet = attrs.clone();
            quiet.local_flags.remove(LocalFlags::ECHO);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &quiet);
        }

        eprint!("{}", prompt);
        io::stderr().flush()?;
        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line);

        if let Some(ref attrs) = saved {
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, attrs);
        }
        eprintln!();
        read?;

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn gpg_decrypt(&mut self, keyfile: &Path, passphrase: &str) -> BootResult<Option<Vec<u8>>> {
        let dir = Self::runtime_dir()?;
        let home = dir.join("gnupg");
        fs::create_dir_all(&home)?;
        fs::set_permissions(&home, fs::Permissions::from_mode(0o700))?;
        let output = dir.join("key");
        let _ = fs::remove_file(&output);

        let result = Self::tool(
            Cmd::new("gpg")
                .env("GNUPGHOME", home.to_string_lossy())
                .args(["--batch", "--quiet", "--no-tty", "--yes"])
                .args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"])
                .arg("--output")
                .arg_path(&output)
                .arg("--decrypt")
                .arg_path(keyfile)
                .stdin_bytes(format!("{}\n", passphrase))
                .allow_fail(),
        )?;
        if !result.success() {
            let stderr = result.stderr_trimmed();
            if gpg_rejected_passphrase(stderr) {
                tracing::debug!(stderr, "gpg rejected passphrase");
                return Ok(None);
            }
            return Err(BootError::command(
                format!("gpg --decrypt {}", keyfile.display()),
                stderr,
            ));
        }

        let key = fs::read(&output)?;
        fs::remove_file(&output)?;
        Ok(Some(key))
    }

    fn luks_open(
        &mut self,
        device: &str,
        mapping: &str,
        key: &[u8],
        header: Option<&Path>,
    ) -> BootResult<bool> {
        let mut cmd = Cmd::new("cryptsetup").args(["open", "--type", "luks", "--key-file=-"]);
        if let Some(header) = header {
            cmd = cmd.arg("--header").arg_path(header);
        }
        let result = Self::tool(cmd.args([device, mapping]).stdin_bytes(key).allow_fail())?;
        match result.code() {
            0 => Ok(true),
            // "No key available with this passphrase."
            2 => Ok(false),
            _ => Err(BootError::command(
                format!("cryptsetup open {}", device),
                result.stderr_trimmed(),
            )),
        }
    }

    fn imported_pools(&mut self) -> BootResult<Vec<String>> {
        let result = Self::tool(Cmd::new("zpool").args(["list", "-H", "-o", "name"]))?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn import_pool(&mut self, request: &PoolImportRequest) -> BootResult<bool> {
        let mut cmd = Cmd::new("zpool").args(["import", "-N"]);
        if let Some(ref dir) = request.scan_dir {
            cmd = cmd.arg("-d").arg_path(dir);
        }
        if let Some(ref cache) = request.cachefile {
            cmd = cmd.arg("-c").arg_path(cache);
        }
        cmd = match request.pool {
            PoolSelector::Named(ref pool) => cmd.arg(pool),
            PoolSelector::All => cmd.arg("-a"),
        };

        let result = Self::tool(cmd.allow_fail())?;
        if !result.success() {
            tracing::debug!(stderr = result.stderr_trimmed(), "zpool import failed");
        }
        Ok(result.success())
    }

    fn bootfs(&mut self, pool: &str) -> BootResult<Option<String>> {
        let result = Self::tool(Cmd::new("zpool").args(["get", "-H", "-o", "value", "bootfs", pool]))?;
        Ok(match result.stdout_trimmed() {
            "" | "-" => None,
            dataset => Some(dataset.to_string()),
        })
    }

    fn dataset_exists(&mut self, dataset: &str) -> BootResult<bool> {
        let result =
            Self::tool(Cmd::new("zfs").args(["list", "-H", "-o", "name", dataset]).allow_fail())?;
        Ok(result.success())
    }

    fn locked_encryption_root(&mut self, dataset: &str) -> BootResult<Option<String>> {
        let result = Self::tool(Cmd::new("zfs").args([
            "get",
            "-H",
            "-o",
            "value",
            "encryptionroot,keystatus",
            dataset,
        ]))?;
        let mut values = result.stdout.lines().map(str::trim);
        let root = values.next().unwrap_or("-");
        let status = values.next().unwrap_or("-");
        Ok((root != "-" && status == "unavailable").then(|| root.to_string()))
    }

    fn zfs_load_key(&mut self, encryption_root: &str, key: &[u8]) -> BootResult<bool> {
        let result = Self::tool(
            Cmd::new("zfs")
                .args(["load-key", "-L", "prompt", encryption_root])
                .stdin_bytes(key)
                .allow_fail(),
        )?;
        if result.success() {
            Ok(true)
        } else if result.stderr.contains("Incorrect key") {
            Ok(false)
        } else {
            Err(BootError::command(
                format!("zfs load-key {}", encryption_root),
                result.stderr_trimmed(),
            ))
        }
    }

    fn mount_dataset(
        &mut self,
        dataset: &str,
        target: &Path,
        options: Option<&str>,
    ) -> BootResult<()> {
        let mountpoint =
            Self::tool(Cmd::new("zfs").args(["get", "-H", "-o", "value", "mountpoint", dataset]))?;
        let mut opts: Vec<&str> = Vec::new();
        if mountpoint.stdout_trimmed() != "legacy" {
            opts.push("zfsutil");
        }
        opts.extend(options.into_iter().filter(|o| !o.is_empty()));

        let mut cmd = Cmd::new("mount").args(["-t", "zfs"]);
        if !opts.is_empty() {
            cmd = cmd.arg("-o").arg(opts.join(","));
        }
        cmd.arg(dataset)
            .arg_path(target)
            .run()
            .map_err(|e| BootError::MountFailed {
                target: target.display().to_string(),
                reason: format!("{:#}", e),
            })
            .map(|_| ())
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn switch_root(&mut self, new_root: &Path, init: &Path, args: &[String]) -> BootResult<()> {
        let _ = Cmd::new("udevadm").args(["control", "--exit"]).allow_fail().run();
        let _ = fs::remove_dir_all(RUNTIME_DIR);

        let err = Command::new("switch_root")
            .arg(new_root)
            .arg(init)
            .args(args)
            .exec();
        Err(BootError::command("switch_root", err))
    }

    fn rescue_shell(&mut self) -> BootResult<()> {
        Cmd::new("/bin/sh")
            .allow_fail()
            .run_interactive()
            .map_err(|e| BootError::command("/bin/sh", format!("{:#}", e)))
            .map(|_| ())
    }
}
