//! Fixed shape of the image: directories, device nodes, applet links.

/// Directories every image has.
pub const BASE_DIRS: &[&str] = &[
    "/bin",
    "/dev",
    "/etc",
    "/etc/zfs",
    "/etc/zboot",
    "/lib",
    "/lib/modules",
    "/lib64",
    "/mnt",
    "/mnt/key",
    "/mnt/root",
    "/proc",
    "/root",
    "/run",
    "/sbin",
    "/sys",
    "/usr",
];

/// Device nodes the kernel needs before devtmpfs is mounted:
/// (path, major, minor, mode).
pub const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[
    ("/dev/console", 5, 1, 0o600),
    ("/dev/null", 1, 3, 0o666),
    ("/dev/tty", 5, 0, 0o666),
];

/// Applets linked to busybox when `busybox --list` cannot be run on the
/// build host.
pub const FALLBACK_APPLETS: &[&str] = &[
    "[", "awk", "basename", "cat", "chmod", "chroot", "clear", "cp", "cut", "dd", "df",
    "dirname", "dmesg", "echo", "env", "find", "grep", "gunzip", "head", "hostname", "kill",
    "less", "ln", "loadkmap", "ls", "mkdir", "mknod", "mount", "mv", "ps", "pwd", "readlink",
    "rm", "rmdir", "sed", "sh", "sleep", "stat", "switch_root", "sync", "tail", "test",
    "touch", "tr", "umount", "uname", "vi", "wc", "xargs",
];

/// Applets that live in `/sbin` rather than `/bin`.
pub const SBIN_APPLETS: &[&str] = &["switch_root", "loadkmap", "mdev", "pivot_root"];

/// Well-known places for `libgcc_s` outside the normal library path.
pub const LIBGCC_SEARCH_DIRS: &[&str] = &["usr/lib/gcc", "usr/lib64/gcc"];
pub const LIBGCC: &str = "libgcc_s.so.1";
