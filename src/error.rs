//! Error types for image assembly and early boot.
//!
//! Build-time failures are all fatal and abort the build without leaving an
//! artifact behind. Boot-time failures are either recovered locally (timing,
//! authentication) or surface as a transition to the rescue shell.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification shared by build and boot errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or missing build-time input.
    Configuration,
    /// Unknown module or library.
    Resolution,
    /// Serialization or compression of the image.
    Archive,
    /// Device or pool not yet visible; retried locally.
    Timing,
    /// Wrong key or passphrase; retried up to the attempt budget.
    Auth,
    /// Anything that ends the boot pipeline.
    FatalBoot,
}

/// Errors raised while resolving, collecting, and archiving an image.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("module '{module}' has no metadata entry for kernel {kernel}")]
    UnknownModule { module: String, kernel: String },

    #[error("kernel module metadata unavailable at {}: {reason}", path.display())]
    MetadataUnavailable { path: PathBuf, reason: String },

    #[error("required file does not exist on the build host: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("'{}' requires library '{library}' which could not be found", binary.display())]
    UnresolvedLibrary { binary: PathBuf, library: String },

    #[error("conflicting entries staged at {}", .0.display())]
    StagingConflict(PathBuf),

    #[error("failed to serialize {}: {reason}", path.display())]
    Serialization { path: PathBuf, reason: String },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BuildError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BuildError::Configuration(_) | BuildError::StagingConflict(_) => {
                ErrorClass::Configuration
            }
            BuildError::UnknownModule { .. }
            | BuildError::MetadataUnavailable { .. }
            | BuildError::MissingFile(_)
            | BuildError::UnresolvedLibrary { .. } => ErrorClass::Resolution,
            BuildError::Serialization { .. } | BuildError::Compression(_) | BuildError::Io(_) => {
                ErrorClass::Archive
            }
        }
    }
}

/// Errors raised inside the initramfs while bringing the root online.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("timed out waiting for {0}")]
    TimingFailure(String),

    #[error("authentication failed for {device} after {attempts} attempt(s)")]
    AuthExhausted { device: String, attempts: u32 },

    #[error("keyfile not found at {}", .0.display())]
    KeyfileMissing(PathBuf),

    #[error("pool '{0}' not found")]
    PoolNotFound(String),

    #[error("dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("failed to mount {target}: {reason}")]
    MountFailed { target: String, reason: String },

    #[error("root filesystem is not ready: {0}")]
    RootNotReady(String),

    #[error("'{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BootError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BootError::TimingFailure(_) => ErrorClass::Timing,
            BootError::AuthExhausted { .. } => ErrorClass::Auth,
            _ => ErrorClass::FatalBoot,
        }
    }

    /// Timing failures are the only ones a stage retry can fix.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Timing
    }

    pub fn command(command: impl Into<String>, reason: impl ToString) -> Self {
        BootError::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
pub type BootResult<T> = Result<T, BootError>;
