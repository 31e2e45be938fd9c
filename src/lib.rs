//! zboot library: the image builder and the early-boot runtime.
//!
//! The `zboot` binary drives the build side (`modules` → `collect` →
//! `archive`); `zboot-init` runs `boot` inside the image. The two halves
//! share only [`manifest`].

pub mod archive;
pub mod boot;
pub mod collect;
pub mod commands;
pub mod config;
pub mod elf;
pub mod error;
pub mod manifest;
pub mod modules;
pub mod preflight;
pub mod process;
pub mod staging;
pub mod timing;

pub use error::{BootError, BuildError, ErrorClass};
