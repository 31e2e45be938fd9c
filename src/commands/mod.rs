//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Resolve, collect and write the image
//! - `resolve` - Print a module closure
//! - `list` - Dry run: print what would be staged
//! - `preflight` - Check the build host
//! - `show` - Display configuration

pub mod build;
mod list;
mod preflight;
mod resolve;
pub mod show;

pub use build::cmd_build;
pub use list::cmd_list;
pub use preflight::cmd_preflight;
pub use resolve::cmd_resolve;
pub use show::cmd_show;
