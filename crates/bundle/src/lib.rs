//! Task bundle materialization
//!
//! Gives each task an isolated working directory and fills it with the
//! task's code, either from an inline base64 archive or a remote download.

mod archive;
mod error;
mod materialize;
mod workdir;

pub use archive::{extract, ArchiveFormat};
pub use error::{BundleError, Result};
pub use materialize::BundleMaterializer;
pub use workdir::WorkdirManager;
