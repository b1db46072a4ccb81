/// Platform-neutral filesystem and privilege helpers
pub mod common;

pub use common::{atomic_write, ensure_directory_exists, is_privileged, read_optional};
