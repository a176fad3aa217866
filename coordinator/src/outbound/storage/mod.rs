//! Storage node adapters.

mod filesystem;

pub use filesystem::{EMPTY_CHECKSUM, FilesystemStorages};
