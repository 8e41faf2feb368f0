//! Virtual filesystem - generated files and the mount tree built from them
//!
//! - files.rs: generated file records as received from the code generator
//! - tree.rs: the nested mount tree written into the sandbox
//! - builder.rs: the pure transformation between the two

mod builder;
mod files;
mod tree;

pub use builder::{
    build, build_with, BuildOptions, ENTRY_MOUNT_PATH, ENTRY_SOURCE_PATH, MANIFEST_PATH,
    PUBLIC_DIR, SOURCE_DIR,
};
pub use files::{FileStatus, GeneratedFile, GeneratedFileSet};
pub use tree::MountNode;
