//! On-disk staging and layout: resumable `.part` writing, directory creation,
//! and relative-symlink publication into a shared store.

mod layout;
mod partial;

pub use layout::{make_dir_safe, publish_symlink, relative_path_between};
pub use partial::{part_path_for, PartialWriter};
