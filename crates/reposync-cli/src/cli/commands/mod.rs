mod checksum;
mod fetch_host;
mod file_sync;

pub use checksum::run_checksum;
pub use fetch_host::run_fetch_host;
pub use file_sync::run_file_sync;
