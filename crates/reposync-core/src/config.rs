use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/reposync/config.toml`.
///
/// CLI flags override any of these per run; the file carries the defaults an
/// operator wants for every sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker threads per sync.
    pub parallel: usize,
    /// Retry budget per descriptor.
    pub retries: u32,
    /// Download rate cap in KB/s; absent means unlimited.
    pub max_speed_kb: Option<u64>,
    /// Delete repo-local packages the remote no longer advertises.
    pub purge_orphaned: bool,
    /// Prune old package versions after a sync.
    pub remove_old: bool,
    /// How many versions besides the newest to keep when pruning.
    pub num_old_packages: u64,
    /// Pre-download verification of files already on disk.
    pub verify_size: bool,
    pub verify_checksum: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            parallel: 5,
            retries: 2,
            max_speed_kb: None,
            purge_orphaned: true,
            remove_old: false,
            num_old_packages: 2,
            verify_size: true,
            verify_checksum: true,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("reposync")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SyncConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SyncConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SyncConfig = toml::from_str(&data)?;
    Ok(cfg)
}
