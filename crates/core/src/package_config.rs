use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{CompressionType, PackageItem, RuntimePermission, SliceBytes};
use crate::{Error, Result};

pub const PACKAGE_CONFIG_FILE: &str = "package_restore_config.json";
pub const PACKAGE_CONFIG_VERSION: u32 = 1;

/// Snapshot of a package written next to its archives after a successful backup.
/// Restore reads runtime permissions and the SSAID back from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub version: u32,
    pub package_name: String,
    pub user_id: u32,
    pub compression: CompressionType,
    pub recorded: SliceBytes,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub permissions: Vec<RuntimePermission>,
    #[serde(default)]
    pub ssaid: Option<String>,
    pub last_backup_unix: i64,
}

impl PackageConfig {
    pub fn new(item: &PackageItem) -> Self {
        Self {
            version: PACKAGE_CONFIG_VERSION,
            package_name: item.package_name.clone(),
            user_id: item.user_id,
            compression: item.compression,
            recorded: item.recorded,
            uid: None,
            permissions: Vec::new(),
            ssaid: None,
            last_backup_unix: chrono::Utc::now().timestamp(),
        }
    }
}

pub fn package_config_path(dir: &Path) -> PathBuf {
    dir.join(PACKAGE_CONFIG_FILE)
}

/// Writes `{dir}/package_restore_config.json` through a temporary file.
pub async fn write_package_config(dir: &Path, config: &PackageConfig) -> Result<PathBuf> {
    let path = package_config_path(dir);
    let bytes = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!(
        event = "package_config.write",
        path = %path.display(),
        permissions = config.permissions.len(),
        "package_config.write"
    );
    Ok(path)
}

/// `None` when the file does not exist.
pub async fn read_package_config(path: &Path) -> Result<Option<PackageConfig>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let config: PackageConfig = serde_json::from_slice(&bytes)?;
    if config.version != PACKAGE_CONFIG_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "{} has version {} (expected {PACKAGE_CONFIG_VERSION})",
                path.display(),
                config.version
            ),
        });
    }
    Ok(Some(config))
}
