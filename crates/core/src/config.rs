use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::archive::CompressionParams;
use crate::model::{CompressionType, DataType, MediumItem, PackageItem, SelectionType};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

const USER_ID_PLACEHOLDER: &str = "{user_id}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default = "default_true")]
    pub compression_test: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_true")]
    pub clean_restoring: bool,
    /// Force-stop a package before its slices are archived or restored.
    #[serde(default = "default_true")]
    pub kill_app: bool,
    #[serde(default = "default_true")]
    pub restore_permissions: bool,
    #[serde(default = "default_true")]
    pub restore_ssaid: bool,
    #[serde(default)]
    pub selection_type: SelectionType,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_parallel_items")]
    pub parallel_items: u32,
    #[serde(default)]
    pub layout: DataLayout,
    #[serde(default)]
    pub context: ContextFallback,
    #[serde(default)]
    pub webdav: Option<WebDavRemote>,
}

/// Root directory template per data type; `{user_id}` is substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLayout {
    pub user: String,
    pub user_de: String,
    pub data: String,
    pub obb: String,
    pub media: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFallback {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavRemote {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/data/local/tmp/appvault/backup")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/data/local/tmp/appvault/tmp")
}

fn default_remote_dir() -> String {
    "appvault".to_string()
}

fn default_parallel_items() -> u32 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            compression_level: default_compression_level(),
            compression_test: true,
            follow_symlinks: false,
            clean_restoring: true,
            kill_app: true,
            restore_permissions: true,
            restore_ssaid: true,
            selection_type: SelectionType::default(),
            backup_dir: default_backup_dir(),
            tmp_dir: default_tmp_dir(),
            remote_dir: default_remote_dir(),
            parallel_items: default_parallel_items(),
            layout: DataLayout::default(),
            context: ContextFallback::default(),
            webdav: None,
        }
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            user: "/data/user/{user_id}".to_string(),
            user_de: "/data/user_de/{user_id}".to_string(),
            data: "/data/media/{user_id}/Android/data".to_string(),
            obb: "/data/media/{user_id}/Android/obb".to_string(),
            media: "/data/media/{user_id}/Android/media".to_string(),
        }
    }
}

impl Default for ContextFallback {
    fn default() -> Self {
        Self {
            from: "system_data_file".to_string(),
            to: "app_data_file".to_string(),
        }
    }
}

/// An app-owned location found under one of the layout roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTree {
    pub data_type: DataType,
    pub user_id: u32,
    pub package_name: String,
    pub root: PathBuf,
}

impl DataLayout {
    fn template(&self, data_type: DataType) -> Option<&str> {
        match data_type {
            DataType::Apk => None,
            DataType::User => Some(&self.user),
            DataType::UserDe => Some(&self.user_de),
            DataType::Data => Some(&self.data),
            DataType::Obb => Some(&self.obb),
            DataType::Media => Some(&self.media),
        }
    }

    /// Directory holding every package's tree for this data type. `None` for APK,
    /// whose source comes from the package manager.
    pub fn root(&self, data_type: DataType, user_id: u32) -> Option<PathBuf> {
        self.template(data_type)
            .map(|t| PathBuf::from(t.replace(USER_ID_PLACEHOLDER, &user_id.to_string())))
    }

    /// Finds the package whose tree contains `path`, if any.
    pub fn app_tree(&self, path: &Path) -> Option<AppTree> {
        let text = path.to_str()?;
        for data_type in DataType::PACKAGE_SLICES {
            let Some(template) = self.template(data_type) else {
                continue;
            };
            let Some((prefix, suffix)) = template.split_once(USER_ID_PLACEHOLDER) else {
                continue;
            };
            let Some(rest) = text.strip_prefix(prefix) else {
                continue;
            };
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            let Ok(user_id) = rest[..digits].parse::<u32>() else {
                continue;
            };
            let Some(rest) = rest[digits..].strip_prefix(suffix) else {
                continue;
            };
            let Some(package_name) = rest
                .strip_prefix('/')
                .and_then(|r| r.split('/').next())
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            let root = self.root(data_type, user_id)?;
            return Some(AppTree {
                data_type,
                user_id,
                package_name: package_name.to_string(),
                root,
            });
        }
        None
    }
}

impl Settings {
    pub fn compression_params(&self, compression: CompressionType) -> CompressionParams {
        CompressionParams {
            compression,
            level: self.compression_level,
        }
    }

    pub fn package_archive_dir(&self, item: &PackageItem) -> PathBuf {
        self.backup_dir
            .join("apps")
            .join(path_component(&item.package_name))
            .join(format!("user_{}", item.user_id))
    }

    pub fn medium_archive_dir(&self, item: &MediumItem) -> PathBuf {
        self.backup_dir.join("files").join(medium_dir_name(item))
    }

    pub fn package_remote_dir(&self, item: &PackageItem) -> String {
        remote_join(
            &self.remote_dir,
            &format!(
                "apps/{}/user_{}",
                path_component(&item.package_name),
                item.user_id
            ),
        )
    }

    pub fn medium_remote_dir(&self, item: &MediumItem) -> String {
        remote_join(&self.remote_dir, &format!("files/{}", medium_dir_name(item)))
    }

    /// Staging directory for cloud downloads of one item.
    pub fn download_staging_dir(&self, key: &str) -> PathBuf {
        self.tmp_dir.join("cloud").join(sanitize_component(key))
    }

    /// Extraction directory for one item's APKs; distinct per user so restores of
    /// the same package for different users never share it.
    pub fn apk_scratch_dir(&self, item: &PackageItem) -> PathBuf {
        self.tmp_dir
            .join("apks")
            .join(path_component(&item.package_name))
            .join(format!("user_{}", item.user_id))
    }
}

pub fn remote_join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Archive directory name of a medium. The display name alone is not unique, so
/// a short hash of the medium's path is appended.
pub fn medium_dir_name(item: &MediumItem) -> String {
    let hash = blake3::hash(item.path.as_os_str().as_encoded_bytes()).to_hex();
    format!("{}-{}", path_component(&item.name), &hash.as_str()[..12])
}

/// A single path component that can neither be absolute nor climb out of its parent.
fn path_component(s: &str) -> String {
    let sanitized = sanitize_component(s);
    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("settings.version is missing")),
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if !(-7..=22).contains(&settings.compression_level) {
        return Err(Error::InvalidConfig {
            message: format!(
                "compression_level must be within -7..=22 (got {})",
                settings.compression_level
            ),
        });
    }

    if settings.parallel_items < 1 {
        return Err(Error::InvalidConfig {
            message: "parallel_items must be >= 1".to_string(),
        });
    }

    if settings.backup_dir.as_os_str().is_empty() || settings.tmp_dir.as_os_str().is_empty() {
        return Err(Error::InvalidConfig {
            message: "backup_dir and tmp_dir must not be empty".to_string(),
        });
    }

    let layout = &settings.layout;
    for (name, template) in [
        ("layout.user", &layout.user),
        ("layout.user_de", &layout.user_de),
        ("layout.data", &layout.data),
        ("layout.obb", &layout.obb),
        ("layout.media", &layout.media),
    ] {
        if !template.contains(USER_ID_PLACEHOLDER) {
            return Err(Error::InvalidConfig {
                message: format!("{name} must contain {USER_ID_PLACEHOLDER}"),
            });
        }
    }

    if settings.context.from.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "context.from must not be empty".to_string(),
        });
    }

    if let Some(webdav) = &settings.webdav {
        let url = webdav.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::InvalidConfig {
                message: "webdav.url must start with http:// or https://".to_string(),
            });
        }
    }

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let s = parse_settings("version = 1\n").unwrap();
        assert_eq!(s.compression_level, 3);
        assert!(s.compression_test);
        assert!(s.clean_restoring);
        assert!(s.kill_app);
        assert!(s.restore_permissions && s.restore_ssaid);
        assert!(!s.follow_symlinks);
        assert_eq!(s.selection_type, SelectionType::Default);
        assert_eq!(s.parallel_items, 1);
        assert_eq!(s.context.from, "system_data_file");
        assert!(s.webdav.is_none());
        validate_settings(&s).unwrap();
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = parse_settings("version = 9\n").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
        assert!(parse_settings("compression_level = 3\n").is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut s = Settings::default();
        s.parallel_items = 0;
        assert!(validate_settings(&s).is_err());

        let mut s = Settings::default();
        s.layout.user = "/data/user/0".to_string();
        assert!(validate_settings(&s).is_err());

        let mut s = Settings::default();
        s.webdav = Some(WebDavRemote {
            url: "ftp://nope".to_string(),
            username: None,
            password: None,
        });
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let temp = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.selection_type = SelectionType::Both;
        s.compression_test = false;
        s.backup_dir = temp.path().join("backup");
        save_settings(temp.path(), &s).unwrap();

        let loaded = load_settings(temp.path()).unwrap();
        assert_eq!(loaded.selection_type, SelectionType::Both);
        assert!(!loaded.compression_test);
        assert_eq!(loaded.backup_dir, temp.path().join("backup"));
        assert!(!config_path(temp.path()).with_extension("tmp").exists());
    }

    #[test]
    fn layout_roots_substitute_user_id() {
        let layout = DataLayout::default();
        assert_eq!(
            layout.root(DataType::UserDe, 10),
            Some(PathBuf::from("/data/user_de/10"))
        );
        assert_eq!(
            layout.root(DataType::Obb, 0),
            Some(PathBuf::from("/data/media/0/Android/obb"))
        );
        assert_eq!(layout.root(DataType::Apk, 0), None);
    }

    #[test]
    fn app_tree_detects_owning_package() {
        let layout = DataLayout::default();
        let tree = layout
            .app_tree(Path::new("/data/media/0/Android/data/com.game/files/saves"))
            .unwrap();
        assert_eq!(tree.data_type, DataType::Data);
        assert_eq!(tree.user_id, 0);
        assert_eq!(tree.package_name, "com.game");
        assert_eq!(tree.root, PathBuf::from("/data/media/0/Android/data"));

        assert!(layout.app_tree(Path::new("/sdcard/Music")).is_none());
        assert!(layout.app_tree(Path::new("/data/user/0")).is_none());
    }

    #[test]
    fn archive_dirs_follow_item_identity() {
        let s = Settings::default();
        let item = PackageItem::new("com.app", 10);
        assert_eq!(
            s.package_archive_dir(&item),
            s.backup_dir.join("apps/com.app/user_10")
        );
        assert_eq!(s.package_remote_dir(&item), "appvault/apps/com.app/user_10");
        assert_eq!(remote_join("a/", "/b"), "a/b");
        assert_eq!(remote_join("", "b"), "b");
    }

    #[test]
    fn medium_dirs_stay_inside_backup_dir_and_apart() {
        let s = Settings::default();
        let files = s.backup_dir.join("files");

        let a = MediumItem::new("/sdcard/A/Camera", "Camera");
        let b = MediumItem::new("/sdcard/B/Camera", "Camera");
        assert_ne!(s.medium_archive_dir(&a), s.medium_archive_dir(&b));
        assert_ne!(s.medium_remote_dir(&a), s.medium_remote_dir(&b));
        assert!(medium_dir_name(&a).starts_with("Camera-"));
        assert_eq!(s.medium_archive_dir(&a), s.medium_archive_dir(&a.clone()));

        for name in ["/sdcard/DCIM", "..", "../../etc", ""] {
            let item = MediumItem::new("/sdcard/DCIM", name);
            let dir = s.medium_archive_dir(&item);
            assert_eq!(dir.parent(), Some(files.as_path()), "{name:?} -> {dir:?}");
            assert!(!s.medium_remote_dir(&item).contains(".."), "{name:?}");
        }
    }

    #[test]
    fn apk_scratch_is_per_user() {
        let s = Settings::default();
        let owner = PackageItem::new("com.app", 0);
        let work = PackageItem::new("com.app", 10);
        assert_ne!(s.apk_scratch_dir(&owner), s.apk_scratch_dir(&work));
        assert_eq!(
            s.apk_scratch_dir(&work),
            s.tmp_dir.join("apks/com.app/user_10")
        );
    }
}
