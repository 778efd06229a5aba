use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One archive-able slice of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Apk,
    User,
    UserDe,
    Data,
    Obb,
    Media,
}

impl DataType {
    /// Processing order for the slices of a package item.
    pub const PACKAGE_SLICES: [DataType; 6] = [
        DataType::Apk,
        DataType::User,
        DataType::UserDe,
        DataType::Data,
        DataType::Obb,
        DataType::Media,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::User => "user",
            Self::UserDe => "user_de",
            Self::Data => "data",
            Self::Obb => "obb",
            Self::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "apk" => Some(Self::Apk),
            "user" => Some(Self::User),
            "user_de" => Some(Self::UserDe),
            "data" => Some(Self::Data),
            "obb" => Some(Self::Obb),
            "media" => Some(Self::Media),
            _ => None,
        }
    }

    /// A missing USER source or archive is fatal; every other slice may be absent.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::User)
    }

    /// Slices living in shared storage, whose files carry the root directory's group.
    pub fn is_shared_storage(self) -> bool {
        matches!(self, Self::Data | Self::Obb | Self::Media)
    }

    /// Tar-style exclusion patterns for a package's tree under this slice's root.
    pub fn exclusions(self, package_name: &str) -> Vec<String> {
        match self {
            Self::Apk => Vec::new(),
            Self::User | Self::UserDe => [".ota", "cache", "lib", "code_cache", "no_backup"]
                .iter()
                .map(|name| format!("{package_name}/{name}"))
                .collect(),
            Self::Data | Self::Obb | Self::Media => {
                vec![format!("{package_name}/cache"), "Backup_*".to_string()]
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Tar,
    #[default]
    Zstd,
    Lz4,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }

    /// File suffix after the data type name; part of the on-disk layout.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zstd => "tar.zst",
            Self::Lz4 => "tar.lz4",
        }
    }

    /// Unknown names fall back to zstd.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "tar" => Self::Tar,
            "lz4" => Self::Lz4,
            _ => Self::Zstd,
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        [Self::Tar, Self::Zstd, Self::Lz4]
            .into_iter()
            .find(|ct| ct.suffix() == suffix)
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{dst_dir}/{data_type}.{suffix}`; backup writes it and restore reads it back.
pub fn archive_dst(dst_dir: &Path, data_type: DataType, compression: CompressionType) -> PathBuf {
    dst_dir.join(format!("{}.{}", data_type.as_str(), compression.suffix()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Pending,
    Processing,
    Skip,
    Done,
    Error,
    Uploading,
    Downloading,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Skip => "skip",
            Self::Done => "done",
            Self::Error => "error",
            Self::Uploading => "uploading",
            Self::Downloading => "downloading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "skip" => Some(Self::Skip),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "uploading" => Some(Self::Uploading),
            "downloading" => Some(Self::Downloading),
            _ => None,
        }
    }

    /// Forward edges of the per-run slice state machine. Staying in place is always allowed.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Processing | Skip | Error | Downloading)
                | (Downloading, Processing | Skip | Error)
                | (Processing, Skip | Done | Error)
                | (Done, Uploading)
                | (Uploading, Done | Error)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of one slice in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub state: OperationState,
    pub bytes: u64,
    pub log: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn package(package_name: &str, user_id: u32) -> Self {
        Self(format!("package:{package_name}@{user_id}"))
    }

    pub fn medium(path: &Path) -> Self {
        Self(format!("medium:{}", path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSelection {
    pub apk: bool,
    pub user: bool,
    pub user_de: bool,
    pub data: bool,
    pub obb: bool,
    pub media: bool,
}

impl PackageSelection {
    pub fn all() -> Self {
        Self {
            apk: true,
            user: true,
            user_de: true,
            data: true,
            obb: true,
            media: true,
        }
    }

    pub fn get(&self, data_type: DataType) -> bool {
        match data_type {
            DataType::Apk => self.apk,
            DataType::User => self.user,
            DataType::UserDe => self.user_de,
            DataType::Data => self.data,
            DataType::Obb => self.obb,
            DataType::Media => self.media,
        }
    }
}

/// Global override of per-item selection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionType {
    #[default]
    Default,
    Apk,
    Data,
    Both,
}

impl SelectionType {
    pub fn selects(self, flags: &PackageSelection, data_type: DataType) -> bool {
        match self {
            Self::Default => flags.get(data_type),
            Self::Apk => data_type == DataType::Apk,
            Self::Data => data_type != DataType::Apk,
            Self::Both => true,
        }
    }
}

/// Recorded source sizes from the last successful backup, per slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceBytes {
    pub apk: u64,
    pub user: u64,
    pub user_de: u64,
    pub data: u64,
    pub obb: u64,
    pub media: u64,
}

impl SliceBytes {
    pub fn get(&self, data_type: DataType) -> u64 {
        match data_type {
            DataType::Apk => self.apk,
            DataType::User => self.user,
            DataType::UserDe => self.user_de,
            DataType::Data => self.data,
            DataType::Obb => self.obb,
            DataType::Media => self.media,
        }
    }

    pub fn set(&mut self, data_type: DataType, bytes: u64) {
        let slot = match data_type {
            DataType::Apk => &mut self.apk,
            DataType::User => &mut self.user,
            DataType::UserDe => &mut self.user_de,
            DataType::Data => &mut self.data,
            DataType::Obb => &mut self.obb,
            DataType::Media => &mut self.media,
        };
        *slot = bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageItem {
    pub package_name: String,
    pub user_id: u32,
    #[serde(default)]
    pub compression: CompressionType,
    #[serde(default)]
    pub selection: PackageSelection,
    #[serde(default)]
    pub recorded: SliceBytes,
}

impl PackageItem {
    pub fn new(package_name: impl Into<String>, user_id: u32) -> Self {
        Self {
            package_name: package_name.into(),
            user_id,
            compression: CompressionType::default(),
            selection: PackageSelection::all(),
            recorded: SliceBytes::default(),
        }
    }

    pub fn id(&self) -> ItemId {
        ItemId::package(&self.package_name, self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumItem {
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub compression: CompressionType,
    #[serde(default = "default_true")]
    pub selected: bool,
    #[serde(default)]
    pub recorded_bytes: u64,
}

fn default_true() -> bool {
    true
}

impl MediumItem {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            compression: CompressionType::default(),
            selected: true,
            recorded_bytes: 0,
        }
    }

    pub fn id(&self) -> ItemId {
        ItemId::medium(&self.path)
    }
}

/// One runtime permission and whether the user granted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePermission {
    pub name: String,
    pub granted: bool,
}

impl RuntimePermission {
    pub fn new(name: impl Into<String>, granted: bool) -> Self {
        Self {
            name: name.into(),
            granted,
        }
    }
}

/// Captured output of one step: success flag plus diagnostic lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub success: bool,
    pub lines: Vec<String>,
}

impl StepOutput {
    pub fn ok(lines: Vec<String>) -> Self {
        Self {
            success: true,
            lines,
        }
    }

    pub fn failed(lines: Vec<String>) -> Self {
        Self {
            success: false,
            lines,
        }
    }

    pub fn line(success: bool, line: impl Into<String>) -> Self {
        Self {
            success,
            lines: vec![line.into()],
        }
    }
}

/// Human-readable size, e.g. `1.50 MB`.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} Bytes")
    } else if b < KB * KB {
        format!("{:.2} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.2} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}
