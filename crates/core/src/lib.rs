mod archive;
mod cloud;
pub mod config;
mod engine;
mod error;
mod medium;
mod model;
mod package_config;
mod package_manager;
mod packages;
mod progress;
mod record_db;
mod record_store;
mod run;
pub mod run_log;
mod security;
mod size;
mod slice;
mod transfer;
mod verify;

pub const APP_NAME: &str = "AppVault";

pub use archive::{
    ArchiveCodec, ArchiveSource, CompressionParams, ExclusionSet, ExtractOptions, TarCodec,
    parse_tool_progress,
};
pub use cloud::{CloudClient, DirectoryCloudClient, TransferProgress, WebDavClient};
pub use config::{AppTree, ContextFallback, DataLayout, Settings, WebDavRemote};
pub use engine::{DirGuard, DirLocks, EngineContext};
pub use error::{Error, Result};
pub use medium::MediumOrchestrator;
pub use model::{
    CompressionType, DataType, ItemId, MediumItem, OperationRecord, OperationState,
    PackageItem, PackageSelection, RuntimePermission, SelectionType, SliceBytes, StepOutput,
    archive_dst, format_size,
};
pub use package_config::{
    PACKAGE_CONFIG_FILE, PackageConfig, package_config_path, read_package_config,
    write_package_config,
};
pub use package_manager::{
    InMemoryPackageManager, PackageManager, ShellPackageManager, parse_runtime_permissions,
    parse_ssaid, replace_ssaid,
};
pub use packages::{ItemOptions, PackageOrchestrator};
pub use progress::{
    ArchiveProgress, ChannelProgressSink, ProgressSink, TaskProgress, channel_progress,
};
pub use record_db::{SqliteRecordStore, open_record_db};
pub use record_store::{InMemoryRecordStore, RecordStore};
pub use run::{Engine, RunKind, RunOptions, RunReport, RunSummary};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use security::LinuxSecurityContext;
pub use security::{ContextRestorer, InMemorySecurityContext, SecurityContext};
pub use size::{calculate_size, measure};
pub use slice::{
    CODE_ABSENT, CODE_FAILED, CODE_OK, ItemReport, SliceOutcome, SliceReporter,
};
pub use transfer::{Download, TransferGateway};
pub use verify::IntegrityVerifier;
