#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use appvault_core::{
    ArchiveCodec, ArchiveProgress, ArchiveSource, CloudClient, CompressionParams, DataLayout,
    DataType, Engine, EngineContext, Error, ExtractOptions, InMemoryPackageManager,
    InMemoryRecordStore, InMemorySecurityContext, ItemId, OperationRecord, PackageItem,
    PackageSelection, RecordStore, Result, Settings, StepOutput, TarCodec, TransferProgress,
};
use tempfile::TempDir;

pub const PKG: &str = "com.example.notes";
pub const APP_UID: u32 = 10_234;

pub fn write_file(path: &Path, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

pub struct Fixture {
    pub temp: TempDir,
    pub settings: Settings,
    pub store: Arc<InMemoryRecordStore>,
    pub packages: Arc<InMemoryPackageManager>,
    pub security: Arc<InMemorySecurityContext>,
}

impl Fixture {
    /// Device layout, backup dir and scratch dir all live under one tempdir.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let base = temp.path().display().to_string();
        let mut settings = Settings::default();
        settings.backup_dir = temp.path().join("backup");
        settings.tmp_dir = temp.path().join("tmp");
        settings.layout = DataLayout {
            user: format!("{base}/data/user/{{user_id}}"),
            user_de: format!("{base}/data/user_de/{{user_id}}"),
            data: format!("{base}/media/{{user_id}}/Android/data"),
            obb: format!("{base}/media/{{user_id}}/Android/obb"),
            media: format!("{base}/media/{{user_id}}/Android/media"),
        };
        Self {
            temp,
            settings,
            store: Arc::new(InMemoryRecordStore::new()),
            packages: Arc::new(InMemoryPackageManager::new()),
            security: Arc::new(InMemorySecurityContext::new()),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn root(&self, data_type: DataType) -> PathBuf {
        self.settings.layout.root(data_type, 0).unwrap()
    }

    pub fn app_dir(&self, data_type: DataType) -> PathBuf {
        self.root(data_type).join(PKG)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.settings.package_archive_dir(&PackageItem::new(PKG, 0))
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new(
            self.settings.clone(),
            self.store.clone(),
            self.packages.clone(),
            self.security.clone(),
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.context())
    }

    pub fn engine_with_codec(&self, codec: Arc<dyn ArchiveCodec>) -> Engine {
        Engine::new(self.context().with_codec(codec))
    }

    /// An installed app with a base APK, user data and user_de data.
    pub async fn install_app(&self) -> PathBuf {
        let apk_dir = self.path().join("app").join(format!("{PKG}-1"));
        write_file(&apk_dir.join("base.apk"), b"base apk bytes");
        write_file(&apk_dir.join("lib/arm64/libnotes.so"), b"native");
        self.packages
            .add_package(PKG, 0, APP_UID, Some(apk_dir.clone()))
            .await;

        let user = self.app_dir(DataType::User);
        write_file(&user.join("files/notes.db"), &[7u8; 4096]);
        write_file(&user.join("shared_prefs/prefs.xml"), b"<map/>");
        write_file(&user.join("cache/thumb.bin"), &[1u8; 512]);
        write_file(&user.join("code_cache/jit.bin"), b"jit");

        let user_de = self.app_dir(DataType::UserDe);
        write_file(&user_de.join("files/boot.txt"), b"direct boot");
        apk_dir
    }

    pub async fn record(&self, run_id: &str, item: &PackageItem, dt: DataType) -> OperationRecord {
        self.store
            .operation(run_id, &item.id(), dt)
            .await
            .unwrap()
            .unwrap()
    }
}

pub fn only(data_types: &[DataType]) -> PackageSelection {
    let mut selection = PackageSelection::default();
    for dt in data_types {
        match dt {
            DataType::Apk => selection.apk = true,
            DataType::User => selection.user = true,
            DataType::UserDe => selection.user_de = true,
            DataType::Data => selection.data = true,
            DataType::Obb => selection.obb = true,
            DataType::Media => selection.media = true,
        }
    }
    selection
}

pub fn package(selection: PackageSelection) -> PackageItem {
    let mut item = PackageItem::new(PKG, 0);
    item.selection = selection;
    item
}

/// Wraps [`TarCodec`], counting compress calls and optionally failing every test.
#[derive(Default)]
pub struct SpyCodec {
    inner: TarCodec,
    pub compress_calls: AtomicUsize,
    pub fail_test: AtomicBool,
}

impl SpyCodec {
    pub fn compress_calls(&self) -> usize {
        self.compress_calls.load(Ordering::SeqCst)
    }
}

impl ArchiveCodec for SpyCodec {
    fn compress(
        &self,
        source: &ArchiveSource,
        dst: &Path,
        exclusions: &[String],
        follow_symlinks: bool,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput {
        self.compress_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .compress(source, dst, exclusions, follow_symlinks, params, on_progress)
    }

    fn decompress(
        &self,
        src: &Path,
        dst_dir: &Path,
        exclusions: &[String],
        options: ExtractOptions,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput {
        self.inner
            .decompress(src, dst_dir, exclusions, options, params, on_progress)
    }

    fn test(&self, src: &Path, params: CompressionParams) -> StepOutput {
        if self.fail_test.load(Ordering::SeqCst) {
            return StepOutput::line(false, "unexpected end of archive");
        }
        self.inner.test(src, params)
    }
}

/// Remote whose uploads always fail.
pub struct UnreachableCloud;

impl CloudClient for UnreachableCloud {
    fn provider(&self) -> &'static str {
        "unreachable"
    }

    fn exists<'a>(
        &'a self,
        _remote_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async {
            Err(Error::Cloud {
                message: "connection refused".to_string(),
            })
        })
    }

    fn upload<'a>(
        &'a self,
        _local: &'a Path,
        _remote_dir: &'a str,
        _on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async {
            Err(Error::Cloud {
                message: "connection refused".to_string(),
            })
        })
    }

    fn download<'a>(
        &'a self,
        _remote_path: &'a str,
        _local_dir: &'a Path,
        _on_progress: TransferProgress<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async {
            Err(Error::Cloud {
                message: "connection refused".to_string(),
            })
        })
    }
}

pub fn item_id() -> ItemId {
    ItemId::package(PKG, 0)
}
