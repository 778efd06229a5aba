mod common;

use std::sync::Arc;
use std::time::Duration;

use appvault_core::config::remote_join;
use appvault_core::{
    CODE_ABSENT, CODE_FAILED, DataType, DirectoryCloudClient, OperationState, PACKAGE_CONFIG_FILE,
    PackageItem, PackageSelection, RunOptions, RuntimePermission, TransferGateway,
};
use common::{APP_UID, Fixture, PKG, item_id, only, package, write_file};

const SHARED_GID: u32 = 1078;

async fn back_up(fx: &Fixture, item: &PackageItem) {
    let report = fx
        .engine()
        .backup_packages("backup", vec![item.clone()], RunOptions::default())
        .await
        .unwrap();
    assert!(report.items[0].succeeded(), "{:?}", report.items[0]);
}

fn file_names(paths: &[std::path::PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn full_restore_reinstalls_and_hands_data_back_to_the_app() {
    let fx = Fixture::new();
    fx.install_app().await;
    write_file(&fx.app_dir(DataType::Data).join("files/export.csv"), b"a,b\n1,2\n");
    let item = package(PackageSelection::all());
    back_up(&fx, &item).await;

    let user = fx.app_dir(DataType::User);
    write_file(&user.join("files/stale.txt"), b"written after the backup");
    std::fs::write(user.join("files/notes.db"), b"corrupted").unwrap();
    write_file(&user.join("cache/fresh.bin"), b"cache written after the backup");

    fx.security
        .set_context(&user, "u:object_r:app_data_file:s0:c234,c256,c512,c768");
    fx.security
        .set_context(fx.root(DataType::UserDe), "u:object_r:system_data_file:s0");
    fx.security
        .set_context(fx.app_dir(DataType::Data), "u:object_r:media_rw_data_file:s0");
    fx.security.set_owner(fx.root(DataType::Data), 1023, SHARED_GID);

    let report = fx
        .engine()
        .restore_packages("restore", vec![item.clone()], RunOptions::default())
        .await
        .unwrap();
    let slices = &report.items[0];
    assert!(slices.succeeded(), "{slices:?}");
    for dt in [DataType::Apk, DataType::User, DataType::UserDe, DataType::Data] {
        assert_eq!(slices.slice(dt).unwrap().state, OperationState::Done, "{dt}");
    }
    for dt in [DataType::Obb, DataType::Media] {
        let slice = slices.slice(dt).unwrap();
        assert_eq!(slice.state, OperationState::Skip);
        assert_eq!(slice.code, CODE_ABSENT);
    }

    assert_eq!(file_names(&fx.packages.installed_apks().await), vec!["base.apk"]);
    assert!(!fx.settings.apk_scratch_dir(&item).exists());

    assert_eq!(std::fs::read(user.join("files/notes.db")).unwrap(), vec![7u8; 4096]);
    assert!(!user.join("files/stale.txt").exists());
    assert!(user.join("cache/fresh.bin").exists());
    assert!(user.join("shared_prefs/prefs.xml").exists());

    assert_eq!(fx.security.owner_of(&user), Some((APP_UID, APP_UID)));
    assert_eq!(
        fx.security.context_of(&user).as_deref(),
        Some("u:object_r:app_data_file:s0:c234,c256,c512,c768")
    );
    assert!(
        slices
            .slice(DataType::User)
            .unwrap()
            .log
            .iter()
            .any(|l| l.starts_with("Original context: "))
    );

    let user_de = fx.app_dir(DataType::UserDe);
    assert_eq!(
        fx.security.context_of(&user_de).as_deref(),
        Some("u:object_r:app_data_file:s0")
    );

    let data = fx.app_dir(DataType::Data);
    assert!(data.join("files/export.csv").exists());
    assert_eq!(fx.security.owner_of(&data), Some((APP_UID, SHARED_GID)));
}

#[tokio::test]
async fn restore_without_cleaning_keeps_extra_files() {
    let mut fx = Fixture::new();
    fx.settings.clean_restoring = false;
    fx.install_app().await;
    let item = package(only(&[DataType::User]));
    back_up(&fx, &item).await;

    let user = fx.app_dir(DataType::User);
    write_file(&user.join("files/extra.txt"), b"kept");
    fx.security.set_context(&user, "u:object_r:app_data_file:s0");

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    assert!(report.items[0].succeeded());
    assert!(user.join("files/extra.txt").exists());
}

#[tokio::test]
async fn split_apks_are_installed_in_one_session() {
    let fx = Fixture::new();
    let apk_dir = fx.install_app().await;
    write_file(&apk_dir.join("split_config.arm64_v8a.apk"), b"split bytes");
    let item = package(only(&[DataType::Apk]));
    back_up(&fx, &item).await;

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let apk = report.items[0].slice(DataType::Apk).unwrap();
    assert_eq!(apk.state, OperationState::Done, "{:?}", apk.log);
    assert_eq!(
        file_names(&fx.packages.installed_apks().await),
        vec!["base.apk", "split_config.arm64_v8a.apk"]
    );
    assert!(apk.log.iter().any(|l| l == "Success"));
}

#[tokio::test]
async fn uninstalled_package_aborts_the_remaining_slices() {
    let fx = Fixture::new();
    fx.install_app().await;
    let item = package(only(&[DataType::Apk, DataType::User]));
    back_up(&fx, &item).await;
    fx.packages.remove_package(PKG, 0).await;

    let report = fx
        .engine()
        .restore_packages("restore", vec![item.clone()], RunOptions::default())
        .await
        .unwrap();
    let slices = &report.items[0];

    let apk = slices.slice(DataType::Apk).unwrap();
    assert_eq!(apk.state, OperationState::Error);
    assert!(apk.abort_item);
    assert_eq!(
        apk.log.last().map(String::as_str),
        Some("Package com.example.notes is not installed, aborting the remaining slices.")
    );

    let user = slices.slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Skip);
    assert_eq!(user.log, vec![format!("Skipped: {PKG} is not installed.")]);
    assert_eq!(
        fx.store.states("restore", &item_id(), DataType::User).await,
        vec![OperationState::Pending, OperationState::Skip]
    );
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn package_registered_by_the_install_is_restored_normally() {
    let fx = Fixture::new();
    fx.install_app().await;
    let item = package(only(&[DataType::Apk, DataType::User]));
    back_up(&fx, &item).await;
    fx.packages.remove_package(PKG, 0).await;
    fx.packages.register_on_install(PKG, 0, 10_500).await;
    fx.security
        .set_context(fx.app_dir(DataType::User), "u:object_r:app_data_file:s0");

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    assert!(report.items[0].succeeded(), "{:?}", report.items[0]);
    assert_eq!(
        fx.security.owner_of(&fx.app_dir(DataType::User)),
        Some((10_500, 10_500))
    );
}

#[tokio::test]
async fn failed_install_is_an_error() {
    let fx = Fixture::new();
    fx.install_app().await;
    let item = package(only(&[DataType::Apk]));
    back_up(&fx, &item).await;
    fx.packages.set_install_succeeds(false).await;

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let apk = report.items[0].slice(DataType::Apk).unwrap();
    assert_eq!(apk.state, OperationState::Error);
    assert_eq!(apk.code, CODE_FAILED);
    assert!(apk.log.iter().any(|l| l.contains("INSTALL_FAILED")));
}

#[tokio::test]
async fn corrupt_archive_is_reported_and_left_in_place() {
    let fx = Fixture::new();
    fx.install_app().await;
    let item = package(only(&[DataType::User]));
    back_up(&fx, &item).await;

    let archive = fx.archive_dir().join("user.tar.zst");
    std::fs::write(&archive, b"definitely not zstd").unwrap();
    write_file(&fx.app_dir(DataType::User).join("files/local.txt"), b"untouched");

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let user = report.items[0].slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Error);
    assert!(archive.exists());
    assert!(fx.app_dir(DataType::User).join("files/local.txt").exists());
}

#[tokio::test]
async fn unknown_uid_fails_the_slice() {
    let fx = Fixture::new();
    fx.install_app().await;
    let item = package(only(&[DataType::User]));
    back_up(&fx, &item).await;
    fx.packages.remove_package(PKG, 0).await;

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let user = report.items[0].slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Error);
    assert_eq!(
        user.log.last().map(String::as_str),
        Some("Failed to get uid of com.example.notes.")
    );
}

#[tokio::test]
async fn missing_archives_split_into_errors_and_skips() {
    let fx = Fixture::new();
    fx.packages.add_package(PKG, 0, APP_UID, None).await;
    let item = package(only(&[DataType::User, DataType::Obb]));

    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let slices = &report.items[0];

    let user = slices.slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Error);
    assert_eq!(
        user.log,
        vec![format!(
            "Not exist: {}",
            fx.archive_dir().join("user.tar.zst").display()
        )]
    );

    let obb = slices.slice(DataType::Obb).unwrap();
    assert_eq!(obb.state, OperationState::Skip);
    assert_eq!(obb.code, CODE_ABSENT);
    assert_eq!(
        obb.log,
        vec![format!(
            "Not exist and skip: {}",
            fx.archive_dir().join("obb.tar.zst").display()
        )]
    );
}

#[tokio::test]
async fn cloud_restore_downloads_each_slice_first() {
    let fx = Fixture::new();
    fx.install_app().await;
    let remote = fx.path().join("remote");
    let gateway = TransferGateway::new(Arc::new(DirectoryCloudClient::new(&remote)))
        .with_tick(Duration::from_millis(10));
    let item = package(only(&[DataType::User, DataType::Obb]));

    fx.engine()
        .backup_packages(
            "backup",
            vec![item.clone()],
            RunOptions {
                cancel: None,
                gateway: Some(gateway.clone()),
            },
        )
        .await
        .unwrap();
    std::fs::remove_dir_all(fx.archive_dir()).unwrap();
    std::fs::remove_dir_all(fx.app_dir(DataType::User)).unwrap();
    fx.security
        .set_context(fx.root(DataType::User), "u:object_r:system_data_file:s0");

    let report = fx
        .engine()
        .restore_packages(
            "restore",
            vec![item.clone()],
            RunOptions {
                cancel: None,
                gateway: Some(gateway),
            },
        )
        .await
        .unwrap();
    let slices = &report.items[0];

    let user = slices.slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Done, "{:?}", user.log);
    assert!(fx.app_dir(DataType::User).join("files/notes.db").exists());
    let states = fx.store.states("restore", &item_id(), DataType::User).await;
    assert_eq!(
        states[..3],
        [
            OperationState::Pending,
            OperationState::Downloading,
            OperationState::Downloading
        ]
    );
    assert_eq!(states.last(), Some(&OperationState::Done));

    let obb = slices.slice(DataType::Obb).unwrap();
    assert_eq!(obb.state, OperationState::Skip);
    assert_eq!(obb.code, CODE_ABSENT);
    let remote_obb = remote_join(&fx.settings.package_remote_dir(&item), "obb.tar.zst");
    assert_eq!(
        obb.log,
        vec![format!(
            "Failed to connect to cloud or file not exist, skip: {remote_obb}"
        )]
    );
    assert!(!fx.settings.download_staging_dir(item_id().as_str()).exists());
}

fn camera(granted: bool) -> Vec<RuntimePermission> {
    vec![
        RuntimePermission::new("android.permission.CAMERA", granted),
        RuntimePermission::new("android.permission.RECORD_AUDIO", !granted),
    ]
}

#[tokio::test]
async fn permissions_and_ssaid_are_put_back_after_the_slices() {
    let fx = Fixture::new();
    fx.install_app().await;
    fx.packages.seed_permissions(PKG, 0, camera(true)).await;
    fx.packages.seed_ssaid(PKG, 0, "a1b2c3d4e5f60718").await;
    let item = package(only(&[DataType::Apk, DataType::User]));
    back_up(&fx, &item).await;
    fx.security
        .set_context(fx.app_dir(DataType::User), "u:object_r:app_data_file:s0");

    fx.packages.seed_permissions(PKG, 0, camera(false)).await;
    fx.packages.seed_ssaid(PKG, 0, "0000000000000000").await;
    let report = fx
        .engine()
        .restore_packages("restore", vec![item], RunOptions::default())
        .await
        .unwrap();
    let restored = &report.items[0];
    assert!(restored.succeeded(), "{restored:?}");
    assert_eq!(fx.packages.permissions_of(PKG, 0).await, camera(true));
    assert_eq!(
        fx.packages.ssaid_of(PKG, 0).await.as_deref(),
        Some("a1b2c3d4e5f60718")
    );
    assert!(restored.log.contains(&"Permissions size: 2.".to_string()));
    // One stop for the backup, one for the restore.
    assert_eq!(fx.packages.force_stopped().await.len(), 2);
}

#[tokio::test]
async fn restore_toggles_and_missing_config_leave_the_package_alone() {
    let mut fx = Fixture::new();
    fx.settings.restore_permissions = false;
    fx.install_app().await;
    fx.packages.seed_permissions(PKG, 0, camera(true)).await;
    fx.packages.seed_ssaid(PKG, 0, "a1b2c3d4e5f60718").await;
    let item = package(only(&[DataType::User]));
    back_up(&fx, &item).await;
    fx.security
        .set_context(fx.app_dir(DataType::User), "u:object_r:app_data_file:s0");

    fx.packages.seed_permissions(PKG, 0, camera(false)).await;
    fx.packages.seed_ssaid(PKG, 0, "0000000000000000").await;
    fx.engine()
        .restore_packages("restore", vec![item.clone()], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(fx.packages.permissions_of(PKG, 0).await, camera(false));
    assert_eq!(
        fx.packages.ssaid_of(PKG, 0).await.as_deref(),
        Some("a1b2c3d4e5f60718")
    );

    std::fs::remove_file(fx.archive_dir().join(PACKAGE_CONFIG_FILE)).unwrap();
    fx.packages.seed_ssaid(PKG, 0, "0000000000000000").await;
    let report = fx
        .engine()
        .restore_packages("again", vec![item], RunOptions::default())
        .await
        .unwrap();
    assert!(report.items[0].succeeded());
    assert_eq!(
        report.items[0].log.last().map(String::as_str),
        Some("No package config, skip permissions and ssaid.")
    );
    assert_eq!(
        fx.packages.ssaid_of(PKG, 0).await.as_deref(),
        Some("0000000000000000")
    );
}

#[tokio::test]
async fn package_config_travels_through_the_remote() {
    let fx = Fixture::new();
    fx.install_app().await;
    fx.packages.seed_ssaid(PKG, 0, "a1b2c3d4e5f60718").await;
    let remote = fx.path().join("remote");
    let gateway = TransferGateway::new(Arc::new(DirectoryCloudClient::new(&remote)))
        .with_tick(Duration::from_millis(10));
    let options = RunOptions {
        cancel: None,
        gateway: Some(gateway),
    };
    let item = package(only(&[DataType::User]));

    fx.engine()
        .backup_packages("backup", vec![item.clone()], options.clone())
        .await
        .unwrap();
    let remote_config = remote
        .join(fx.settings.package_remote_dir(&item))
        .join(PACKAGE_CONFIG_FILE);
    assert!(remote_config.exists());
    std::fs::remove_dir_all(fx.archive_dir()).unwrap();
    fx.security
        .set_context(fx.app_dir(DataType::User), "u:object_r:app_data_file:s0");

    fx.packages.seed_ssaid(PKG, 0, "0000000000000000").await;
    let report = fx
        .engine()
        .restore_packages("restore", vec![item], options)
        .await
        .unwrap();
    assert!(report.items[0].succeeded(), "{:?}", report.items[0]);
    assert_eq!(
        fx.packages.ssaid_of(PKG, 0).await.as_deref(),
        Some("a1b2c3d4e5f60718")
    );
    assert!(!fx.settings.download_staging_dir(item_id().as_str()).exists());
}
