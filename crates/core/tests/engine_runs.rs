mod common;

use std::sync::Arc;

use appvault_core::{
    DataType, Engine, EngineContext, MediumItem, OperationState, PackageItem, RecordStore,
    RunKind, RunOptions, SqliteRecordStore, channel_progress,
};
use common::{APP_UID, Fixture, PKG, item_id, only, package, write_file};
use tokio_util::sync::CancellationToken;

fn media_items(fx: &Fixture) -> Vec<MediumItem> {
    ["Music", "Movies", "Missing", "Documents"]
        .into_iter()
        .map(|name| {
            let src = fx.path().join("sdcard").join(name);
            if name != "Missing" {
                write_file(&src.join(format!("{name}.bin")), name.as_bytes());
            }
            MediumItem::new(src, name)
        })
        .collect()
}

#[tokio::test]
async fn parallel_run_reports_items_in_input_order() {
    let mut fx = Fixture::new();
    fx.settings.parallel_items = 3;
    let items = media_items(&fx);
    let ids: Vec<_> = items.iter().map(MediumItem::id).collect();

    let report = fx
        .engine()
        .backup_media("run1", items, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.kind, RunKind::Backup);
    assert_eq!(report.run_id, "run1");
    let reported: Vec<_> = report.items.iter().map(|i| i.item_id.clone()).collect();
    assert_eq!(reported, ids);
    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(report.summary.failed, 1);
    assert!(!report.items[2].succeeded());
}

#[tokio::test]
async fn sqlite_records_survive_a_restart() {
    let fx = Fixture::new();
    fx.install_app().await;
    let db_path = fx.path().join("data/records.sqlite");
    let item = package(only(&[DataType::User]));

    let store = Arc::new(SqliteRecordStore::open(&db_path).await.unwrap());
    let engine = Engine::new(EngineContext::new(
        fx.settings.clone(),
        store.clone(),
        fx.packages.clone(),
        fx.security.clone(),
    ));
    let report = engine
        .backup_packages("run1", vec![item.clone()], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.items[0].slice(DataType::User).unwrap().state,
        OperationState::Done
    );
    let record = store
        .operation("run1", &item_id(), DataType::User)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, OperationState::Done);
    store.pool().close().await;
    drop(engine);

    let store = Arc::new(SqliteRecordStore::open(&db_path).await.unwrap());
    assert!(
        store
            .previous_bytes(&item_id(), DataType::User)
            .await
            .unwrap()
            .is_some()
    );
    let engine = Engine::new(EngineContext::new(
        fx.settings.clone(),
        store.clone(),
        fx.packages.clone(),
        fx.security.clone(),
    ));
    let report = engine
        .backup_packages("run2", vec![item], RunOptions::default())
        .await
        .unwrap();
    let user = report.items[0].slice(DataType::User).unwrap();
    assert_eq!(user.state, OperationState::Skip);
    assert_eq!(user.log, vec!["Data has not changed."]);
    assert_eq!(
        store
            .operation("run2", &item_id(), DataType::User)
            .await
            .unwrap()
            .map(|r| r.state),
        Some(OperationState::Skip)
    );
}

#[tokio::test]
async fn cancelled_run_touches_nothing() {
    let fx = Fixture::new();
    fx.install_app().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = fx
        .engine()
        .backup_packages(
            "run1",
            vec![package(only(&[DataType::User]))],
            RunOptions {
                cancel: Some(cancel),
                gateway: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.summary.cancelled, 1);
    assert!(report.items[0].cancelled);
    assert!(report.items[0].slices.is_empty());
    assert!(!fx.archive_dir().join("user.tar.zst").exists());
    assert_eq!(fx.store.write_count().await, 0);
}

#[tokio::test]
async fn progress_follows_each_slice_through_its_states() {
    let fx = Fixture::new();
    fx.install_app().await;
    let (sink, mut rx) = channel_progress(1024);
    let sink = Arc::new(sink);
    let engine = Engine::new(fx.context().with_progress(sink.clone()));

    engine
        .backup_packages(
            "run1",
            vec![package(only(&[DataType::User]))],
            RunOptions::default(),
        )
        .await
        .unwrap();
    drop(engine);

    let mut user_phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.item_id, item_id().to_string());
        if event.data_type == Some(DataType::User) {
            user_phases.push(event.phase);
        }
    }
    assert_eq!(sink.dropped(), 0);
    let states: Vec<_> = user_phases
        .iter()
        .filter(|p| p.starts_with("slice."))
        .map(String::as_str)
        .collect();
    assert_eq!(states, ["slice.pending", "slice.processing", "slice.done"]);
    assert!(user_phases.iter().any(|p| p == "archive.compress"));
    assert!(fx.path().join("backup/apps").join(PKG).exists());
}

#[tokio::test]
async fn one_package_for_two_users_restores_in_parallel() {
    let mut fx = Fixture::new();
    fx.settings.parallel_items = 2;
    fx.install_app().await;
    let work_apks = fx.path().join("app/work");
    write_file(&work_apks.join("base.apk"), b"work profile apk");
    fx.packages
        .add_package(PKG, 10, 1_000_000 + APP_UID, Some(work_apks))
        .await;
    let work_user = fx.settings.layout.root(DataType::User, 10).unwrap().join(PKG);
    write_file(&work_user.join("files/notes.db"), &[5u8; 2048]);

    let items: Vec<PackageItem> = [0, 10]
        .into_iter()
        .map(|user_id| {
            let mut item = PackageItem::new(PKG, user_id);
            item.selection = only(&[DataType::Apk, DataType::User]);
            item
        })
        .collect();
    let engine = fx.engine();
    let report = engine
        .backup_packages("backup", items.clone(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.summary.succeeded, 2);

    for user_dir in [fx.app_dir(DataType::User), work_user.clone()] {
        fx.security
            .set_context(&user_dir, "u:object_r:app_data_file:s0");
    }
    let report = engine
        .restore_packages("restore", items.clone(), RunOptions::default())
        .await
        .unwrap();
    for item in &report.items {
        assert!(item.succeeded(), "{item:?}");
    }

    let mut scratch_dirs: Vec<_> = fx
        .packages
        .installed_apks()
        .await
        .iter()
        .filter_map(|apk| apk.parent().map(|p| p.to_path_buf()))
        .collect();
    scratch_dirs.sort();
    let mut expected: Vec<_> = items.iter().map(|i| fx.settings.apk_scratch_dir(i)).collect();
    expected.sort();
    assert_eq!(scratch_dirs, expected);
    assert_eq!(
        std::fs::read(work_user.join("files/notes.db")).unwrap(),
        vec![5u8; 2048]
    );
}
