mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use benchd_core::config::ImagerConfig;
use benchd_core::error::BenchError;
use benchd_core::events::Events;
use benchd_core::imager::{EntryKind, ImagerService, fs_ops};
use benchd_core::ops::OpOutcome;

use support::{CaptureSink, wait_until};

fn config(root: &Path) -> ImagerConfig {
    ImagerConfig {
        kind: "cf-reader".into(),
        root_dir: root.to_path_buf(),
        read_script: "cf-read.sh".into(),
        write_script: "cf-write.sh".into(),
        max_entries: 500,
        fs_poll_ms: 0,
        visible_extensions: Vec::new(),
    }
}

async fn service(root: &Path) -> (Arc<ImagerService>, Arc<CaptureSink>) {
    let capture = CaptureSink::new();
    let events = Events::new(vec![capture.clone()]);
    let service = ImagerService::new(config(root), events).unwrap();
    (service, capture)
}

async fn touch(path: &Path) {
    tokio::fs::write(path, b"x").await.unwrap();
}

#[tokio::test]
async fn list_hides_sidecars_and_strips_extensions() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("boot.img")).await;
    touch(&dir.path().join("boot.part")).await;
    touch(&dir.path().join("games.img")).await;
    tokio::fs::create_dir(dir.path().join("archive")).await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    let outcome = service.list("").unwrap().wait().await;
    let OpOutcome::Completed(value) = outcome else {
        panic!("list failed: {outcome:?}");
    };

    let names: Vec<String> = value["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["archive", "boot", "games"]);
    assert!(
        value["entries"]
            .as_array()
            .unwrap()
            .iter()
            .all(|e| !e["name"].as_str().unwrap().ends_with(".part"))
    );

    service.stop().await;
}

#[tokio::test]
async fn list_orders_dirs_before_files_on_name_tie() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("alpha.img")).await;
    tokio::fs::create_dir(dir.path().join("alpha")).await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    let OpOutcome::Completed(value) = service.list("").unwrap().wait().await else {
        panic!("list failed");
    };
    let entries = value["entries"].as_array().unwrap();
    assert_eq!(entries[0]["name"], "alpha");
    assert_eq!(entries[0]["kind"], "dir");
    assert_eq!(entries[1]["kind"], "file");

    service.stop().await;
}

#[tokio::test]
async fn root_escape_is_rejected_without_fs_access() {
    let dir = tempfile::tempdir().unwrap();
    let (service, capture) = service(dir.path()).await;

    let err = service.list("..").unwrap_err();
    match err {
        BenchError::Protocol(msg) => assert!(msg.contains("escapes root")),
        other => panic!("expected protocol error, got {other:?}"),
    }
    // Nothing was enqueued, nothing emitted.
    assert_eq!(capture.count_tag("op-queued"), 0);

    service.stop().await;
}

#[tokio::test]
async fn rename_moves_the_whole_image_group() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("a.img")).await;
    touch(&dir.path().join("a.part")).await;

    let (service, capture) = service(dir.path()).await;
    // Seed the watchdog's last snapshot so the rename delta is the only
    // fs-updated emission we count.
    service.list("").unwrap().wait().await;
    let fs_updates_before = capture.count_tag("fs-updated");

    let outcome = service.rename("a", "b").unwrap().wait().await;
    assert!(matches!(outcome, OpOutcome::Completed(_)));

    assert!(dir.path().join("b.img").exists());
    assert!(dir.path().join("b.part").exists());
    assert!(!dir.path().join("a.img").exists());
    assert!(!dir.path().join("a.part").exists());

    wait_until("fs refresh", Duration::from_secs(1), || {
        capture.count_tag("fs-updated") == fs_updates_before + 1
    })
    .await;

    service.stop().await;
}

#[tokio::test]
async fn rename_never_overwrites_an_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("a.img")).await;
    tokio::fs::write(dir.path().join("b.img"), b"precious").await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    let OpOutcome::Completed(value) = service.rename("a", "b").unwrap().wait().await else {
        panic!("rename errored");
    };
    assert_eq!(value["changed"], false);
    assert_eq!(
        tokio::fs::read(dir.path().join("b.img")).await.unwrap(),
        b"precious"
    );
    assert!(dir.path().join("a.img").exists());

    service.stop().await;
}

#[tokio::test]
async fn delete_removes_both_group_legs() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("old.img")).await;
    touch(&dir.path().join("old.part")).await;

    let (service, _capture) = service(dir.path()).await;
    let outcome = service.delete("old").unwrap().wait().await;
    assert!(matches!(outcome, OpOutcome::Completed(_)));
    assert!(!dir.path().join("old.img").exists());
    assert!(!dir.path().join("old.part").exists());

    service.stop().await;
}

#[tokio::test]
async fn delete_missing_entry_is_a_silent_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _capture) = service(dir.path()).await;

    let OpOutcome::Completed(value) = service.delete("ghost").unwrap().wait().await else {
        panic!("delete errored");
    };
    assert_eq!(value["changed"], false);

    service.stop().await;
}

#[tokio::test]
async fn mkdir_existing_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir(dir.path().join("images")).await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    let OpOutcome::Completed(value) = service.make_directory("images").unwrap().wait().await
    else {
        panic!("mkdir errored");
    };
    assert_eq!(value["changed"], false);

    let OpOutcome::Completed(value) = service.make_directory("fresh").unwrap().wait().await
    else {
        panic!("mkdir errored");
    };
    assert_eq!(value["changed"], true);
    assert!(dir.path().join("fresh").is_dir());

    service.stop().await;
}

#[tokio::test]
async fn move_relocates_group_into_subdir() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("dos.img")).await;
    touch(&dir.path().join("dos.part")).await;
    tokio::fs::create_dir(dir.path().join("archive")).await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    let outcome = service.move_to("dos", "archive").unwrap().wait().await;
    assert!(matches!(outcome, OpOutcome::Completed(_)));
    assert!(dir.path().join("archive/dos.img").exists());
    assert!(dir.path().join("archive/dos.part").exists());
    assert!(!dir.path().join("dos.img").exists());

    service.stop().await;
}

#[tokio::test]
async fn cwd_resets_to_root_when_directory_vanishes() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir(dir.path().join("work")).await.unwrap();

    let (service, _capture) = service(dir.path()).await;
    service.list("work").unwrap().wait().await;
    assert_eq!(service.cwd(), "work");

    tokio::fs::remove_dir(dir.path().join("work")).await.unwrap();
    service.watchdog().refresh_now().await;
    assert_eq!(service.cwd(), "");

    service.stop().await;
}

#[tokio::test]
async fn extension_filter_limits_files_only() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("disk.img")).await;
    touch(&dir.path().join("notes.txt")).await;
    tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

    let snapshot = fs_ops::snapshot_dir(dir.path(), "", 500, &["img".to_string()])
        .await
        .unwrap();
    let names: Vec<(&str, EntryKind)> = snapshot
        .entries
        .iter()
        .map(|e| (e.name.as_str(), e.kind))
        .collect();
    assert_eq!(
        names,
        vec![("disk", EntryKind::File), ("sub", EntryKind::Dir)]
    );
}

#[tokio::test]
async fn listing_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..20 {
        touch(&dir.path().join(format!("file{i:02}.img"))).await;
    }
    let snapshot = fs_ops::snapshot_dir(dir.path(), "", 5, &[]).await.unwrap();
    assert_eq!(snapshot.entries.len(), 5);
}
