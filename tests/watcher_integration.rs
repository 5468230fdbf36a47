use lumesync::watcher::{FileChangeType, FsEvent, NotifyWatcher, WatchSource};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Collect events until one for `path` with `kind` arrives.
async fn wait_for(events: &mut mpsc::Receiver<FsEvent>, path: &Path, kind: FileChangeType) -> bool {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event.path == path && event.kind == kind {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn test_watch_registration() {
    let temp_dir = TempDir::new().unwrap();
    let nested = temp_dir.path().join("nested");
    std::fs::create_dir(&nested).unwrap();

    let (mut watcher, _events) = NotifyWatcher::new().unwrap();
    assert_eq!(watcher.watched_paths(), 0);

    watcher.add_watch(temp_dir.path()).unwrap();
    watcher.add_watch(&nested).unwrap();
    watcher.add_watch(&nested).unwrap();
    assert_eq!(watcher.watched_paths(), 2);

    // Removing a directory drops the watches below it too.
    watcher.remove_watch(temp_dir.path()).unwrap();
    assert_eq!(watcher.watched_paths(), 0);
}

#[tokio::test]
async fn test_file_change_detection() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let test_file = root.join("test.txt");

    let (mut watcher, mut events) = NotifyWatcher::new().unwrap();
    watcher.add_watch(&root).unwrap();
    sleep(Duration::from_millis(100)).await;

    fs::write(&test_file, "test content").await.unwrap();
    assert!(wait_for(&mut events, &test_file, FileChangeType::Created).await);

    fs::remove_file(&test_file).await.unwrap();
    assert!(wait_for(&mut events, &test_file, FileChangeType::Removed).await);

    watcher.release();
}

#[tokio::test]
async fn test_watches_are_not_recursive() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let nested = root.join("nested");
    std::fs::create_dir(&nested).unwrap();

    let (mut watcher, mut events) = NotifyWatcher::new().unwrap();
    watcher.add_watch(&root).unwrap();
    sleep(Duration::from_millis(100)).await;

    let inner = nested.join("inner.txt");
    fs::write(&inner, "x").await.unwrap();
    sleep(Duration::from_millis(300)).await;

    while let Ok(event) = events.try_recv() {
        assert_ne!(event.path, inner);
    }

    watcher.add_watch(&nested).unwrap();
    sleep(Duration::from_millis(100)).await;
    fs::write(&inner, "changed").await.unwrap();
    assert!(wait_for(&mut events, &inner, FileChangeType::Modified).await);

    watcher.release();
    assert_eq!(watcher.watched_paths(), 0);
}
