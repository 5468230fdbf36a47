//! End-to-end test: two nodes on localhost syncing one share.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

use lumesync::config::{Config, PeerConfig};
use lumesync::crypto::Credentials;
use lumesync::sync::ShareState;
use lumesync::Node;

const WAIT: Duration = Duration::from_secs(20);

async fn config(dir: &Path, name: &str, share_root: &Path) -> Config {
    let mut config = Config::init_in(dir, name).await.unwrap();
    config.listen_address = "127.0.0.1".to_string();
    config.listen_port = 0;
    config.add_share("docs", share_root.to_path_buf(), vec![]).unwrap();
    config
}

async fn wait_for_file(path: &Path, expected: &[u8]) {
    timeout(WAIT, async {
        loop {
            if let Ok(content) = tokio::fs::read(path).await {
                if content == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached the expected content", path.display()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_sync_existing_and_new_files() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let a_share = TempDir::new().unwrap();
    let b_share = TempDir::new().unwrap();
    std::fs::write(a_share.path().join("hello.txt"), b"hello from a").unwrap();
    std::fs::create_dir(a_share.path().join("notes")).unwrap();
    std::fs::write(a_share.path().join("notes").join("todo.txt"), b"water plants").unwrap();

    let a_creds = Credentials::generate("alpha").unwrap().credentials;
    let b_creds = Credentials::generate("beta").unwrap().credentials;
    let a_fp = a_creds.identity().unwrap().fingerprint;
    let b_fp = b_creds.identity().unwrap().fingerprint;

    let mut a_config = config(a_dir.path(), "alpha", a_share.path()).await;
    a_config.authorize("docs", &b_fp).unwrap();
    a_config
        .add_peer(PeerConfig {
            name: "beta".to_string(),
            fingerprint: b_fp.clone(),
            address: None,
            port: None,
        })
        .unwrap();
    let a = Node::start_with(&a_config, a_creds).await.unwrap();
    let a_port = a.local_addr().unwrap().port();

    let mut b_config = config(b_dir.path(), "beta", b_share.path()).await;
    b_config.authorize("docs", &a_fp).unwrap();
    b_config
        .add_peer(PeerConfig {
            name: "alpha".to_string(),
            fingerprint: a_fp.clone(),
            address: Some("127.0.0.1".to_string()),
            port: Some(a_port),
        })
        .unwrap();
    let b = Node::start_with(&b_config, b_creds).await.unwrap();

    assert_eq!(a.share_state("docs"), Some(ShareState::Running));
    assert_eq!(b.identity().fingerprint, b_fp);

    wait_for_file(&b_share.path().join("hello.txt"), b"hello from a").await;
    wait_for_file(&b_share.path().join("notes").join("todo.txt"), b"water plants").await;
    assert!(a.registry().is_connected(&b_fp));
    assert!(b.registry().is_connected(&a_fp));

    // A change made while both are running travels too.
    tokio::fs::write(a_share.path().join("later.txt"), b"written later")
        .await
        .unwrap();
    wait_for_file(&b_share.path().join("later.txt"), b"written later").await;

    b.shutdown().await;
    a.shutdown().await;
}
