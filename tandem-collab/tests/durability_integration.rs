//! Durability isolation: a degraded operation log must never stall live
//! editing, and the backlog must converge once the store recovers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use tandem_collab::protocol::ServerFrame;
use tandem_collab::registry::SessionRegistry;
use tandem_collab::session::SessionConfig;
use tandem_collab::storage::{
    MemoryHotStore, MemoryOpLog, MemorySnapshotStore, OperationLog, TabKey,
};
use tandem_core::access::Role;
use tandem_core::op::Operation;

struct Stores {
    hot: Arc<MemoryHotStore>,
    log: Arc<MemoryOpLog>,
    snapshots: Arc<MemorySnapshotStore>,
}

fn stores() -> Stores {
    Stores {
        hot: Arc::new(MemoryHotStore::new()),
        log: Arc::new(MemoryOpLog::new()),
        snapshots: Arc::new(MemorySnapshotStore::new()),
    }
}

fn registry_with(s: &Stores, config: SessionConfig) -> SessionRegistry {
    SessionRegistry::new(config, s.hot.clone(), s.log.clone(), s.snapshots.clone())
}

fn quiet_config() -> SessionConfig {
    let mut config = SessionConfig::for_testing();
    config.grace_period = Duration::from_secs(30);
    config.snapshot_interval = Duration::from_secs(30);
    config
}

async fn expect_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame within timeout")
        .expect("channel open")
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn log_outage_does_not_block_submit_or_broadcast() {
    let s = stores();
    let registry = registry_with(&s, quiet_config());
    let key = TabKey::new("doc", "tab");
    let session = registry.resolve(&key).await.unwrap();

    let (alice_tx, mut alice_rx) = mpsc::channel(64);
    let alice = session
        .admit("alice", Some(Role::Editor), alice_tx)
        .await
        .unwrap();
    let _ = expect_frame(&mut alice_rx).await; // snapshot

    let (bob_tx, mut bob_rx) = mpsc::channel(64);
    let _bob = session
        .admit("bob", Some(Role::Editor), bob_tx)
        .await
        .unwrap();
    let _ = expect_frame(&mut bob_rx).await; // snapshot
    let _ = expect_frame(&mut alice_rx).await; // bob joined

    // Durable tier goes dark.
    s.log.set_unavailable(true);

    for seq in 1..=3u64 {
        session
            .submit(alice, Operation::insert(0, "x", seq - 1, alice, seq))
            .await
            .unwrap();
    }

    // Editing and fan-out continue unimpeded.
    for expected in 1..=3u64 {
        match expect_frame(&mut bob_rx).await {
            ServerFrame::Op { version, .. } => assert_eq!(version, expected),
            other => panic!("expected op frame, got {other:?}"),
        }
    }
    let stats = session.stats().await.unwrap();
    assert_eq!(stats.content, "xxx");
    assert_eq!(stats.version, 3);
    assert_eq!(s.log.len(&key), 0, "nothing durable during the outage");

    // Store recovers: the retry queue flushes the whole backlog.
    s.log.set_unavailable(false);
    let log = s.log.clone();
    let key2 = key.clone();
    wait_for(move || log.len(&key2) == 3, "retry backlog flush").await;

    let logged = s.log.read_from(&key, 0).unwrap();
    let versions: Vec<u64> = logged.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn overflow_warns_owners_and_only_owners() {
    let s = stores();
    // for_testing retry queue capacity is 4.
    let registry = registry_with(&s, quiet_config());
    let key = TabKey::new("doc", "tab");
    let session = registry.resolve(&key).await.unwrap();

    let (owner_tx, mut owner_rx) = mpsc::channel(64);
    let _owner = session
        .admit("alice", Some(Role::Owner), owner_tx)
        .await
        .unwrap();
    let _ = expect_frame(&mut owner_rx).await; // snapshot

    let (editor_tx, mut editor_rx) = mpsc::channel(64);
    let editor = session
        .admit("bob", Some(Role::Editor), editor_tx)
        .await
        .unwrap();
    let _ = expect_frame(&mut editor_rx).await; // snapshot
    let _ = expect_frame(&mut owner_rx).await; // bob joined

    s.log.set_unavailable(true);
    for seq in 1..=20u64 {
        session
            .submit(editor, Operation::insert(0, "y", seq - 1, editor, seq))
            .await
            .unwrap();
    }

    // The owner hears about the dropped backlog.
    let warning = loop {
        match expect_frame(&mut owner_rx).await {
            ServerFrame::Warning { message } => break message,
            ServerFrame::Op { .. } => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    };
    assert!(warning.contains("durability degraded"), "got: {warning}");

    // The editor sees its own edits echoed nowhere and no warning —
    // only error-free op traffic (none here, it originated everything).
    sleep(Duration::from_millis(100)).await;
    while let Ok(Some(frame)) = timeout(Duration::from_millis(50), editor_rx.recv()).await {
        assert!(
            !matches!(frame, ServerFrame::Warning { .. }),
            "editors must not receive durability warnings"
        );
    }

    // Recovery still lands the newest entries.
    s.log.set_unavailable(false);
    let log = s.log.clone();
    let key2 = key.clone();
    wait_for(move || log.len(&key2) > 0, "partial backlog flush").await;
    sleep(Duration::from_millis(100)).await;

    let logged = s.log.read_from(&key, 0).unwrap();
    assert!(!logged.is_empty());
    assert_eq!(logged.last().unwrap().version, 20);
    // Everything that survived the bound is contiguous at the tail.
    let first = logged.first().unwrap().version;
    let versions: Vec<u64> = logged.iter().map(|e| e.version).collect();
    assert_eq!(versions, (first..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn restart_recovers_snapshot_plus_log_tail() {
    let s = stores();
    let key = TabKey::new("doc", "tab");

    // First process lifetime: edit, then drain.
    {
        let registry = registry_with(&s, quiet_config());
        let session = registry.resolve(&key).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let alice = session.admit("alice", Some(Role::Editor), tx).await.unwrap();

        for (seq, word) in ["hello", " world"].iter().enumerate() {
            session
                .submit(
                    alice,
                    Operation::insert(
                        session.stats().await.unwrap().content.chars().count(),
                        *word,
                        seq as u64,
                        alice,
                        seq as u64 + 1,
                    ),
                )
                .await
                .unwrap();
        }
        let log = s.log.clone();
        let key2 = key.clone();
        wait_for(move || log.len(&key2) == 2, "log flush").await;
        registry.shutdown().await;
    }

    // "Restart": fresh hot tier (it is process-local), same durable tier.
    let restarted = Stores {
        hot: Arc::new(MemoryHotStore::new()),
        log: s.log.clone(),
        snapshots: s.snapshots.clone(),
    };
    let registry = registry_with(&restarted, quiet_config());
    let session = registry.resolve(&key).await.unwrap();
    let stats = session.stats().await.unwrap();
    assert_eq!(stats.content, "hello world");
    assert_eq!(stats.version, 2);
}

#[tokio::test]
async fn one_tabs_outage_is_isolated_from_others() {
    // Two tabs share the degraded log, but each session keeps its own
    // retry queue; the healthy tab's pipeline is untouched by design and
    // both converge after recovery.
    let s = stores();
    let registry = registry_with(&s, quiet_config());

    let key_a = TabKey::new("doc", "a");
    let key_b = TabKey::new("doc", "b");
    let session_a = registry.resolve(&key_a).await.unwrap();
    let session_b = registry.resolve(&key_b).await.unwrap();

    let (tx_a, _rx_a) = mpsc::channel(64);
    let conn_a = session_a.admit("alice", Some(Role::Editor), tx_a).await.unwrap();
    let (tx_b, _rx_b) = mpsc::channel(64);
    let conn_b = session_b.admit("bob", Some(Role::Editor), tx_b).await.unwrap();

    s.log.set_unavailable(true);
    session_a
        .submit(conn_a, Operation::insert(0, "A", 0, conn_a, 1))
        .await
        .unwrap();
    session_b
        .submit(conn_b, Operation::insert(0, "B", 0, conn_b, 1))
        .await
        .unwrap();

    assert_eq!(session_a.stats().await.unwrap().content, "A");
    assert_eq!(session_b.stats().await.unwrap().content, "B");

    s.log.set_unavailable(false);
    let log = s.log.clone();
    let (ka, kb) = (key_a.clone(), key_b.clone());
    wait_for(move || log.len(&ka) == 1 && log.len(&kb) == 1, "both tabs flushed").await;

    assert_eq!(s.log.read_from(&key_a, 0).unwrap()[0].op.content, "A");
    assert_eq!(s.log.read_from(&key_b, 0).unwrap()[0].op.content, "B");
}
