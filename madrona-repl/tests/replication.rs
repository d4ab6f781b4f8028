//! End-to-end replication over an in-process connection pair.

use std::time::Duration;

use bytes::Bytes;

use madrona::store::memory::MemoryEngine;
use madrona::store::StorageEngine;
use madrona::{DocFlags, PutRequest, RevId, VersionedDoc};
use madrona_repl::{
    Connection, ConnectionOptions, DbHandle, Event, Mode, Options, Replicator,
};

const MAX_DEPTH: u32 = 20;

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rev(s: &str) -> RevId {
    s.parse().unwrap()
}

fn put_existing(engine: &MemoryEngine, doc_id: &str, rev_id: &str, body: &str) {
    let mut doc = VersionedDoc::get(engine, doc_id, false).unwrap();
    let mut history = vec![rev(rev_id)];
    if let Some(current) = doc.current_rev_id() {
        history.push(current);
    }
    doc.put(&PutRequest {
        body: Some(Bytes::from(body.to_string())),
        history,
        existing: true,
        ..Default::default()
    })
    .unwrap();
    doc.save(engine, MAX_DEPTH).unwrap();
}

fn test_options(push: Mode, pull: Mode) -> Options {
    Options {
        push,
        pull,
        checkpoint_save_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

fn conn_options() -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_secs(10),
    }
}

async fn start_pair(
    db_local: &DbHandle,
    db_remote: &DbHandle,
    local_options: Options,
) -> (Replicator, Replicator) {
    let ((conn_a, in_a), (conn_b, in_b)) = Connection::pair(conn_options());
    let local = Replicator::start(db_local.clone(), conn_a, in_a, local_options, "remote")
        .await
        .unwrap();
    let remote = Replicator::start(
        db_remote.clone(),
        conn_b,
        in_b,
        Options::passive(),
        "local",
    )
    .await
    .unwrap();
    (local, remote)
}

#[tokio::test(flavor = "multi_thread")]
async fn push_one_thousand_documents() {
    setup_logging();
    let source = MemoryEngine::new();
    for i in 0..1000 {
        put_existing(&source, &format!("doc-{i:04}"), "1-aa", "{\"i\":1}");
    }
    let db_source = DbHandle::spawn(source.clone(), None, MAX_DEPTH);

    let target = MemoryEngine::new();
    let db_target = DbHandle::spawn(target.clone(), None, MAX_DEPTH);

    let (local, remote) = start_pair(&db_source, &db_target, test_options(Mode::OneShot, Mode::Disabled)).await;
    let events = local.events();

    local.wait().await.unwrap();

    // Checkpoints only ever move forward, and land exactly at the end of
    // the change feed.
    let mut last = 0;
    let mut final_checkpoint = None;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::PushCheckpoint(seq) => {
                assert!(seq >= last, "checkpoint went backwards: {last} -> {seq}");
                last = seq;
            }
            Event::PushComplete { checkpoint } => final_checkpoint = Some(checkpoint),
            _ => {}
        }
    }
    assert_eq!(final_checkpoint, Some(1000));

    // The durable checkpoint matches.
    assert_eq!(
        db_source
            .get_checkpoint("checkpoint/remote/push".into())
            .await
            .unwrap(),
        1000
    );

    // Every document arrived.
    assert_eq!(target.last_sequence().unwrap(), 1000);
    for i in (0..1000).step_by(97) {
        let mut doc = VersionedDoc::get(&target, &format!("doc-{i:04}"), true).unwrap();
        assert_eq!(doc.current_rev_id().unwrap(), rev("1-aa"));
    }

    remote.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn push_resumes_from_checkpoint() {
    setup_logging();
    let source = MemoryEngine::new();
    for i in 0..10 {
        put_existing(&source, &format!("doc-{i}"), "1-aa", "{}");
    }
    let db_source = DbHandle::spawn(source.clone(), None, MAX_DEPTH);
    let target = MemoryEngine::new();
    let db_target = DbHandle::spawn(target.clone(), None, MAX_DEPTH);

    let (local, remote) = start_pair(&db_source, &db_target, test_options(Mode::OneShot, Mode::Disabled)).await;
    local.wait().await.unwrap();
    remote.stop().await;
    assert_eq!(
        db_source
            .get_checkpoint("checkpoint/remote/push".into())
            .await
            .unwrap(),
        10
    );

    // More writes, then a second session against the same peer.
    for i in 10..15 {
        put_existing(&source, &format!("doc-{i}"), "1-aa", "{}");
    }
    let (local, remote) = start_pair(&db_source, &db_target, test_options(Mode::OneShot, Mode::Disabled)).await;
    local.wait().await.unwrap();
    remote.stop().await;

    assert_eq!(
        db_source
            .get_checkpoint("checkpoint/remote/push".into())
            .await
            .unwrap(),
        15
    );
    assert_eq!(target.last_sequence().unwrap(), 15);
    assert!(VersionedDoc::get(&target, "doc-14", true).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_sync() {
    setup_logging();
    let a = MemoryEngine::new();
    let b = MemoryEngine::new();
    for i in 0..4 {
        put_existing(&a, &format!("from-a-{i}"), "1-aa", "{\"side\":\"a\"}");
        put_existing(&b, &format!("from-b-{i}"), "1-bb", "{\"side\":\"b\"}");
    }
    let db_a = DbHandle::spawn(a.clone(), None, MAX_DEPTH);
    let db_b = DbHandle::spawn(b.clone(), None, MAX_DEPTH);

    let (local, remote) =
        start_pair(&db_a, &db_b, test_options(Mode::OneShot, Mode::OneShot)).await;
    local.wait().await.unwrap();
    remote.stop().await;

    for i in 0..4 {
        assert!(VersionedDoc::get(&a, &format!("from-b-{i}"), true).is_ok());
        assert!(VersionedDoc::get(&b, &format!("from-a-{i}"), true).is_ok());
    }
    assert_eq!(
        db_a.get_checkpoint("checkpoint/remote/pull".into())
            .await
            .unwrap(),
        4
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pushed_updates_extend_existing_trees() {
    setup_logging();
    let source = MemoryEngine::new();
    let target = MemoryEngine::new();
    put_existing(&source, "doc", "1-root", "{\"v\":1}");
    put_existing(&target, "doc", "1-root", "{\"v\":1}");
    put_existing(&source, "doc", "2-next", "{\"v\":2}");
    put_existing(&source, "doc", "3-last", "{\"v\":3}");

    let db_source = DbHandle::spawn(source.clone(), None, MAX_DEPTH);
    let db_target = DbHandle::spawn(target.clone(), None, MAX_DEPTH);
    let (local, remote) = start_pair(&db_source, &db_target, test_options(Mode::OneShot, Mode::Disabled)).await;
    local.wait().await.unwrap();
    remote.stop().await;

    let mut doc = VersionedDoc::get(&target, "doc", true).unwrap();
    assert_eq!(doc.current_rev_id().unwrap(), rev("3-last"));
    // The shared root was recognized, not duplicated.
    let current = doc.tree_mut().current().unwrap();
    assert_eq!(doc.tree().history(current).len(), 3);
    assert!(!doc.flags().contains(DocFlags::CONFLICTED));
}

#[tokio::test(flavor = "multi_thread")]
async fn divergent_edits_arrive_as_conflicts() {
    setup_logging();
    let source = MemoryEngine::new();
    let target = MemoryEngine::new();
    put_existing(&source, "doc", "1-root", "{\"v\":1}");
    put_existing(&target, "doc", "1-root", "{\"v\":1}");
    // Divergent edits on both sides.
    put_existing(&source, "doc", "2-aaaa", "{\"from\":\"source\"}");
    put_existing(&target, "doc", "2-bbbb", "{\"from\":\"target\"}");

    let db_source = DbHandle::spawn(source.clone(), None, MAX_DEPTH);
    let db_target = DbHandle::spawn(target.clone(), None, MAX_DEPTH);
    let (local, remote) = start_pair(&db_source, &db_target, test_options(Mode::OneShot, Mode::Disabled)).await;
    local.wait().await.unwrap();
    remote.stop().await;

    let mut doc = VersionedDoc::get(&target, "doc", true).unwrap();
    assert!(doc.flags().contains(DocFlags::CONFLICTED));
    // The higher rev id wins while the conflict stands.
    assert_eq!(doc.current_rev_id().unwrap(), rev("2-bbbb"));
    let a = doc.tree().get(&rev("2-aaaa")).unwrap();
    let b = doc.tree().get(&rev("2-bbbb")).unwrap();
    let root = doc.tree().get(&rev("1-root")).unwrap();
    assert_eq!(doc.tree().common_ancestor(a, b), Some(root));

    doc.resolve_conflict(
        &rev("2-bbbb"),
        &rev("2-aaaa"),
        Bytes::from_static(b"{\"merged\":true}"),
    )
    .unwrap();
    doc.save(&target, MAX_DEPTH).unwrap();
    let doc = VersionedDoc::get(&target, "doc", true).unwrap();
    assert!(!doc.flags().contains(DocFlags::CONFLICTED));
}

#[tokio::test(flavor = "multi_thread")]
async fn continuous_push_follows_new_writes() {
    setup_logging();
    let source = MemoryEngine::new();
    put_existing(&source, "seed", "1-aa", "{}");
    let db_source = DbHandle::spawn(source.clone(), None, MAX_DEPTH);
    let target = MemoryEngine::new();
    let db_target = DbHandle::spawn(target.clone(), None, MAX_DEPTH);

    let (local, remote) = start_pair(
        &db_source,
        &db_target,
        test_options(Mode::Continuous, Mode::Disabled),
    )
    .await;
    let events = local.events();

    // Wait for the backlog to drain.
    loop {
        match events.recv_async().await.unwrap() {
            Event::PushCaughtUp => break,
            Event::PushFailed(err) => panic!("push failed: {err}"),
            _ => {}
        }
    }

    // A write after catch-up still flows across.
    put_existing(&source, "late", "1-bb", "{\"late\":true}");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if VersionedDoc::get(&target, "late", true).is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "late write never arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    local.stop().await;
    remote.stop().await;
}
