#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use opsjob_core::{Delta, DeltaKind, MatchLabels, ObjectKey, WatchUpdate};
use opsjob_store::{spawn_ingest, PodWorld};

fn uid(n: u8) -> [u8; 16] { let mut u = [0u8; 16]; u[0] = n; u }

fn obj(name: &str, rv: &str, origin: Option<&str>) -> Arc<Pod> {
    let labels = origin.map(|o| [("kusionstack.io/replace-pair-origin-name".to_string(), o.to_string())].into_iter().collect());
    Arc::new(Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            resource_version: Some(rv.into()),
            labels,
            ..Default::default()
        },
        ..Default::default()
    })
}

fn applied(n: u8, o: Arc<Pod>) -> Delta { Delta { uid: uid(n), kind: DeltaKind::Applied, object: o } }
fn deleted(n: u8, o: Arc<Pod>) -> Delta { Delta { uid: uid(n), kind: DeltaKind::Deleted, object: o } }

#[test]
fn replay_basic_sequence() {
    let mut world = PodWorld::new();

    // origin created, replacement created, origin updated, origin deleted
    let deltas = vec![
        applied(1, obj("origin", "1", None)),
        applied(1, obj("origin", "1", None)),
        applied(2, obj("origin-new", "2", Some("origin"))),
        applied(1, obj("origin", "3", None)),
        deleted(1, obj("origin", "4", None)),
    ];

    world.apply(deltas[..2].to_vec());
    let snap1 = world.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.len(), 1);
    assert_eq!(snap1.resource_version(&ObjectKey::new("ns", "origin")), Some("1"));

    world.apply(deltas[2..4].to_vec());
    let snap2 = world.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.resource_version(&ObjectKey::new("ns", "origin")), Some("3"));
    let paired = snap2.list("ns", &MatchLabels::new().with("kusionstack.io/replace-pair-origin-name", "origin"));
    assert_eq!(paired.len(), 1);
    assert_eq!(paired[0].metadata.name.as_deref(), Some("origin-new"));

    world.apply(deltas[4..].to_vec());
    let snap3 = world.freeze();
    assert!(snap3.get(&ObjectKey::new("ns", "origin")).is_none());
    assert_eq!(snap3.len(), 1);
    // Older snapshots are immutable.
    assert_eq!(snap2.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_loop_flushes_on_close() {
    let (tx, backend) = spawn_ingest(2);
    let seq = vec![
        WatchUpdate::Delta(applied(1, obj("a", "1", None))),
        WatchUpdate::Delta(applied(2, obj("b", "2", None))),
        WatchUpdate::Delta(applied(3, obj("c", "3", None))),
        WatchUpdate::Delta(applied(1, obj("a", "4", None))),
        WatchUpdate::Delta(deleted(2, obj("b", "5", None))),
    ];
    for u in seq {
        tx.send(u).await.unwrap();
    }
    let mut epoch = backend.subscribe_epoch();
    drop(tx);
    // Allow flush
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), async {
        while backend.current().get(&ObjectKey::new("ns", "b")).is_some()
            || backend.current().resource_version(&ObjectKey::new("ns", "a")) != Some("4")
        {
            if epoch.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    let snap = backend.current();
    assert_eq!(snap.resource_version(&ObjectKey::new("ns", "a")), Some("4"));
    assert!(snap.get(&ObjectKey::new("ns", "b")).is_none());
    assert_eq!(snap.resource_version(&ObjectKey::new("ns", "c")), Some("3"));
}

#[tokio::test]
async fn relist_replaces_snapshot() {
    let (tx, backend) = spawn_ingest(16);
    tx.send(WatchUpdate::Delta(applied(1, obj("ghost", "1", None)))).await.unwrap();
    tx.send(WatchUpdate::Relisted(vec![applied(2, obj("live", "9", None))])).await.unwrap();
    drop(tx);
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let snap = backend.current();
    assert!(snap.get(&ObjectKey::new("ns", "ghost")).is_none());
    assert_eq!(snap.resource_version(&ObjectKey::new("ns", "live")), Some("9"));
}
