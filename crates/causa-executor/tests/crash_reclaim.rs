//! A worker claims an operation and then "crashes" (drops without
//! publishing a terminal status); after the staleness threshold elapses,
//! reclaim hands the job to another worker, which completes it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use causa_executor::{Executor, ExecutorConfig};
use causa_store_core::{JobQueue, KvStore, NotifyBus, Store};
use causa_store_memory::MemoryStore;
use causa_types::{ArtifactStatus, Encoding, Funsie, FunsieKind, OperationStatus, Slot};

fn slot(name: &str) -> Slot {
    Slot::strict(name, Encoding::RawBytes)
}

#[tokio::test]
async fn crash_reclaim_requeues_and_completes() {
    let store = Arc::new(MemoryStore::new());
    let input = causa_graph::put_const_artifact(store.as_ref(), Encoding::RawBytes, b"x".to_vec()).await.unwrap();
    let funsie = Funsie {
        kind: FunsieKind::Shell(vec!["cat in".to_string()]),
        inputs: vec![slot("in")],
        outputs: vec![slot("stdout0")],
        extra: None,
    };
    let fh = causa_graph::put_funsie(store.as_ref(), funsie.clone()).await.unwrap();
    let mut bindings = BTreeMap::new();
    bindings.insert("in".to_string(), input);
    let (op_hash, operation) = causa_graph::put_operation(store.as_ref(), fh, bindings, &funsie.outputs).await.unwrap();
    let target = operation.output_bindings["stdout0"];

    let config = ExecutorConfig { reclaim_staleness: Duration::from_millis(20), poll_interval: Duration::from_millis(5) };
    let store_dyn: Arc<dyn Store> = store.clone();
    let executor = Executor::new(store_dyn, config);
    executor.submit(&[target]).await.unwrap();

    // First worker claims the job, then "crashes": it never heartbeats,
    // never commits, and is simply dropped. One visible side effect — the
    // claim — is all it leaves behind.
    let first_lease = store.claim().await.unwrap().unwrap();
    assert_eq!(first_lease.op, op_hash);
    assert_eq!(causa_graph::operation_status(store.as_ref(), op_hash).await.unwrap(), Some(OperationStatus::Pending));
    drop(first_lease);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let reclaimed = store.reclaim_stale(Duration::from_millis(20)).await.unwrap();
    assert_eq!(reclaimed, vec![op_hash]);

    // Second worker claims the reclaimed job and completes it — exactly one
    // visible side-effect sequence: the reclaimed lease, then a single
    // commit.
    let second_lease = store.claim().await.unwrap().unwrap();
    assert_eq!(second_lease.op, op_hash);
    let out_hash = operation.output_bindings["stdout0"];
    store.put(&causa_graph::art_data_key(out_hash), b"x".to_vec()).await.unwrap();
    causa_graph::transition_artifact(store.as_ref(), out_hash, ArtifactStatus::Ready).await.unwrap();
    store.put(&causa_graph::op_status_key(op_hash), serde_json::to_vec(&OperationStatus::Done).unwrap()).await.unwrap();
    store.publish(op_hash);

    let report = executor.wait_for(&[target]).await.unwrap();
    assert!(report.all_ready());
}
