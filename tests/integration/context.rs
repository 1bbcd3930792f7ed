//! Run context guarantees seen from outside the engine.

use cadence::core::task::TaskId;
use cadence::{ContextError, ContextValue, RunContext, Template};

#[tokio::test]
async fn test_second_put_to_same_slot_is_rejected() {
    let context = RunContext::new();
    let staging = TaskId::from("staging");

    context.put(&staging, "path", "/tmp/first").await.unwrap();
    let err = context.put(&staging, "path", "/tmp/second").await.unwrap_err();

    assert_eq!(
        err,
        ContextError::DuplicateKey {
            task: staging.clone(),
            key: "path".to_string(),
        }
    );
    assert_eq!(
        context.get(&staging, "path").await.unwrap(),
        ContextValue::from("/tmp/first")
    );
}

#[tokio::test]
async fn test_clones_share_entries() {
    let context = RunContext::new();
    let writer = context.clone();
    writer
        .put(&TaskId::from("merge_and_norm"), "path", "/ws/merged_trips.csv")
        .await
        .unwrap();

    let rendered = context
        .resolve_template(&Template::new("load ref(merge_and_norm, path)"))
        .await
        .unwrap();
    assert_eq!(rendered, "load /ws/merged_trips.csv");
}

#[tokio::test]
async fn test_unpublished_reference_is_reported() {
    let context = RunContext::new();
    let err = context
        .resolve_template(&Template::new("ref(staging, path)/input"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ContextError::UnresolvedReference {
            task: TaskId::from("staging"),
            key: "path".to_string(),
        }
    );
}
