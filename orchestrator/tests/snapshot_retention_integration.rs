//! Snapshot ring bound, across real facade runs.

mod common;

use common::fixtures::*;
use orchestrator::database::records::Trigger;

#[tokio::test]
async fn test_snapshot_ring_is_bounded_across_runs() {
    let stack = TestStack::with_options(StackOptions {
        snapshot_retention: 2,
        ..StackOptions::default()
    })
    .await;
    stack.save_profile(&passing_profile(profiles::STANDARD)).await;

    for _ in 0..4 {
        stack
            .facade
            .run(profiles::STANDARD, Trigger::Scheduled, false)
            .await
            .unwrap();
    }

    assert_eq!(
        stack.snapshot_count(),
        2,
        "only the most recent snapshots survive the retention sweep"
    );
}
