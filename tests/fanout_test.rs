//! Fan-out behavior: joins must not stall established viewers

mod common;

use beamcast::{GraphState, SignalingHandler};
use common::spawn_broadcaster;
use std::time::Duration;

/// Poll until the attachment has forwarded at least `target` video packets
async fn wait_for_video(
    b: &common::TestBroadcaster,
    viewer: &str,
    target: u64,
    within: Duration,
) -> u64 {
    let record = b.manager.viewer(viewer).await.unwrap();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let forwarded = record.attachment.forwarded_video();
        if forwarded >= target || tokio::time::Instant::now() >= deadline {
            return forwarded;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_existing_viewer_keeps_flowing_across_joins() {
    let b = spawn_broadcaster().await;

    b.manager.on_viewer_joined("A".to_string()).await;
    b.source.pump_video(10).await;
    let before = wait_for_video(&b, "A", 10, Duration::from_millis(200)).await;
    assert!(before >= 10);

    // Two more viewers join back to back
    b.manager.on_viewer_joined("B".to_string()).await;
    b.manager.on_viewer_joined("C".to_string()).await;
    assert_eq!(b.manager.viewer_count().await, 3);

    // A continues to receive within 200 ms of new data arriving
    b.source.pump_video(10).await;
    let after = wait_for_video(&b, "A", before + 10, Duration::from_millis(200)).await;
    assert!(
        after >= before + 10,
        "viewer A stalled across joins: {} -> {}",
        before,
        after
    );

    // The newcomers receive the post-join data too
    let b_forwarded = wait_for_video(&b, "B", 10, Duration::from_millis(200)).await;
    let c_forwarded = wait_for_video(&b, "C", 10, Duration::from_millis(200)).await;
    assert!(b_forwarded >= 10);
    assert!(c_forwarded >= 10);

    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_leave_does_not_interrupt_remaining_viewers() {
    let b = spawn_broadcaster().await;

    b.manager.on_viewer_joined("A".to_string()).await;
    b.manager.on_viewer_joined("B".to_string()).await;

    b.source.pump_video(5).await;
    wait_for_video(&b, "A", 5, Duration::from_millis(200)).await;

    let record_a = b.manager.viewer("A").await.unwrap();
    b.manager.on_viewer_left("B".to_string()).await;

    b.source.pump_video(5).await;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    while record_a.attachment.forwarded_video() < 10
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(record_a.attachment.forwarded_video() >= 10);

    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_audio_and_video_branches_both_flow() {
    let b = spawn_broadcaster().await;

    b.manager.on_viewer_joined("A".to_string()).await;
    b.source.pump_video(8).await;
    b.source.pump_audio(12).await;

    let record = b.manager.viewer("A").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while (record.attachment.forwarded_video() < 8 || record.attachment.forwarded_audio() < 12)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(record.attachment.forwarded_video() >= 8);
    assert!(record.attachment.forwarded_audio() >= 12);

    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_no_branch_behind() {
    let b = spawn_broadcaster().await;

    b.manager.on_viewer_joined("A".to_string()).await;
    b.manager.on_viewer_joined("B".to_string()).await;
    b.source.pump_video(20).await;

    b.manager.shutdown().await;

    assert_eq!(b.graph.state().await, GraphState::Stopped);
    assert_eq!(b.graph.attachment_pad_count().await, 0);
    assert_eq!(b.graph.live_elements(), 0);
    assert_eq!(b.manager.viewer_count().await, 0);
}
