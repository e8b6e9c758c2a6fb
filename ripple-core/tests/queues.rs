//! Integration Tests for Serialization Primitives
//!
//! These tests verify ordering and mutual exclusion of the queues and the
//! channel through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripple_core::error::BoxError;
use ripple_core::queue::{self, Channel, FifoQueue, UniqueQueue};
use ripple_core::{Error, Runtime, RuntimeConfig};

type Log = Arc<Mutex<Vec<&'static str>>>;

/// Test that FIFO order holds whatever the task durations.
#[tokio::test(start_paused = true)]
async fn fifo_preserves_order_across_durations() {
    let queue = FifoQueue::new();
    let log: Log = Arc::default();

    let durations = [("a", 50), ("b", 0), ("c", 10)];
    let mut pending = Vec::new();
    for (name, ms) in durations {
        let log = log.clone();
        pending.push(queue.push(async move {
            log.lock().push(name);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            log.lock().push(name);
        }));
    }

    for done in pending.into_iter().rev() {
        done.await.unwrap();
    }
    assert_eq!(*log.lock(), vec!["a", "a", "b", "b", "c", "c"]);
}

/// Test that a pending task for a key is replaced by a newer one.
#[tokio::test(start_paused = true)]
async fn unique_queue_coalesces_pending_tasks() {
    let rt = Runtime::new(RuntimeConfig::default().with_unique_delay(Duration::from_millis(20)));
    let queue: UniqueQueue<&'static str> = rt.unique_queue();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut completions = Vec::new();
    for value in 1..=4 {
        let runs = runs.clone();
        completions.push(queue.push("k", async move {
            runs.fetch_add(1, Ordering::SeqCst);
            value
        }));
    }

    let last = completions.pop().unwrap();
    assert_eq!(last.await.unwrap(), 4);
    for superseded in completions {
        assert!(matches!(superseded.await, Err(Error::Superseded)));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that two holders of one key never overlap while other keys proceed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_serializes_per_key() {
    let channel: Channel<&'static str> = Channel::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (channel, active, max_active) = (channel.clone(), active.clone(), max_active.clone());
        tasks.push(tokio::spawn(async move {
            channel
                .callback("x", |_| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                })
                .await
        }));
    }

    // A different key is admitted while "x" is busy.
    let other = channel.key("y").await.unwrap();
    other.resume();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(channel.active_lanes(), 0);
}

/// Test that the second caller waits for the first to resume.
#[tokio::test]
async fn channel_second_caller_waits_for_resume() {
    let channel: Channel<u32> = Channel::new();

    let first = channel.key(7).await.unwrap();
    let mut second = Box::pin(channel.key(7));

    tokio::select! {
        _ = &mut second => panic!("second caller admitted while first holds the lane"),
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }
    assert_eq!(channel.waiting(&7), 1);
    assert!(!first.is_last_on_q());

    first.resume();
    let second = second.await.unwrap();
    assert!(second.is_last_on_q());
    second.resume();
}

/// Test that closing the channel makes every liveness check fail.
#[tokio::test]
async fn closed_channel_reports_nothing_live() {
    let channel: Channel<u32> = Channel::new();
    let permit = channel.key(1).await.unwrap();
    assert!(permit.is_last_on_q());

    channel.close();
    assert!(!permit.is_last_on_q());
    let fresh = channel.key(2).await.unwrap();
    assert!(!fresh.is_last_on_q());

    channel.open();
    assert!(permit.is_last_on_q());
    permit.resume();
    fresh.resume();
}

/// Test that a failing callback still releases its lane.
#[tokio::test]
async fn failing_callback_releases_lane() {
    let channel: Channel<&'static str> = Channel::new();

    let failed = channel
        .callback("k", |_| async { Err::<(), _>("disk full") })
        .await;
    assert!(matches!(failed, Err(Error::Task(_))));

    let value = channel
        .callback("k", |live| async move {
            assert!(live.is_last_on_q());
            Ok::<_, BoxError>(1)
        })
        .await
        .unwrap();
    assert_eq!(value, 1);
}

/// Test that the process-wide FIFO lane runs callbacks in call order.
#[tokio::test]
async fn global_fifo_orders_callbacks() {
    let log: Log = Arc::default();

    let first = {
        let log = log.clone();
        queue::fifo_callback(|_| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            log.lock().push("first");
            Ok::<_, BoxError>(())
        })
    };
    let second = {
        let log = log.clone();
        queue::fifo_callback(|_| async move {
            log.lock().push("second");
            Ok::<_, BoxError>(())
        })
    };

    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();
    assert_eq!(*log.lock(), vec!["first", "second"]);
}
