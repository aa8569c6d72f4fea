//! Behaviour tests for the copy-completion monitor

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lockstep_core::monitor::{CompletionMonitor, LogMarkerOracle, WaitOutcome};
use lockstep_core::testing::ScriptedOracle;

const MARKER: &str = "onetimecopy done";

#[tokio::test]
async fn test_completes_on_first_poll_after_increase() {
    let oracle = Arc::new(ScriptedOracle::new([2, 2, 2, 3]));
    let monitor = CompletionMonitor::new(oracle.clone(), Duration::from_millis(5));

    let outcome = monitor.wait(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome,
        WaitOutcome::Completed {
            baseline: 2,
            observed: 3,
            polls: 3
        }
    );
    assert_eq!(oracle.reads(), 4);
}

#[tokio::test]
async fn test_log_append_ends_wait() {
    let mut log = tempfile::NamedTempFile::new().unwrap();
    writeln!(log, "2024-05-01 02:00:00 {} for job a", MARKER).unwrap();
    writeln!(log, "2024-05-02 02:00:00 {} for job a", MARKER).unwrap();
    log.flush().unwrap();

    let oracle = LogMarkerOracle::new(log.path(), MARKER).unwrap();
    let monitor = Arc::new(CompletionMonitor::new(
        Arc::new(oracle),
        Duration::from_millis(10),
    ));
    let baseline = monitor.start().await.unwrap();
    assert_eq!(baseline.count, 2);

    let cancel = CancellationToken::new();
    let waiter = {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.wait_from(&baseline, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!waiter.is_finished());

    writeln!(log, "2024-05-03 02:00:00 copying table orders").unwrap();
    writeln!(log, "2024-05-03 02:10:00 {} for job a", MARKER).unwrap();
    log.flush().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    match outcome {
        WaitOutcome::Completed {
            baseline, observed, ..
        } => {
            assert_eq!(baseline, 2);
            assert_eq!(observed, 3);
        }
        WaitOutcome::Cancelled => panic!("wait should have completed"),
    }
}

#[tokio::test]
async fn test_cancel_between_polls() {
    let oracle = Arc::new(ScriptedOracle::new([7]));
    let monitor = Arc::new(CompletionMonitor::new(
        oracle.clone(),
        Duration::from_millis(5),
    ));
    let cancel = CancellationToken::new();

    let waiter = {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.wait(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Cancelled);
    assert!(oracle.reads() > 1);
}

#[tokio::test]
async fn test_failed_poll_is_retried() {
    let oracle = Arc::new(ScriptedOracle::new([0, 0, 1]).failing_at(1));
    let monitor = CompletionMonitor::new(oracle.clone(), Duration::from_millis(5));

    let outcome = monitor.wait(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome,
        WaitOutcome::Completed {
            baseline: 0,
            observed: 1,
            polls: 2
        }
    );
}

#[tokio::test]
async fn test_failed_baseline_is_an_error() {
    let oracle = Arc::new(ScriptedOracle::new([1]).failing_at(0));
    let monitor = CompletionMonitor::new(oracle, Duration::from_millis(5));

    assert!(monitor.wait(&CancellationToken::new()).await.is_err());
}
