use super::PinTracker;

use std::{sync::Arc, time::Duration};

use crate::{
    error::TrackerError,
    model::{Cid, Pin, RemotePinStatus, TrackerStatus},
    optracker::Phase,
    settings::TrackerCfg,
    test_utils::MockIpfs,
};

const CID1: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmq";
const CID2: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmma";
const CID3: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmb";
const SLOW_CID: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmd";

fn cid(s: &str) -> Cid {
    Cid::parse(s).unwrap()
}

fn new_tracker(ipfs: MockIpfs, concurrent_pins: usize) -> (Arc<MockIpfs>, PinTracker<MockIpfs>) {
    let ipfs = Arc::new(ipfs);
    let cfg = TrackerCfg {
        concurrent_pins,
        ..Default::default()
    };
    let tracker = PinTracker::new(&cfg, ipfs.clone()).unwrap();
    (ipfs, tracker)
}

fn slow_ipfs() -> MockIpfs {
    MockIpfs::default().with_slow(SLOW_CID, Duration::from_secs(2))
}

async fn wait_for_status(t: &PinTracker<MockIpfs>, c: &str, want: TrackerStatus) {
    let c = cid(c);
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        while t.status(&c).status != want {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        res.is_ok(),
        "{c} never reached {want}, stuck at {}",
        t.status(&c).status
    );
}

#[tokio::test]
async fn test_new_and_shutdown_twice() {
    let (_ipfs, tracker) = new_tracker(MockIpfs::default(), 10);
    assert!(tracker.shutdown().await.is_ok());
    assert!(tracker.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_new_requires_workers() {
    let cfg = TrackerCfg {
        concurrent_pins: 0,
        ..Default::default()
    };
    assert!(PinTracker::new(&cfg, Arc::new(MockIpfs::default())).is_err());
}

#[tokio::test]
async fn test_untrack_track() {
    let (ipfs, tracker) = new_tracker(MockIpfs::default(), 10);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;

    tracker.untrack(CID1).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Unpinned).await;

    assert!(tracker.optracker().get_operation(&cid(CID1)).is_none());
    assert_eq!(ipfs.pin_calls(CID1), 1);
    assert_eq!(ipfs.unpin_calls(CID1), 1);
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_track_untrack_with_cancel() {
    let (ipfs, tracker) = new_tracker(slow_ipfs(), 10);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await; // let pinning start

    let info = tracker.status(&cid(SLOW_CID));
    assert_eq!(info.status, TrackerStatus::Pinning);

    let ctx = tracker.optracker().op_context(&cid(SLOW_CID));
    tracker.untrack(SLOW_CID).unwrap();
    tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
        .await
        .expect("operation context should have been cancelled by now");

    // the unpin takes over once the pin worker let go
    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Unpinning).await;
    assert_eq!(ipfs.pin_calls(SLOW_CID), 1);
    assert!(!ipfs.overlap_detected());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_track_untrack_with_no_cancel() {
    let (ipfs, tracker) = new_tracker(slow_ipfs(), 1);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tracker.track(Pin::new(CID3)).unwrap();

    // fast pin is queued because the slow pin holds the only slot
    assert_eq!(tracker.status(&cid(CID3)).status, TrackerStatus::PinQueued);

    tracker.untrack(CID3).unwrap();
    let info = tracker.status(&cid(CID3));
    assert_eq!(info.status, TrackerStatus::Unpinned);
    assert!(tracker.optracker().get_operation(&cid(CID3)).is_none());
    assert!(tracker.optracker().op_context(&cid(CID3)).is_cancelled());

    tracker.shutdown().await.unwrap();
    assert_eq!(ipfs.pin_calls(CID3), 0);
    assert_eq!(ipfs.unpin_calls(CID3), 0);
}

#[tokio::test]
async fn test_untrack_track_with_cancel() {
    let (ipfs, tracker) = new_tracker(slow_ipfs(), 10);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Untrack should cancel the ongoing pin and unpin right away
    tracker.untrack(SLOW_CID).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let info = tracker.status(&cid(SLOW_CID));
    assert_eq!(info.status, TrackerStatus::Unpinning);

    let ctx = tracker.optracker().op_context(&cid(SLOW_CID));
    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
        .await
        .expect("operation context should have been cancelled by now");

    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinning).await;
    assert_eq!(ipfs.pin_calls(SLOW_CID), 2);
    assert_eq!(ipfs.unpin_calls(SLOW_CID), 1);
    assert!(!ipfs.overlap_detected());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_untrack_track_with_no_cancel() {
    let ipfs = MockIpfs::default().with_slow(SLOW_CID, Duration::from_millis(500));
    let (ipfs, tracker) = new_tracker(ipfs, 1);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tracker.track(Pin::new(CID2)).unwrap();

    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinned).await;
    wait_for_status(&tracker, CID2, TrackerStatus::Pinned).await;

    tracker.untrack(SLOW_CID).unwrap();
    tracker.untrack(CID2).unwrap();

    let info = tracker.status(&cid(CID2));
    assert_eq!(info.status, TrackerStatus::UnpinQueued);

    tracker.track(Pin::new(CID2)).unwrap();
    assert_eq!(tracker.status(&cid(CID2)).status, TrackerStatus::Pinned);

    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Unpinned).await;
    tracker.shutdown().await.unwrap();

    assert_eq!(ipfs.unpin_calls(CID2), 0);
    assert_eq!(ipfs.pin_calls(CID2), 1);
    assert_eq!(tracker.status(&cid(CID2)).status, TrackerStatus::Pinned);
}

#[tokio::test]
async fn test_untrack_after_queued_retrack_unpins() {
    let ipfs = MockIpfs::default().with_slow(SLOW_CID, Duration::from_millis(500));
    let (ipfs, tracker) = new_tracker(ipfs, 1);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;
    tracker.track(Pin::new(SLOW_CID)).unwrap();
    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinning).await;

    // the only slot is busy, so the re-track waits in the queue
    tracker.track(Pin::new(CID1)).unwrap();
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::PinQueued);

    // cancelling it must not forget that CID1 is pinned on the daemon
    tracker.untrack(CID1).unwrap();
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::UnpinQueued);

    wait_for_status(&tracker, CID1, TrackerStatus::Unpinned).await;
    assert_eq!(ipfs.pin_calls(CID1), 1);
    assert_eq!(ipfs.unpin_calls(CID1), 1);
    assert!(tracker.optracker().get_operation(&cid(CID1)).is_none());
    assert!(!ipfs.overlap_detected());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pin_error_survives_cancelled_unpin() {
    let ipfs = MockIpfs::default()
        .with_failing(CID1)
        .with_slow(SLOW_CID, Duration::from_millis(500));
    let (ipfs, tracker) = new_tracker(ipfs, 1);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::PinError).await;
    tracker.track(Pin::new(SLOW_CID)).unwrap();
    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinning).await;

    tracker.untrack(CID1).unwrap();
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::UnpinQueued);
    tracker.track(Pin::new(CID1)).unwrap();

    // no pin ever succeeded, so the error comes back rather than Pinned
    let info = tracker.status(&cid(CID1));
    assert_eq!(info.status, TrackerStatus::PinError);
    assert!(info.error.unwrap().contains("mock pin failure"));

    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinned).await;
    tracker.shutdown().await.unwrap();
    assert_eq!(ipfs.pin_calls(CID1), 1);
    assert_eq!(ipfs.unpin_calls(CID1), 0);
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::PinError);
}

#[tokio::test]
async fn test_shutdown_settles_outstanding_records() {
    let (ipfs, tracker) = new_tracker(slow_ipfs(), 1);

    tracker.track(Pin::new(CID2)).unwrap();
    wait_for_status(&tracker, CID2, TrackerStatus::Pinned).await;
    tracker.track(Pin::new(SLOW_CID)).unwrap();
    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Pinning).await;

    tracker.track(Pin::new(CID1)).unwrap();
    tracker.untrack(CID2).unwrap();
    assert_eq!(tracker.status(&cid(CID2)).status, TrackerStatus::UnpinQueued);

    tracker.shutdown().await.unwrap();

    let slow = tracker.status(&cid(SLOW_CID));
    assert_eq!(slow.status, TrackerStatus::PinError);
    assert_eq!(slow.error.as_deref(), Some("cancelled by shutdown"));
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::Unpinned);
    assert_eq!(tracker.status(&cid(CID2)).status, TrackerStatus::Pinned);
    assert!(tracker.status_all().iter().all(|i| !i.status.is_active()));
    assert!(tracker.optracker().op_context(&cid(SLOW_CID)).is_cancelled());
    assert_eq!(ipfs.pin_calls(CID1), 0);
    assert_eq!(ipfs.unpin_calls(CID2), 0);
}

#[tokio::test]
async fn test_track_is_idempotent_while_active() {
    let (ipfs, tracker) = new_tracker(slow_ipfs(), 10);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracker.track(Pin::new(SLOW_CID)).unwrap();

    assert_eq!(tracker.status_all().len(), 1);
    assert_eq!(ipfs.pin_calls(SLOW_CID), 1);
    assert!(!tracker.optracker().op_context(&cid(SLOW_CID)).is_cancelled());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flapping_requests_never_overlap() {
    let ipfs = MockIpfs::default().with_slow(SLOW_CID, Duration::from_millis(50));
    let (ipfs, tracker) = new_tracker(ipfs, 4);

    for i in 0..20 {
        if i % 2 == 0 {
            tracker.track(Pin::new(SLOW_CID)).unwrap();
        } else {
            tracker.untrack(SLOW_CID).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(7 * (i % 5) as u64)).await;
    }
    // last request was an unpin
    wait_for_status(&tracker, SLOW_CID, TrackerStatus::Unpinned).await;

    assert!(!ipfs.overlap_detected());
    assert!(tracker.optracker().is_empty());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_in_progress_never_exceeds_pool() {
    let cids = [
        "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmc",
        "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmme",
        "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmf",
        "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmg",
        "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmh",
    ];
    let ipfs = cids.iter().fold(MockIpfs::default(), |m, c| {
        m.with_slow(c, Duration::from_millis(100))
    });
    let (_ipfs, tracker) = new_tracker(ipfs, 2);

    for c in cids {
        tracker.track(Pin::new(c)).unwrap();
    }
    for _ in 0..40 {
        let pinning = tracker
            .status_all()
            .iter()
            .filter(|i| i.status == TrackerStatus::Pinning)
            .count();
        assert!(pinning <= 2, "{pinning} operations in progress");
        assert!(tracker.scheduler().in_flight() <= 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for c in cids {
        wait_for_status(&tracker, c, TrackerStatus::Pinned).await;
    }
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pin_failure_is_reported_and_recovered() {
    let ipfs = MockIpfs::default().with_failing(CID1);
    let (ipfs, tracker) = new_tracker(ipfs, 2);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::PinError).await;
    let info = tracker.status(&cid(CID1));
    assert!(info.error.unwrap().contains("mock pin failure"));

    let info = tracker.recover(&cid(CID1)).unwrap();
    assert_eq!(info.status, TrackerStatus::PinQueued);
    assert!(info.error.is_none());
    wait_for_status(&tracker, CID1, TrackerStatus::PinError).await;
    assert_eq!(ipfs.pin_calls(CID1), 2);

    // nothing to recover for untracked cids
    let info = tracker.recover(&cid(CID2)).unwrap();
    assert_eq!(info.status, TrackerStatus::Unpinned);
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recover_all_retries_errored_records() {
    let (ipfs, tracker) = new_tracker(MockIpfs::default(), 2);

    tracker.track(Pin::new(CID1)).unwrap();
    tracker.track(Pin::new(CID2)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;
    wait_for_status(&tracker, CID2, TrackerStatus::Pinned).await;
    tracker.untrack(CID2).unwrap();
    wait_for_status(&tracker, CID2, TrackerStatus::Unpinned).await;
    tracker.track(Pin::new(CID2)).unwrap();
    wait_for_status(&tracker, CID2, TrackerStatus::Pinned).await;

    tracker.optracker().set_error(&cid(CID1), "test error");
    tracker.optracker().set_error(&cid(CID2), "test error");
    let recovered = tracker.recover_all().unwrap();
    assert_eq!(recovered.len(), 2);
    assert!(recovered.iter().all(|i| i.status == TrackerStatus::PinQueued));

    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;
    wait_for_status(&tracker, CID2, TrackerStatus::Pinned).await;
    assert_eq!(ipfs.pin_calls(CID1), 2);
    assert_eq!(ipfs.pin_calls(CID2), 3);
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let (ipfs, tracker) = new_tracker(MockIpfs::default(), 2);

    assert!(matches!(
        tracker.track(Pin::new("cidA")),
        Err(TrackerError::InvalidCid(_))
    ));
    assert!(matches!(
        tracker.untrack("not-a-cid"),
        Err(TrackerError::InvalidCid(_))
    ));
    let mut pin = Pin::new(CID1);
    pin.replication_factor_min = 5;
    pin.replication_factor_max = 1;
    assert!(matches!(tracker.track(pin), Err(TrackerError::InvalidPin(_))));

    assert!(tracker.status_all().is_empty());
    tracker.shutdown().await.unwrap();
    assert_eq!(ipfs.call_order().len(), 0);
}

#[tokio::test]
async fn test_requests_after_shutdown_fail() {
    let (_ipfs, tracker) = new_tracker(MockIpfs::default(), 2);
    tracker.shutdown().await.unwrap();

    assert!(matches!(
        tracker.track(Pin::new(CID1)),
        Err(TrackerError::ShutDown)
    ));
    assert!(matches!(tracker.untrack(CID1), Err(TrackerError::ShutDown)));
    assert!(matches!(tracker.sync_all().await, Err(TrackerError::ShutDown)));
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::Unpinned);
}

#[tokio::test]
async fn test_stateless_tracker_sync_all() {
    let cases = [
        ("basic stateless syncall", MockIpfs::default()),
        ("slow stateless syncall", slow_ipfs()),
    ];

    for (name, ipfs) in cases {
        let ipfs = ipfs
            .with_pin_ls_all(&[(CID1, RemotePinStatus::Recursive)])
            .with_pinned(&[CID1, CID2]);
        let (ipfs, tracker) = new_tracker(ipfs, 10);

        let got = tracker.sync_all().await.unwrap();
        assert!(got.is_empty(), "{name}: should not sync anything when tracking nothing");
        assert_eq!(ipfs.pin_ls_all_calls(), 0);

        for c in [CID1, CID2] {
            tracker.track(Pin::new(c)).unwrap();
            tracker.optracker().set_error(&cid(c), "test error");
        }

        let mut got = tracker.sync_all().await.unwrap();
        got.sort_by(|a, b| a.cid.cmp(&b.cid));

        let want = {
            let mut w = vec![cid(CID1), cid(CID2)];
            w.sort();
            w
        };
        assert_eq!(got.len(), 2, "{name}");
        for (info, c) in got.iter().zip(want) {
            assert_eq!(info.cid, c, "{name}");
            assert_eq!(info.status, TrackerStatus::Pinned, "{name}");
            assert!(info.error.is_none(), "{name}");
        }
        // CID1 came from the listing, only CID2 needed a point lookup
        assert_eq!(ipfs.pin_ls_single_calls(), 1, "{name}");

        // nothing left to correct
        assert!(tracker.sync_all().await.unwrap().is_empty(), "{name}");
        tracker.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_sync_all_drops_records_absent_remotely() {
    let ipfs = MockIpfs::default().with_pin_ls_all(&[]);
    let (_ipfs, tracker) = new_tracker(ipfs, 2);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;
    tracker.optracker().set_error(&cid(CID1), "test error");

    let got = tracker.sync_all().await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].status, TrackerStatus::Unpinned);
    assert!(tracker.optracker().is_empty());
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_all_leaves_active_operations_alone() {
    let ipfs = slow_ipfs().with_pin_ls_all(&[]);
    let (ipfs, tracker) = new_tracker(ipfs, 2);

    tracker.track(Pin::new(SLOW_CID)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let got = tracker.sync_all().await.unwrap();
    assert!(got.is_empty());
    assert_eq!(ipfs.pin_ls_all_calls(), 0);
    assert_eq!(tracker.status(&cid(SLOW_CID)).status, TrackerStatus::Pinning);
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_all_returns_partial_results_on_failure() {
    // no listing available, point lookups only
    let mut ipfs = MockIpfs::default().with_pinned(&[CID1]);
    ipfs.pin_ls_single_failing.insert(CID2.to_string());
    let (_ipfs, tracker) = new_tracker(ipfs, 2);

    for c in [CID1, CID2] {
        tracker.track(Pin::new(c)).unwrap();
        wait_for_status(&tracker, c, TrackerStatus::Pinned).await;
        tracker.optracker().set_error(&cid(c), "test error");
    }

    match tracker.sync_all().await {
        Err(TrackerError::Sync { partial, failures }) => {
            assert_eq!(partial.len(), 1);
            assert_eq!(partial[0].cid, cid(CID1));
            assert_eq!(partial[0].status, TrackerStatus::Pinned);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, cid(CID2));
        }
        other => panic!("expected partial sync error, got {other:?}"),
    }

    // reconciled progress is kept
    assert_eq!(tracker.status(&cid(CID1)).status, TrackerStatus::Pinned);
    assert_eq!(tracker.status(&cid(CID2)).status, TrackerStatus::PinError);
    tracker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_single_cid() {
    let ipfs = MockIpfs::default().with_pinned(&[CID1]);
    let (_ipfs, tracker) = new_tracker(ipfs, 2);

    let info = tracker.sync(&cid(CID2)).await.unwrap();
    assert_eq!(info.status, TrackerStatus::Unpinned);

    tracker.track(Pin::new(CID1)).unwrap();
    wait_for_status(&tracker, CID1, TrackerStatus::Pinned).await;
    tracker.optracker().set_error(&cid(CID1), "test error");

    let info = tracker.sync(&cid(CID1)).await.unwrap();
    assert_eq!(info.status, TrackerStatus::Pinned);
    assert!(info.error.is_none());
    assert!(tracker.optracker().filter(&[Phase::Error]).is_empty());
    tracker.shutdown().await.unwrap();
}
