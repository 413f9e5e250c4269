//! Service lifecycle: bootstrap, pairing, reconnect, single-writer.

mod support;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use herald_daemon::State;
use herald_shared::ServiceError;
use herald_wa::WaEvent;

use support::*;

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_pairing_reaches_connected() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();
    client.authenticated.store(false, Ordering::SeqCst);
    client.qr_codes.lock().unwrap().push("2@qr-payload-1".into());
    *client.pair_script.lock().unwrap() = vec![
        WaEvent::PairSuccess {
            device: "12025550123:7@s.whatsapp.net".into(),
        },
        WaEvent::Connected,
    ];

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();

    // Fresh data dir with no session: the daemon parks in unauthenticated.
    wait_until("unauthenticated state", || {
        manager.state() == State::Unauthenticated
    })
    .await;
    assert_eq!(manager.qr(), "");

    // Drive pairing from a second task so the QR snapshot is observable
    // while the handshake is still in flight.
    let mut saw_qr = false;
    let auth = {
        let started = Instant::now();
        let fut = manager.initiate_auth();
        tokio::pin!(fut);
        loop {
            tokio::select! {
                result = &mut fut => break result.map(|()| started.elapsed()),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {
                    if manager.qr() == "2@qr-payload-1" {
                        assert_eq!(manager.state(), State::Pairing);
                        saw_qr = true;
                    }
                }
            }
        }
    };
    let elapsed = auth.unwrap();
    assert!(saw_qr, "QR payload never became visible");
    assert!(elapsed < Duration::from_secs(5), "QR flow took {elapsed:?}");

    assert_eq!(manager.state(), State::Connected);
    assert_eq!(manager.qr(), "");
    assert!(manager.status().ready);

    let diag = manager.diagnostics().await.unwrap();
    assert!(diag.authenticated);
    assert!(diag.lock_held);

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_error_fails_auth_and_sets_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();
    client.authenticated.store(false, Ordering::SeqCst);
    client.qr_codes.lock().unwrap().push("2@qr".into());
    *client.pair_script.lock().unwrap() = vec![WaEvent::PairError {
        reason: "client outdated".into(),
    }];

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();
    wait_until("unauthenticated state", || {
        manager.state() == State::Unauthenticated
    })
    .await;

    let err = manager.initiate_auth().await.unwrap_err();
    assert!(matches!(err, ServiceError::Protocol(_)), "got {err}");
    assert_eq!(manager.state(), State::Error);
    assert!(manager
        .status()
        .error
        .unwrap()
        .contains("client outdated"));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_success_alone_is_not_enough() {
    // The stricter auth variant: PairSuccess without a Connected event only
    // completes after the timeout re-check confirms authentication. With a
    // 30 s window that path is too slow for a test, so verify the inverse:
    // the flow is still pending right after PairSuccess arrives.
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();
    client.authenticated.store(false, Ordering::SeqCst);
    client.qr_codes.lock().unwrap().push("2@qr".into());
    *client.pair_script.lock().unwrap() = vec![WaEvent::PairSuccess {
        device: "1:2@s.whatsapp.net".into(),
    }];

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();
    wait_until("unauthenticated state", || {
        manager.state() == State::Unauthenticated
    })
    .await;

    let fut = manager.initiate_auth();
    tokio::pin!(fut);
    let pending = tokio::time::timeout(Duration::from_secs(2), &mut fut).await;
    assert!(
        pending.is_err(),
        "auth must keep waiting for Connected after PairSuccess"
    );

    // A late Connected event completes the flow.
    client.connected.store(true, Ordering::SeqCst);
    client.publish(WaEvent::Connected);
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("auth finishes after Connected")
        .unwrap();
    assert_eq!(manager.state(), State::Connected);

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn initiate_auth_while_connected_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();
    wait_until("connected state", || manager.state() == State::Connected).await;

    let err = manager.initiate_auth().await.unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyAuthenticated));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_disconnect_reconnects_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();
    wait_until("connected state", || manager.state() == State::Connected).await;
    let calls_before = client.connect_calls.load(Ordering::SeqCst);

    // One failing attempt (after 1 s), then success (after 2 s more).
    client.fail_connects.store(1, Ordering::SeqCst);
    client.connected.store(false, Ordering::SeqCst);
    let started = Instant::now();
    client.publish(WaEvent::Disconnected);

    wait_until("reconnected", || {
        manager.state() == State::Connected
            && client.connect_calls.load(Ordering::SeqCst) >= calls_before + 2
    })
    .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "backoff skipped: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(5), "too slow: {elapsed:?}");

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_instance_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();

    let first = manager_with(&client, test_config(dir.path()));
    first.start().await.unwrap();
    wait_until("connected state", || first.state() == State::Connected).await;

    let second = manager_with(&FakeClient::new(), test_config(dir.path()));
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyRunning(_)), "got {err}");
    assert_eq!(second.state(), State::Error);

    first.stop().await.unwrap();

    // Once the first instance releases everything, the directory is usable.
    let third = manager_with(&client, test_config(dir.path()));
    third.start().await.unwrap();
    third.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_keeps_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakeClient::new();

    let manager = manager_with(&client, test_config(dir.path()));
    manager.start().await.unwrap();
    wait_until("connected state", || manager.state() == State::Connected).await;

    client.publish(WaEvent::Message(text_envelope(
        "12025550100@s.whatsapp.net",
        "m1",
        "kept",
        1000,
    )));
    wait_until_async("message stored", || async {
        manager
            .list_messages("12025550100@s.whatsapp.net", 10)
            .await
            .map(|m| m.len() == 1)
            .unwrap_or(false)
    })
    .await;

    manager.logout().await.unwrap();
    assert_eq!(manager.state(), State::Unauthenticated);

    let diag = manager.diagnostics().await.unwrap();
    assert!(!diag.authenticated);
    assert_eq!(diag.message_count, 1);

    manager.stop().await.unwrap();
}
