mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{Connector, MockDispatcher, SESSION_COOKIE, config, wait_until};

const IDLE_ENGINE: &str = "cat >/dev/null";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_close_and_resends_credentials() {
    let mock = MockDispatcher::start().await;
    mock.state.drop_connections.store(1, Ordering::SeqCst);
    let dir = tempfile::tempdir().unwrap();
    let connector = Connector::spawn(config(&mock, dir.path(), IDLE_ENGINE));

    assert!(
        wait_until(Duration::from_secs(10), || mock.connections() >= 2).await,
        "connector did not reconnect"
    );

    let first_frames = mock.state.first_frames.lock().unwrap().clone();
    assert_eq!(first_frames[0].0, SESSION_COOKIE);
    assert_eq!(first_frames[1].0, SESSION_COOKIE);
    // Fixed one-second retry delay between the close and the next connect.
    let gap = first_frames[1].1.duration_since(first_frames[0].1);
    assert!(gap >= Duration::from_millis(900), "reconnected after {gap:?}");
    // The stored cookie was still valid, so only the first connect logged in.
    assert_eq!(mock.state.logins.load(Ordering::SeqCst), 1);

    connector.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keeps_retrying_until_dispatcher_comes_up() {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let dir = tempfile::tempdir().unwrap();
    let placeholder = MockDispatcher::start().await;
    let mut cfg = config(&placeholder, dir.path(), IDLE_ENGINE);
    cfg.hosts[0].server_url = format!("http://{addr}/");
    let connector = Connector::spawn(cfg);

    // Several refused attempts before anything listens.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let mock = MockDispatcher::start_on(addr).await;

    assert!(
        wait_until(Duration::from_secs(10), || mock.connections() >= 1).await,
        "connector gave up retrying"
    );
    assert_eq!(mock.state.first_frames.lock().unwrap()[0].0, SESSION_COOKIE);
    assert_eq!(placeholder.connections(), 0);

    connector.stop().await;
}
