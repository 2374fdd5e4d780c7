//! Health gate integration tests against a real TCP listener.
//!
//! The in-test server speaks just enough HTTP/1.1 for reqwest: it reads the
//! request, answers 503 until a readiness instant passes, then 200, and
//! counts every request it serves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally::healthcheck::{wait_until_healthy, HttpChecker, DEFAULT_POLL_INTERVAL};
use tally::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `GET /health` on an ephemeral port, returning 200 only after
/// `ready_after` has elapsed. Returns the URL and a request counter.
async fn spawn_health_server(ready_after: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&requests);
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let ready = started.elapsed() >= ready_after;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = if ready {
                    "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                } else {
                    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://127.0.0.1:{}/health", port), requests)
}

#[tokio::test]
async fn gate_polls_until_server_becomes_ready() {
    let (url, requests) = spawn_health_server(Duration::from_millis(2000)).await;
    let checker = HttpChecker::new(url).unwrap();

    let started = Instant::now();
    wait_until_healthy(&checker, Duration::from_secs(5), DEFAULT_POLL_INTERVAL)
        .await
        .expect("server becomes ready within the timeout");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1900),
        "resolved before the server was ready ({:?})",
        elapsed
    );

    // ~2000ms readiness at a fixed 500ms interval is about 4 attempts; allow
    // slack for scheduling but reject backoff-like behavior.
    let attempts = requests.load(Ordering::SeqCst);
    assert!(
        (3..=7).contains(&attempts),
        "expected ~4 fixed-interval attempts, saw {}",
        attempts
    );
}

#[tokio::test]
async fn immediate_200_resolves_on_first_attempt() {
    let (url, requests) = spawn_health_server(Duration::ZERO).await;
    let checker = HttpChecker::new(url).unwrap();

    wait_until_healthy(&checker, Duration::from_secs(5), DEFAULT_POLL_INTERVAL)
        .await
        .unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_503_times_out_with_elapsed_duration() {
    let (url, _requests) = spawn_health_server(Duration::from_secs(3600)).await;
    let checker = HttpChecker::new(url.clone()).unwrap();

    let err = wait_until_healthy(&checker, Duration::from_millis(1200), DEFAULT_POLL_INTERVAL)
        .await
        .unwrap_err();

    match err {
        Error::HealthTimeout { url: err_url, elapsed_ms } => {
            assert_eq!(err_url, url);
            assert!(elapsed_ms >= 900, "elapsed was only {}ms", elapsed_ms);
        }
        other => panic!("expected HealthTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn connection_refused_counts_as_not_ready() {
    // Bind then drop so the port is very likely unused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let checker = HttpChecker::new(format!("http://127.0.0.1:{}/health", port)).unwrap();

    let err = wait_until_healthy(&checker, Duration::from_millis(600), DEFAULT_POLL_INTERVAL)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HealthTimeout { .. }));
}
