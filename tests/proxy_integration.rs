//! End-to-end tests for the proxy: real sockets, real echo backends.
#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use portgate::config::{AppConfig, Config};
use portgate::proxy::Proxy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CHUNK: usize = 4096;
const CHUNKS: usize = 256; // 1 MiB per client

// ============================================================================
// Test Helpers
// ============================================================================

/// Grab an ephemeral port that is currently free.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Echo every connection on an already-bound listener until it is dropped.
fn serve_echo(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    })
}

/// Start an echo server on an ephemeral port.
async fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, serve_echo(listener))
}

fn single_app_config(name: &str, port: u16, targets: Vec<String>) -> Config {
    Config {
        apps: vec![AppConfig {
            name: name.to_string(),
            ports: vec![port],
            targets,
        }],
    }
}

fn start_proxy(config: &Config) -> (Arc<Proxy>, watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = Arc::new(Proxy::new(config, shutdown_rx).unwrap());
    let handle = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.run().await })
    };
    (proxy, shutdown_tx, handle)
}

async fn wait_until<F: Fn() -> bool>(cond: F, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Connect to a frontend, retrying while it finishes binding.
async fn connect_retry(port: u16) -> TcpStream {
    let start = Instant::now();
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(_) if start.elapsed() < Duration::from_secs(3) => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(e) => panic!("frontend on port {} never came up: {}", port, e),
        }
    }
}

/// One echoed round trip through the proxy.
async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(3), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

fn fill_pattern(seed: &mut u64, buf: &mut [u8]) {
    for byte in buf {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *byte = (*seed >> 56) as u8;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_round_trips_and_closes_on_hangup() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let front_port = free_port();
    let config =
        single_app_config("echo", front_port, vec![format!("127.0.0.1:{}", echo_port)]);
    let (proxy, shutdown_tx, _run) = start_proxy(&config);

    assert!(
        wait_until(
            || proxy.backends()[0].is_active(),
            Duration::from_secs(3)
        )
        .await,
        "backend never became active"
    );

    let mut client = connect_retry(front_port).await;
    echo_round_trip(&mut client, b"PING").await;

    // half-close from the client; the proxy must tear the pair down and
    // close our end too
    client.shutdown().await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("close was never observed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let _ = shutdown_tx.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_is_closed_when_no_backend_is_reachable() {
    // port 1 is never handed out as an ephemeral port and nothing listens on it
    let front_port = free_port();
    let config = single_app_config("dead", front_port, vec!["127.0.0.1:1".to_string()]);
    let (_proxy, shutdown_tx, _run) = start_proxy(&config);

    let mut client = connect_retry(front_port).await;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("proxy never closed the client")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected the client socket to be closed");

    let _ = shutdown_tx.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ten_connections_balance_across_two_backends() {
    let (echo_a, _srv_a) = spawn_echo_server().await;
    let (echo_b, _srv_b) = spawn_echo_server().await;
    let front_port = free_port();
    let config = single_app_config(
        "balanced",
        front_port,
        vec![
            format!("127.0.0.1:{}", echo_a),
            format!("127.0.0.1:{}", echo_b),
        ],
    );
    let (proxy, shutdown_tx, _run) = start_proxy(&config);

    assert!(
        wait_until(
            || proxy.backends().iter().all(|b| b.is_active()),
            Duration::from_secs(3)
        )
        .await,
        "backends never became active"
    );

    let mut clients = Vec::new();
    for i in 0..10u8 {
        let mut client = connect_retry(front_port).await;
        // the round trip guarantees both legs are registered before the
        // next connection is counted
        echo_round_trip(&mut client, &[i]).await;
        clients.push(client);
    }

    let count_a = proxy.backends()[0].connection_count() as i64;
    let count_b = proxy.backends()[1].connection_count() as i64;
    assert_eq!(count_a + count_b, 10);
    assert!(
        (count_a - count_b).abs() <= 1,
        "unbalanced: {} vs {}",
        count_a,
        count_b
    );

    let _ = shutdown_tx.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_backend_recovers_after_coming_up() {
    let target_port = free_port();
    let front_port = free_port();
    let config = single_app_config(
        "late",
        front_port,
        vec![format!("127.0.0.1:{}", target_port)],
    );
    let (proxy, shutdown_tx, _run) = start_proxy(&config);

    // while the target is down the proxy closes clients straight away
    let mut client = connect_retry(front_port).await;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("proxy never closed the client")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // bring the target up; the next active health probe flips the state
    let listener = TcpListener::bind(("127.0.0.1", target_port)).await.unwrap();
    let _echo = serve_echo(listener);
    assert!(
        wait_until(
            || proxy.backends()[0].is_active(),
            Duration::from_secs(8)
        )
        .await,
        "backend never recovered"
    );

    let mut client = connect_retry(front_port).await;
    echo_round_trip(&mut client, b"PING").await;

    let _ = shutdown_tx.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_live_tunnels_within_a_second() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let front_port = free_port();
    let config =
        single_app_config("echo", front_port, vec![format!("127.0.0.1:{}", echo_port)]);
    let (proxy, shutdown_tx, run) = start_proxy(&config);

    assert!(
        wait_until(
            || proxy.backends()[0].is_active(),
            Duration::from_secs(3)
        )
        .await
    );

    let mut client = connect_retry(front_port).await;
    echo_round_trip(&mut client, b"PING").await;

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), run)
        .await
        .expect("proxy did not stop within 1s")
        .unwrap();

    // the long-lived client observes the close
    let mut buf = [0u8; 1];
    match timeout(Duration::from_secs(1), client.read(&mut buf)).await {
        Ok(Ok(n)) => assert_eq!(n, 0),
        Ok(Err(_)) => {}
        Err(_) => panic!("client never observed the close"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_streams_arrive_intact_and_pool_is_reused() {
    let (echo_port, _echo) = spawn_echo_server().await;
    let front_port = free_port();
    let config =
        single_app_config("bulk", front_port, vec![format!("127.0.0.1:{}", echo_port)]);
    let (proxy, shutdown_tx, _run) = start_proxy(&config);

    assert!(
        wait_until(
            || proxy.backends()[0].is_active(),
            Duration::from_secs(3)
        )
        .await
    );

    async fn pump(port: u16, seed: u64) {
        let stream = connect_retry(port).await;
        let (mut read_half, mut write_half) = stream.into_split();

        let writer = tokio::spawn(async move {
            let mut seed = seed;
            let mut chunk = vec![0u8; CHUNK];
            for _ in 0..CHUNKS {
                fill_pattern(&mut seed, &mut chunk);
                write_half.write_all(&chunk).await.unwrap();
            }
            // keep the write half open until the echo has drained
            write_half
        });
        let reader = tokio::spawn(async move {
            let mut seed = seed;
            let mut expected = vec![0u8; CHUNK];
            let mut received = vec![0u8; CHUNK];
            for i in 0..CHUNKS {
                fill_pattern(&mut seed, &mut expected);
                read_half.read_exact(&mut received).await.unwrap();
                assert_eq!(received, expected, "stream corrupted at chunk {}", i);
            }
        });

        let write_half = writer.await.unwrap();
        timeout(Duration::from_secs(30), reader)
            .await
            .expect("echo stream stalled")
            .unwrap();
        drop(write_half);
    }

    let a = tokio::spawn(pump(front_port, 7));
    let b = tokio::spawn(pump(front_port, 99));
    a.await.unwrap();
    b.await.unwrap();

    // both tunnels are torn down once the clients drop; their buffers
    // return to the pool
    assert!(
        wait_until(
            || proxy.buf_pool().stats().puts() >= 4,
            Duration::from_secs(3)
        )
        .await,
        "copy buffers were never returned"
    );

    // one more short exchange must be served from the recycled buffers
    let mut client = connect_retry(front_port).await;
    echo_round_trip(&mut client, b"PING").await;
    assert!(
        wait_until(
            || proxy.buf_pool().stats().hits() > 0,
            Duration::from_secs(3)
        )
        .await,
        "buffer pool was never hit"
    );

    let _ = shutdown_tx.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_literal_config_document_round_trip() {
    // the documented configuration shape, verbatim
    let front_port = free_port();
    let (echo_port, _echo) = spawn_echo_server().await;
    let json = format!(
        r#"{{"Apps":[{{"Name":"a","Ports":[{}],"Targets":["127.0.0.1:{}"]}}]}}"#,
        front_port, echo_port
    );
    let config: Config = serde_json::from_str(&json).unwrap();
    config.validate().unwrap();

    let (proxy, shutdown_tx, _run) = start_proxy(&config);
    assert!(
        wait_until(
            || proxy.backends()[0].is_active(),
            Duration::from_secs(3)
        )
        .await
    );
    let mut client = connect_retry(front_port).await;
    echo_round_trip(&mut client, b"PING").await;

    let _ = shutdown_tx.send(true);
}
