use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use wirecall::{Client, ConnectionState, EngineConfig, Role, RpcError, Server, Status};

fn server_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Server)
}

fn client_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Client)
}

/// Route engine diagnostics through the test harness when RUST_LOG asks
/// for them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// With a pending table of four and a handler that never responds, the
/// fifth synchronous call is refused with `Backpressure` while the first
/// four stay outstanding, and a disconnect then drains each of the four
/// completions exactly once with `Disconnected`.
#[tokio::test]
async fn pending_table_backpressure_and_disconnect_drain() -> Result<()> {
    init_logging();
    let server = Server::new(server_config("tcp://127.0.0.1:35021"))?;
    server.register("sink", |_ctx, _payload| {
        // Intentionally never responds; every call stays pending.
    })?;
    server.start().await?;

    let mut config = client_config("tcp://127.0.0.1:35021");
    config.max_pending_callbacks = 4;
    let client = Client::new(config)?;
    client.connect().await?;

    let outcomes: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5u8 {
        let outcomes = outcomes.clone();
        let result = client.call("sink", &[i], move |status, _payload| {
            outcomes.lock().unwrap().push(status);
        });
        if i < 4 {
            assert!(result.is_ok(), "call {i} should be accepted");
        } else {
            assert!(
                matches!(result, Err(RpcError::Backpressure)),
                "call {i} should report backpressure"
            );
        }
    }
    assert_eq!(client.pending_calls(), 4);

    // No completion may fire while the calls are merely outstanding.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(outcomes.lock().unwrap().is_empty());

    client.disconnect().await?;

    let drained = outcomes.lock().unwrap().clone();
    assert_eq!(drained.len(), 4);
    assert!(drained.iter().all(|status| *status == Status::Disconnected));
    assert_eq!(client.pending_calls(), 0);

    // A drained client refuses further work until reconnected.
    assert!(matches!(
        client.call("sink", &[], |_s, _p| {}),
        Err(RpcError::InvalidState(_))
    ));
    assert!(matches!(
        client.call_oneway("sink", &[]),
        Err(RpcError::InvalidState(_))
    ));

    server.stop().await?;
    Ok(())
}

/// `connect` keeps retrying with backoff until the server shows up.
#[tokio::test]
async fn connect_retries_until_server_appears() -> Result<()> {
    let mut config = client_config("tcp://127.0.0.1:35022");
    config.reconnect_initial_ms = 50;
    config.reconnect_max_ms = 200;
    let client = Arc::new(Client::new(config)?);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    // The server is late; the client has to be retrying by now.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    let server = Server::new(server_config("tcp://127.0.0.1:35022"))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    connecting.await??;
    assert_eq!(client.state(), ConnectionState::Connected);

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.call("echo", b"late but here", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"late but here");

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// `disconnect` during the retry loop cancels the attempt; the connect
/// future resolves exactly once, with `Disconnected`.
#[tokio::test]
async fn disconnect_cancels_a_connecting_client() -> Result<()> {
    let mut config = client_config("tcp://127.0.0.1:35023");
    config.reconnect_initial_ms = 50;
    config.reconnect_max_ms = 200;
    let client = Arc::new(Client::new(config)?);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    client.disconnect().await?;
    assert!(matches!(connecting.await?, Err(RpcError::Disconnected)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

/// Stopping the server fails outstanding calls with `Disconnected` on the
/// client side, then the client reconnects once the server returns.
#[tokio::test]
async fn server_loss_drains_pending_and_reconnects() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35024"))?;
    server.register("sink", |_ctx, _payload| {})?;
    server.start().await?;

    let mut config = client_config("tcp://127.0.0.1:35024");
    config.reconnect_initial_ms = 50;
    config.reconnect_max_ms = 200;
    let client = Client::new(config)?;
    client.connect().await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.call("sink", b"doomed", move |status, _payload| {
        let _ = tx.send(status);
    })?;

    server.stop().await?;
    assert_eq!(rx.await?, Status::Disconnected);

    // A fresh server on the same endpoint picks the client back up.
    let revived = Server::new(server_config("tcp://127.0.0.1:35024"))?;
    revived.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    revived.start().await?;

    let mut reconnected = false;
    for _ in 0..100 {
        if client.state() == ConnectionState::Connected {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconnected, "client should have reconnected on its own");

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.call("echo", b"back", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"back");

    client.disconnect().await?;
    revived.stop().await?;
    Ok(())
}
