use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use wirecall::{Client, EngineConfig, Role, RpcError, Server, Status};

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

/// Echo request/response over TCP: the payload comes back byte-for-byte
/// with `Status::Ok`.
#[tokio::test]
async fn tcp_echo_round_trip() -> Result<()> {
    init_logging();
    let server = Server::new(server_config("tcp://127.0.0.1:35001"))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35001"))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call("echo", b"hi", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"hi");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(server.requests_received(), 1);
    assert_eq!(server.responses_sent(), 1);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// A call to a method nobody registered completes with `MethodNotFound`
/// and an empty payload.
#[tokio::test]
async fn unknown_method_is_reported() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35002"))?;
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35002"))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call("missing", &[], move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::MethodNotFound);
    assert!(payload.is_empty());

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// A panicking handler is answered with `InternalError` and the
/// connection stays usable for the next call.
#[tokio::test]
async fn handler_panic_becomes_internal_error() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35011"))?;
    server.register("boom", |_ctx, _payload| {
        panic!("handler blew up");
    })?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35011"))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call("boom", b"x", move |status, _payload| {
        let _ = tx.send(status);
    })?;
    assert_eq!(rx.await?, Status::InternalError);

    // The connection survived the panic.
    let (tx, rx) = oneshot::channel();
    client.call("echo", b"still alive", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"still alive");

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// Oneway requests reach the handler, carry msgid zero, and refuse to be
/// responded to.
#[tokio::test]
async fn oneway_is_dispatched_without_a_response() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = Server::new(server_config("tcp://127.0.0.1:35012"))?;
    {
        let hits = hits.clone();
        server.register("notify", move |ctx, payload| {
            assert!(ctx.is_oneway());
            assert_eq!(ctx.msgid(), 0);
            assert_eq!(payload, b"ping");
            assert!(matches!(
                ctx.respond(Status::Ok, &[]),
                Err(RpcError::InvalidState(_))
            ));
            hits.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35012"))?;
    client.connect().await?;
    client.call_oneway("notify", b"ping")?;

    // No completion exists for a oneway; poll the server side instead.
    for _ in 0..100 {
        if hits.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(server.requests_received(), 1);
    assert_eq!(server.responses_sent(), 0);
    assert_eq!(client.pending_calls(), 0);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// A deadline on a call whose handler never responds fires the completion
/// with `Timeout` and clears the pending entry.
#[tokio::test]
async fn deadline_expires_into_timeout() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35013"))?;
    server.register("sink", |_ctx, _payload| {
        // Intentionally never responds.
    })?;
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35013"))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call_with_deadline("sink", b"x", Duration::from_millis(100), move |status, _p| {
        let _ = tx.send(status);
    })?;
    assert_eq!(client.pending_calls(), 1);
    assert_eq!(rx.await?, Status::Timeout);
    assert_eq!(client.pending_calls(), 0);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// Malformed caller input is rejected synchronously, before anything
/// reaches the wire.
#[tokio::test]
async fn oversized_and_empty_methods_are_rejected() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35014"))?;
    server.start().await?;

    let client = Client::new(client_config("tcp://127.0.0.1:35014"))?;
    client.connect().await?;

    let oversized = "m".repeat(256);
    assert!(matches!(
        client.call(&oversized, &[], |_s, _p| {}),
        Err(RpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.call("", &[], |_s, _p| {}),
        Err(RpcError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.call_oneway(&oversized, &[]),
        Err(RpcError::InvalidArgument(_))
    ));
    assert_eq!(client.pending_calls(), 0);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// Completions run outside the engine's locks, so a completion may issue
/// the next call directly.
#[tokio::test]
async fn calls_can_be_reissued_from_inside_a_completion() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35015"))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    let client = Arc::new(Client::new(client_config("tcp://127.0.0.1:35015"))?);
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    let reissuer = client.clone();
    client.call("echo", b"first", move |status, _payload| {
        assert_eq!(status, Status::Ok);
        reissuer
            .call("echo", b"second", move |status, payload| {
                let _ = tx.send((status, payload.to_vec()));
            })
            .unwrap();
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"second");

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// Registration is frozen at start: duplicates fail before, everything
/// fails after.
#[tokio::test]
async fn registry_freezes_at_start() -> Result<()> {
    let server = Server::new(server_config("tcp://127.0.0.1:35016"))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    assert!(matches!(
        server.register("echo", |_ctx, _p| {}),
        Err(RpcError::AlreadyExists(_))
    ));
    server.start().await?;
    assert!(matches!(
        server.register("late", |_ctx, _p| {}),
        Err(RpcError::InvalidState(_))
    ));

    server.stop().await?;
    Ok(())
}
