use anyhow::Result;
use tokio::sync::oneshot;
use wirecall::{Client, EngineConfig, Role, RpcError, Server, Status};

fn server_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Server)
}

fn client_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Client)
}

/// Server and client rendezvous on the same inproc name inside one
/// runtime: "add" sums two big-endian i32s.
#[tokio::test]
async fn inproc_add_round_trip() -> Result<()> {
    let server = Server::new(server_config("inproc://t5"))?;
    server.register("add", |ctx, payload| {
        let a = i32::from_be_bytes(payload[0..4].try_into().unwrap());
        let b = i32::from_be_bytes(payload[4..8].try_into().unwrap());
        ctx.respond(Status::Ok, &(a + b).to_be_bytes()).unwrap();
    })?;
    server.start().await?;

    let client = Client::new(client_config("inproc://t5"))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call(
        "add",
        &[0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x05],
        move |status, payload| {
            let _ = tx.send((status, payload.to_vec()));
        },
    )?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, vec![0x00, 0x00, 0x00, 0x0C]);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}

/// Several clients attach to one inproc listener; responses route back to
/// the caller that issued the request.
#[tokio::test]
async fn inproc_serves_multiple_attachments() -> Result<()> {
    let server = Server::new(server_config("inproc://fanin"))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = Client::new(client_config("inproc://fanin"))?;
        client.connect().await?;
        clients.push(client);
    }

    for (i, client) in clients.iter().enumerate() {
        let marker = vec![i as u8; 4];
        let expected = marker.clone();
        let (tx, rx) = oneshot::channel();
        client.call("echo", &marker, move |status, payload| {
            let _ = tx.send((status, payload.to_vec()));
        })?;
        let (status, payload) = rx.await?;
        assert_eq!(status, Status::Ok);
        assert_eq!(payload, expected);
    }
    assert_eq!(server.requests_received(), 3);

    for client in &clients {
        client.disconnect().await?;
    }
    server.stop().await?;
    Ok(())
}

/// Stopping the inproc server frees the rendezvous name and disconnects
/// attached clients.
#[tokio::test]
async fn inproc_teardown_releases_the_name() -> Result<()> {
    let server = Server::new(server_config("inproc://short-lived"))?;
    server.register("sink", |_ctx, _payload| {})?;
    server.start().await?;

    let client = Client::new(client_config("inproc://short-lived"))?;
    client.connect().await?;

    server.stop().await?;
    client.disconnect().await?;

    // The name is free again for a successor server.
    let successor = Server::new(server_config("inproc://short-lived"))?;
    successor.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    successor.start().await?;

    let client = Client::new(client_config("inproc://short-lived"))?;
    client.connect().await?;
    let (tx, rx) = oneshot::channel();
    client.call("echo", b"again", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"again");

    client.disconnect().await?;
    successor.stop().await?;
    Ok(())
}

/// Oversized payloads are rejected synchronously before they are framed.
#[tokio::test]
async fn inproc_rejects_oversized_payload() -> Result<()> {
    let server = Server::new(server_config("inproc://limits"))?;
    server.register("sink", |_ctx, _payload| {})?;
    server.start().await?;

    let mut config = client_config("inproc://limits");
    config.max_payload_bytes = 64;
    let client = Client::new(config)?;
    client.connect().await?;

    let oversized = vec![0u8; 65];
    assert!(matches!(
        client.call("sink", &oversized, |_s, _p| {}),
        Err(RpcError::InvalidArgument(_))
    ));
    assert_eq!(client.pending_calls(), 0);

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}
