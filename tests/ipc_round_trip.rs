use anyhow::Result;
use tokio::sync::oneshot;
use wirecall::{Client, EngineConfig, Role, Server, Status};

fn server_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Server)
}

fn client_config(url: &str) -> EngineConfig {
    EngineConfig::new(url.parse().unwrap(), Role::Client)
}

/// Echo over a Unix-domain socket, with the socket file cleaned up on
/// server stop.
#[tokio::test]
async fn ipc_echo_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("engine.sock");
    let url = format!("ipc://{}", path.display());

    let server = Server::new(server_config(&url))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;
    assert!(path.exists());

    let client = Client::new(client_config(&url))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call("echo", b"over the socket", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"over the socket");

    client.disconnect().await?;
    server.stop().await?;
    assert!(!path.exists(), "server should remove its socket file");
    Ok(())
}

/// A socket file left behind by a dead server does not block a new one
/// from binding.
#[tokio::test]
async fn ipc_listen_replaces_stale_socket_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stale.sock");
    let url = format!("ipc://{}", path.display());

    // Simulate the leftover of an unclean shutdown.
    std::fs::write(&path, b"")?;

    let server = Server::new(server_config(&url))?;
    server.register("echo", |ctx, payload| {
        ctx.respond(Status::Ok, payload).unwrap();
    })?;
    server.start().await?;

    let client = Client::new(client_config(&url))?;
    client.connect().await?;

    let (tx, rx) = oneshot::channel();
    client.call("echo", b"rebound", move |status, payload| {
        let _ = tx.send((status, payload.to_vec()));
    })?;
    let (status, payload) = rx.await?;
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"rebound");

    client.disconnect().await?;
    server.stop().await?;
    Ok(())
}
