//! Wires up a registry (axum HTTP service), a server that heartbeats into
//! it, and an `XClient` that discovers and calls through `RegistryDiscovery`.

use std::sync::Arc;
use std::time::Duration;

use rpcie::discovery::{RegistryDiscovery, SelectMode};
use rpcie::error::RpcError;
use rpcie::registry::{Heartbeat, Registry};
use rpcie::server::{listen_and_serve, Server};
use rpcie::service::ServiceBuilder;
use rpcie::{ConnectOption, XClient};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy)]
struct Foo;

#[derive(Deserialize, Serialize, Clone)]
struct Args {
    a: i64,
    b: i64,
}

#[tokio::main]
async fn main() -> Result<(), RpcError> {
    tracing_subscriber::fmt::init();

    let registry = Registry::new(Duration::from_secs(300));
    let registry_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let registry_addr = registry_listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(registry_listener, registry.router()).await;
    });
    let registry_url = format!("http://{registry_addr}{}", rpcie::protocol::DEFAULT_REGISTRY_PATH);

    let server = Arc::new(Server::new());
    server
        .register(
            ServiceBuilder::new("Foo", Foo)
                .method("Sum", |_receiver, args: Args| async move {
                    Ok::<i64, RpcError>(args.a + args.b)
                })
                .build(),
        )
        .await?;
    let addr = listen_and_serve(server, "127.0.0.1:0").await?;
    let _heartbeat = Heartbeat::start(registry_url.clone(), addr.to_string(), Some(Duration::from_secs(1)));

    // Give the first heartbeat a moment to land before discovery reads it back.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let discovery = Arc::new(RegistryDiscovery::new(registry_url));
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, ConnectOption::default());

    let reply: i64 = xclient.call("Foo.Sum", &Args { a: 10, b: 20 }).await?;
    println!("via registry: Foo.Sum(10, 20) = {reply}");
    assert_eq!(reply, 30);

    xclient.close().await?;
    Ok(())
}
