//! The eight literal end-to-end scenarios from spec.md §8, each driven over
//! a real loopback TCP connection (no mocked transport).

use std::sync::Arc;
use std::time::Duration;

use rpcie::client::dial;
use rpcie::discovery::{Discovery, MultiServersDiscovery, SelectMode};
use rpcie::error::RpcError;
use rpcie::protocol::ConnectOption;
use rpcie::registry::{Heartbeat, Registry};
use rpcie::server::{listen_and_serve, Server};
use rpcie::service::ServiceBuilder;
use rpcie::xclient::XClient;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy)]
struct Foo;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
struct SumArgs {
    a: i64,
    b: i64,
}

#[derive(Deserialize, Serialize, Clone)]
struct SleepArgs {
    a: u64,
}

/// Spins up a `Foo` server with `Sum` and `Sleep` methods. `handle_timeout`
/// is per-connection (negotiated in the client's handshake `ConnectOption`,
/// per spec.md §3/§4.4), not a server-wide setting, so it is not a parameter
/// here.
async fn spin_up_foo() -> (std::net::SocketAddr, Arc<Server>) {
    let server = Arc::new(Server::new());
    server
        .register(
            ServiceBuilder::new("Foo", Foo)
                .method("Sum", |_recv, args: SumArgs| async move {
                    Ok::<i64, RpcError>(args.a + args.b)
                })
                .method("Sleep", |_recv, args: SleepArgs| async move {
                    tokio::time::sleep(Duration::from_secs(args.a)).await;
                    Ok::<i64, RpcError>(args.a as i64)
                })
                .build(),
        )
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_for_accept = server.clone();
    tokio::spawn(async move {
        server_for_accept.accept(listener).await;
    });
    (addr, server)
}

/// Scenario 1: basic unary call.
#[tokio::test]
async fn scenario_1_basic_unary() {
    let (addr, _server) = spin_up_foo().await;
    let client = dial(&addr.to_string(), None).await.unwrap();

    let reply: i64 = client.call("Foo.Sum", &SumArgs { a: 3, b: 4 }).await.unwrap();
    assert_eq!(reply, 7);

    client.close().await.unwrap();
}

/// Scenario 2: five concurrent calls multiplexed over one connection.
#[tokio::test]
async fn scenario_2_concurrent_calls() {
    let (addr, _server) = spin_up_foo().await;
    let client = Arc::new(dial(&addr.to_string(), None).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..5i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Foo.Sum", &SumArgs { a: i, b: i * i })
                .await
                .unwrap();
            assert_eq!(reply, i + i * i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    client.close().await.unwrap();
}

/// Scenario 3: server-side handle timeout fires but the connection stays
/// usable for a subsequent call.
#[tokio::test]
async fn scenario_3_server_handle_timeout() {
    let (addr, _server) = spin_up_foo().await;
    let option = ConnectOption {
        handle_timeout: Duration::from_secs(1),
        ..ConnectOption::default()
    };
    let client = dial(&addr.to_string(), Some(option)).await.unwrap();

    let err = client
        .call::<_, i64>("Foo.Sleep", &SleepArgs { a: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("request handle timeout"), "got: {err}");

    let reply: i64 = client.call("Foo.Sum", &SumArgs { a: 1, b: 2 }).await.unwrap();
    assert_eq!(reply, 3);

    client.close().await.unwrap();
}

/// Scenario 4: client-side context/deadline timeout, connection stays usable.
#[tokio::test]
async fn scenario_4_client_context_timeout() {
    let (addr, _server) = spin_up_foo().await;
    let client = dial(&addr.to_string(), None).await.unwrap();

    let err = client
        .call_with_deadline::<_, i64>("Foo.Sleep", &SleepArgs { a: 2 }, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("call failed"), "got: {err}");

    let reply: i64 = client.call("Foo.Sum", &SumArgs { a: 1, b: 1 }).await.unwrap();
    assert_eq!(reply, 2);

    client.close().await.unwrap();
}

/// Scenario 5: duplicate registration of the same service name fails.
#[tokio::test]
async fn scenario_5_duplicate_registration() {
    let server = Server::new();
    server
        .register(ServiceBuilder::new("Foo", Foo).method("Sum", |_r, a: SumArgs| async move { Ok::<i64, RpcError>(a.a + a.b) }).build())
        .await
        .unwrap();

    let err = server
        .register(ServiceBuilder::new("Foo", Foo).method("Sum", |_r, a: SumArgs| async move { Ok::<i64, RpcError>(a.a + a.b) }).build())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "rpc: service already defined: Foo");
}

/// Scenario 6: calling an unknown method surfaces a per-call error and
/// leaves the connection usable.
#[tokio::test]
async fn scenario_6_unknown_method() {
    let (addr, _server) = spin_up_foo().await;
    let client = dial(&addr.to_string(), None).await.unwrap();

    let err = client
        .call::<_, serde_json::Value>("Foo.Bogus", &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot find method Bogus"), "got: {err}");

    let reply: i64 = client.call("Foo.Sum", &SumArgs { a: 1, b: 1 }).await.unwrap();
    assert_eq!(reply, 2);

    client.close().await.unwrap();
}

/// Scenario 7: broadcasting to two servers, one of which errors, reports
/// that error while keeping the successful reply.
#[tokio::test]
async fn scenario_7_broadcast_first_error() {
    let (addr_ok, _server_ok) = spin_up_foo().await;

    let failing_server = Arc::new(Server::new());
    failing_server
        .register(
            ServiceBuilder::new("Foo", Foo)
                .method("Sum", |_recv, _args: SumArgs| async move {
                    Err::<i64, RpcError>(RpcError::Method("replica unavailable".to_string()))
                })
                .build(),
        )
        .await
        .unwrap();
    let addr_bad = listen_and_serve(failing_server, "127.0.0.1:0").await.unwrap();

    let discovery = Arc::new(MultiServersDiscovery::new(vec![addr_ok.to_string(), addr_bad.to_string()]));
    let xclient = XClient::new(discovery, SelectMode::Random, ConnectOption::default());

    let outcome = xclient.broadcast::<SumArgs, i64>("Foo.Sum", &SumArgs { a: 2, b: 3 }).await.unwrap();
    assert_eq!(outcome.reply, Some(5));
    assert!(outcome.error.is_some());

    xclient.close().await.unwrap();
}

/// Scenario 8: registry expiry — a server that stops heartbeating drops out
/// of discovery once its TTL elapses.
#[tokio::test]
async fn scenario_8_registry_expiry() {
    let registry = Registry::new(Duration::from_secs(3));
    let registry_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registry_addr = registry_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(registry_listener, registry.router()).await;
    });
    let registry_url = format!(
        "http://{registry_addr}{}",
        rpcie::protocol::DEFAULT_REGISTRY_PATH
    );

    let heartbeat = Heartbeat::start(
        registry_url.clone(),
        "127.0.0.1:9".to_string(),
        Some(Duration::from_secs(1)),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let discovery = rpcie::discovery::RegistryDiscovery::with_refresh_interval(
        registry_url,
        Duration::from_millis(50),
    );
    let servers = discovery.get_all().await.unwrap();
    assert_eq!(servers, vec!["127.0.0.1:9".to_string()]);

    heartbeat.abort();
    tokio::time::sleep(Duration::from_secs(4)).await;

    let servers = discovery.get_all().await.unwrap();
    assert!(servers.is_empty(), "expected expired server to be pruned, got {servers:?}");
}
