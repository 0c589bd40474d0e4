//! Fires five concurrent `Foo.Sum` calls over one client connection and
//! prints each reply as it arrives, demonstrating the client's seq-based
//! multiplexing (spec.md §8 scenario 2).

use std::sync::Arc;

use rpcie::client::dial;
use rpcie::error::RpcError;
use rpcie::server::{listen_and_serve, Server};
use rpcie::service::ServiceBuilder;
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

    let client = Arc::new(dial(&addr.to_string(), None).await?);

    let mut tasks = Vec::new();
    for i in 0..5i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Foo.Sum", &Args { a: i, b: i * i })
                .await
                .expect("call failed");
            assert_eq!(reply, i + i * i);
            println!("Foo.Sum({i}, {}) = {reply}", i * i);
        }));
    }
    for task in tasks {
        task.await.expect("task panicked");
    }

    client.close().await?;
    Ok(())
}
