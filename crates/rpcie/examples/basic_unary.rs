//! Minimal server/client pair: register `Foo.Sum`, call it once.

use std::sync::Arc;

use rpcie::client::dial;
use rpcie::error::RpcError;
use rpcie::server::{listen_and_serve, Server};
use rpcie::service::ServiceBuilder;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy)]
struct Foo;

#[derive(Deserialize, Serialize)]
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
    tracing::info!(%addr, "listening");

    let client = dial(&addr.to_string(), None).await?;
    let reply: i64 = client.call("Foo.Sum", &Args { a: 3, b: 4 }).await?;
    println!("Foo.Sum(3, 4) = {reply}");
    assert_eq!(reply, 7);

    client.close().await?;
    Ok(())
}
