//! `XClient`: a load-balanced client that picks a server via a
//! [`Discovery`] and [`SelectMode`], pooling one [`Client`] per address and
//! redialing it if it ever reports itself unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{self, Client};
use crate::discovery::{Discovery, SelectMode};
use crate::error::RpcError;
use crate::protocol::ConnectOption;

/// Result of [`XClient::broadcast`]: the shared reply (written at most once,
/// by the first successful server) and the first error observed across the
/// whole fan-out, independently of each other — a server erroring does not
/// discard a reply another server already produced.
#[derive(Debug)]
pub struct BroadcastOutcome<R> {
    pub reply: Option<R>,
    pub error: Option<RpcError>,
}

/// A client pool fronted by a [`Discovery`] source.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    option: ConnectOption,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, option: ConnectOption) -> Self {
        Self {
            discovery,
            mode,
            option,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live, pooled client for `addr`, dialing a fresh one if
    /// there's no cached entry or the cached one has gone unavailable.
    async fn dial(&self, addr: &str) -> Result<Arc<Client>, RpcError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            clients.remove(addr);
        }
        let client = Arc::new(client::dial(addr, Some(self.option.clone())).await?);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Picks one server via `discovery`/`mode` and calls it.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial(&addr).await?;
        client.call(service_method, args).await
    }

    /// Calls every known server concurrently and waits for all of them to
    /// finish — unlike [`XClient::call`], a single `Ok` doesn't short-circuit
    /// the others, because spec.md's broadcast contract reports the first
    /// *error* seen across the whole fan-out even when some other server
    /// succeeded. `reply` is written at most once (by whichever success
    /// arrives first) and is kept regardless of whether a later arm errors,
    /// mirroring the Go source's shared out-param: the caller gets the
    /// successful reply (if any) *and* the first error (if any), exactly as
    /// spec.md §4.7/§8 scenario 7 describes.
    ///
    /// Every arm races its call against a single [`CancellationToken`] that
    /// is cancelled the moment the first error (or task failure) is
    /// observed, per spec.md §4.7/§5's "first error cancels the shared
    /// context, causing other arms to abort on their next suspension
    /// point" — without this, one hung or slow replica would otherwise keep
    /// the whole broadcast blocked waiting on `join_next` even after the
    /// outcome is already decided.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<BroadcastOutcome<R>, RpcError>
    where
        A: Serialize + Clone + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::NoAvailableServers);
        }

        let cancel = CancellationToken::new();
        let mut handlers: JoinSet<Result<Value, RpcError>> = JoinSet::new();
        for addr in servers {
            let service_method = service_method.to_string();
            let args = args.clone();
            let dialed = self.dial(&addr).await;
            let cancel = cancel.clone();
            handlers.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RpcError::CallFailed(
                        "broadcast cancelled after an earlier server errored".to_string(),
                    )),
                    result = async move {
                        match dialed {
                            Ok(client) => client.call::<A, Value>(&service_method, &args).await,
                            Err(err) => Err(err),
                        }
                    } => result,
                }
            });
        }

        let mut reply = None;
        let mut first_err = None;
        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    reply.get_or_insert(value);
                }
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                    cancel.cancel();
                }
                Err(_join_err) => {
                    first_err.get_or_insert(RpcError::ChannelClosed);
                    cancel.cancel();
                }
            }
        }

        let reply = reply
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| RpcError::Decode(err.to_string()))?;
        Ok(BroadcastOutcome { reply, error: first_err })
    }

    /// Closes and drops every pooled client. Idempotent.
    pub async fn close(&self) -> Result<(), RpcError> {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
        Ok(())
    }
}
