//! The service registry: a tiny axum HTTP service servers heartbeat into
//! and clients discover each other through, plus the heartbeat helper
//! servers use to keep their registration alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tracing::warn;

use crate::protocol::{DEFAULT_REGISTRY_PATH, DEFAULT_REGISTRY_TIMEOUT};

const SERVERS_HEADER: &str = "X-Rpcie-Servers";
const SERVER_HEADER: &str = "X-Rpcie-Server";

struct ServerItem {
    start: Instant,
}

struct RegistryState {
    servers: tokio::sync::RwLock<HashMap<String, ServerItem>>,
    timeout: Duration,
}

/// An in-process service registry. Servers `POST` their address to register
/// or refresh a heartbeat; clients `GET` the same path to discover the live
/// set. Entries are pruned lazily — on the next `GET` or `POST` that
/// observes them — rather than by a background sweep.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_TIMEOUT)
    }
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(RegistryState {
                servers: tokio::sync::RwLock::new(HashMap::new()),
                timeout,
            }),
        }
    }

    async fn put_server(&self, addr: String) {
        let mut servers = self.state.servers.write().await;
        servers
            .entry(addr)
            .and_modify(|item| item.start = Instant::now())
            .or_insert_with(|| ServerItem { start: Instant::now() });
    }

    async fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.state.servers.write().await;
        servers.retain(|_, item| item.start.elapsed() <= self.state.timeout);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Builds the `axum::Router` mounted at `path` (defaults to
    /// [`DEFAULT_REGISTRY_PATH`]).
    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, get(handle_get).post(handle_post))
            .with_state(self)
    }

    pub fn router(self) -> Router {
        self.into_router(DEFAULT_REGISTRY_PATH)
    }
}

async fn handle_get(State(registry): State<Registry>) -> impl IntoResponse {
    let alive = registry.alive_servers().await;
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&alive.join(",")).unwrap_or_else(|_| HeaderValue::from_static(""));
    headers.insert(SERVERS_HEADER, value);
    (StatusCode::OK, headers)
}

async fn handle_post(State(registry): State<Registry>, headers: HeaderMap) -> impl IntoResponse {
    let Some(addr) = headers.get(SERVER_HEADER).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    registry.put_server(addr.to_string()).await;
    StatusCode::OK
}

/// Keeps one server's registration alive: a synchronous first beat at
/// startup, then one `POST` per `period` thereafter. A failed beat is
/// logged and the loop continues — never tears down the server over a
/// transient registry outage.
pub struct Heartbeat;

impl Heartbeat {
    /// Spawns the heartbeat task and returns its handle (aborting it stops
    /// the heartbeat without affecting the server it advertises).
    pub fn start(registry_url: String, addr: String, period: Option<Duration>) -> tokio::task::JoinHandle<()> {
        let period = period.unwrap_or(DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60));
        tokio::spawn(async move {
            let http = reqwest::Client::new();
            if let Err(err) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!("rpc heartbeat: initial beat failed: {err}");
            }
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                if let Err(err) = send_heartbeat(&http, &registry_url, &addr).await {
                    warn!("rpc heartbeat: beat failed: {err}");
                }
            }
        })
    }
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<(), reqwest::Error> {
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_server_registers_and_get_reports_it() {
        let registry = Registry::new(Duration::from_secs(300));
        registry.put_server("127.0.0.1:9000".to_string()).await;
        let alive = registry.alive_servers().await;
        assert_eq!(alive, vec!["127.0.0.1:9000".to_string()]);
    }

    #[tokio::test]
    async fn expired_servers_are_pruned_on_next_read() {
        let registry = Registry::new(Duration::from_millis(10));
        registry.put_server("127.0.0.1:9000".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.alive_servers().await.is_empty());
    }

    #[tokio::test]
    async fn re_registering_refreshes_the_start_time() {
        let registry = Registry::new(Duration::from_millis(50));
        registry.put_server("127.0.0.1:9000".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.put_server("127.0.0.1:9000".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.alive_servers().await, vec!["127.0.0.1:9000".to_string()]);
    }
}
