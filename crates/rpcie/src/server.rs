//! The server half: accepts connections, drives the per-connection
//! request/response loop, and multiplexes handler tasks concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{new_codec_pair, Decoder, Encoder, Header};
use crate::error::RpcError;
use crate::protocol::{self};
use crate::service::Service;

/// Sentinel body written alongside an error response, mirroring the Go
/// source's `invalidRequest = struct{}{}`.
fn invalid_request() -> serde_json::Value {
    serde_json::Value::Null
}

/// An RPC server: an insert-only map of registered [`Service`]s plus the
/// accept/serve machinery.
pub struct Server {
    service_map: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            service_map: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a service, failing if a service of the same name already
    /// exists — `serviceMap` is insert-only for a server's lifetime.
    pub async fn register(&self, service: Service) -> Result<(), RpcError> {
        let name = service.name().to_string();
        let mut map = self.service_map.write().await;
        if map.contains_key(&name) {
            return Err(RpcError::ServiceAlreadyDefined(name));
        }
        map.insert(name, Arc::new(service));
        Ok(())
    }

    async fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, String), RpcError> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let map = self.service_map.read().await;
        let service = map
            .get(service_name)
            .ok_or_else(|| RpcError::ServiceNotFound(service_method.to_string()))?
            .clone();
        if !service.has_method(method_name) {
            return Err(RpcError::MethodNotFound(method_name.to_string()));
        }
        Ok((service, method_name.to_string()))
    }

    /// Accepts connections off `listener` forever; a single accept error
    /// terminates the loop. Each connection is served on its own task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "rpc server: accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                    });
                }
                Err(err) => {
                    warn!("rpc server: accept error: {err}");
                    return;
                }
            }
        }
    }

    /// Performs the handshake on `stream`, selects the codec, and enters the
    /// codec-serving loop.
    ///
    /// The stream is split into owned read/write halves before the
    /// handshake so the negotiated [`Decoder`] can keep reading from
    /// whatever the handshake's `BufReader` had already buffered, and the
    /// negotiated [`Encoder`] can be handed to handler tasks independently
    /// of the read loop — no unsafe aliasing of a shared connection object
    /// is needed because reads and writes never touch the same half.
    pub async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let option = match protocol::read_handshake(&mut reader).await {
            Ok(option) => option,
            Err(err) => {
                warn!("rpc server: options error: {err}");
                return;
            }
        };
        if let Err(err) = protocol::validate_handshake(&option) {
            warn!("rpc server: {err}");
            return;
        }
        let (decoder, encoder) = new_codec_pair(option.codec_type, reader, write_half);
        self.serve_codec(decoder, encoder, option.handle_timeout).await;
    }

    /// Like [`Server::serve_conn`] but first drains an HTTP `CONNECT` tunnel
    /// request, matching the `/_rpcie_` tunnel sugar in §4.3.
    pub async fn serve_http_connect(self: Arc<Self>, mut stream: TcpStream) {
        let mut request_line = String::new();
        {
            // Scoped so the split read/write halves (and their borrow of
            // `stream`) are gone before `stream` is borrowed again below —
            // `TcpStream::split` hands out borrowed halves, unlike
            // `into_split`, so the borrow must end before any further use
            // of `stream` itself.
            let (read_half, write_half) = stream.split();
            drop(write_half);
            let mut reader = BufReader::new(read_half);
            if tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut request_line)
                .await
                .is_err()
            {
                return;
            }
            loop {
                let mut line = String::new();
                match tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) if line == "\r\n" || line == "\n" => break,
                    Ok(_) => continue,
                }
            }
        }
        if !request_line.starts_with("CONNECT") {
            return;
        }
        if protocol::write_http_connect_response(&mut stream).await.is_err() {
            return;
        }
        self.serve_conn(stream).await;
    }

    /// Reads and handles requests until end-of-stream, then waits for all
    /// in-flight handlers before closing the encoder.
    async fn serve_codec(
        self: Arc<Self>,
        mut decoder: Box<dyn Decoder>,
        encoder: Box<dyn Encoder>,
        handle_timeout: Duration,
    ) {
        let encoder = Arc::new(Mutex::new(encoder));
        let mut handlers = JoinSet::new();

        loop {
            let header = match decoder.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    warn!("rpc server: read header error: {err}");
                    break;
                }
            };

            let lookup = self.find_service(&header.service_method).await;
            let (service, method) = match lookup {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = decoder.read_body_raw().await;
                    let mut error_header = header;
                    error_header.error = err.to_string();
                    send_response(&encoder, &error_header, &invalid_request()).await;
                    continue;
                }
            };

            let args = match decoder.read_body().await {
                Ok(Some(args)) => args,
                Ok(None) => break,
                Err(err) => {
                    warn!("rpc server: read body err: {err}");
                    let mut error_header = header;
                    error_header.error = err.to_string();
                    send_response(&encoder, &error_header, &invalid_request()).await;
                    // The length-delimited frame was already consumed whole
                    // off the wire before decoding failed, so the codec is
                    // resynced on the next header — a decode error here
                    // doesn't have to take the connection down with it.
                    continue;
                }
            };

            let encoder = encoder.clone();
            handlers.spawn(async move {
                handle_request(header, service, method, args, encoder, handle_timeout).await;
            });
        }

        while handlers.join_next().await.is_some() {}
        let mut encoder = encoder.lock().await;
        let _ = encoder.close().await;
    }
}

async fn send_response(encoder: &Mutex<Box<dyn Encoder>>, header: &Header, body: &serde_json::Value) {
    let mut encoder = encoder.lock().await;
    if let Err(err) = encoder.write(header, body).await {
        warn!("rpc server: write response error: {err}");
    }
}

async fn handle_request(
    mut header: Header,
    service: Arc<Service>,
    method: String,
    args: serde_json::Value,
    encoder: Arc<Mutex<Box<dyn Encoder>>>,
    handle_timeout: Duration,
) {
    // Spawned rather than awaited inline so that, on timeout, the invocation
    // keeps running to completion in the background instead of being
    // dropped/cancelled by the losing `select!` branch.
    let invocation = tokio::spawn(async move { service.call(&method, args).await });

    if handle_timeout.is_zero() {
        let result = match invocation.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::MethodPanic),
        };
        respond(&encoder, &mut header, result).await;
        return;
    }

    tokio::select! {
        joined = invocation => {
            let result = match joined {
                Ok(result) => result,
                Err(_) => Err(RpcError::MethodPanic),
            };
            respond(&encoder, &mut header, result).await;
        }
        _ = tokio::time::sleep(handle_timeout) => {
            header.error = RpcError::HandleTimeout(handle_timeout).to_string();
            send_response(&encoder, &header, &invalid_request()).await;
            // Dropping the losing branch's `JoinHandle` here does not abort
            // the spawned task: it keeps running to completion in the
            // background and its eventual result is discarded, matching the
            // Go source's "invocation continues, result is dropped" timeout
            // behavior.
        }
    }
}

async fn respond(
    encoder: &Arc<Mutex<Box<dyn Encoder>>>,
    header: &mut Header,
    result: Result<serde_json::Value, RpcError>,
) {
    match result {
        Ok(reply) => send_response(encoder, header, &reply).await,
        Err(err) => {
            header.error = err.to_string();
            send_response(encoder, header, &invalid_request()).await;
        }
    }
}

/// Accept loop entry point used by the examples/tests: binds a TCP listener
/// and runs `Server::accept` to completion (i.e. forever, barring an accept
/// error).
pub async fn listen_and_serve(server: Arc<Server>, addr: &str) -> Result<std::net::SocketAddr, RpcError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tokio::spawn(async move {
        server.accept(listener).await;
    });
    Ok(local_addr)
}
