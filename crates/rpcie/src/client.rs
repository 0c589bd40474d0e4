//! The multiplexed RPC client: one connection, many concurrent in-flight
//! calls distinguished by a sequence number.
//!
//! Grounded on two sources: the Go client's `pending`/`seq`/`sendLock`
//! bookkeeping (`original_source/client/client.go`), and
//! `atomize-hq-codex-wrapper`'s `JsonRpcTransport` for the Rust shape of
//! that bookkeeping — a dedicated writer task fed by an unbounded channel
//! (serializing writes without a mutex) and a background receive loop that
//! demuxes incoming frames into a `pending: Arc<Mutex<HashMap<seq, oneshot::Sender<..>>>>`
//! map. Go's buffered `Done chan *Call` becomes a one-shot channel per call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec::{new_codec_pair, Decoder, Encoder, Header};
use crate::error::RpcError;
use crate::protocol::{self, ConnectOption};

struct PendingCall {
    done: oneshot::Sender<Result<Value, RpcError>>,
}

type PendingCalls = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// A single in-flight (or completed) call, returned by [`Client::go_call`]
/// for callers that want to hold onto it rather than await it immediately.
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    done: oneshot::Receiver<Result<Value, RpcError>>,
}

impl Call {
    /// Awaits the server's reply, still encoded as a [`Value`].
    pub async fn wait(self) -> Result<Value, RpcError> {
        self.done.await.map_err(|_| RpcError::ChannelClosed)?
    }
}

/// A connected, multiplexed RPC client.
pub struct Client {
    writer: mpsc::UnboundedSender<(Header, Value)>,
    pending: PendingCalls,
    seq: AtomicU64,
    closing: AtomicBool,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    fn from_parts(decoder: Box<dyn Decoder>, encoder: Box<dyn Encoder>) -> Self {
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_task(encoder, writer_rx));
        let receive_handle = tokio::spawn(receive_loop(decoder, pending.clone(), shutdown.clone()));

        Self {
            writer: writer_tx,
            pending,
            seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(vec![writer_handle, receive_handle]),
        }
    }

    /// Closes the client. Idempotent: a second call returns
    /// `RpcError::Shutdown`, matching the Go source's `err == ErrShutdown`
    /// behavior on double-close.
    pub async fn close(&self) -> Result<(), RpcError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        self.shutdown.store(true, Ordering::SeqCst);
        terminate_all(&self.pending).await;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    async fn register_call(&self) -> Result<(u64, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        if self.closing.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, PendingCall { done: tx });
        Ok((seq, rx))
    }

    /// Dispatches a call without waiting for the reply — the Rust shape of
    /// the Go source's `Client.Go`. The returned [`Call`] can be awaited
    /// later via [`Call::wait`].
    pub async fn go_call(&self, service_method: &str, args: &impl Serialize) -> Result<Call, RpcError> {
        let (seq, rx) = self.register_call().await?;
        let body = serde_json::to_value(args).map_err(|err| RpcError::Encode(err.to_string()))?;
        let header = Header::new(service_method, seq);

        if self.writer.send((header, body)).is_err() {
            self.pending.lock().await.remove(&seq);
            return Err(RpcError::ChannelClosed);
        }

        Ok(Call {
            seq,
            service_method: service_method.to_string(),
            done: rx,
        })
    }

    /// Makes a call and blocks until the reply arrives, decoded as `R`.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_deadline(service_method, args, None).await
    }

    /// Like [`Client::call`], but cancels the wait (without closing the
    /// client) once `deadline` elapses — the Rust shape of the Go source's
    /// `ctx.Done()` race in `Client.Call`.
    pub async fn call_with_deadline<A, R>(
        &self,
        service_method: &str,
        args: &A,
        deadline: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = self.go_call(service_method, args).await?;
        let seq = call.seq;
        let reply = recv_reply(call.done, seq, &self.pending, deadline).await?;
        serde_json::from_value(reply).map_err(|err| RpcError::Decode(err.to_string()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn recv_reply(
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    seq: u64,
    pending: &PendingCalls,
    deadline: Option<Duration>,
) -> Result<Value, RpcError> {
    match deadline {
        None => rx.await.map_err(|_| RpcError::ChannelClosed)?,
        Some(duration) => tokio::select! {
            result = rx => result.map_err(|_| RpcError::ChannelClosed)?,
            _ = tokio::time::sleep(duration) => {
                pending.lock().await.remove(&seq);
                Err(RpcError::CallFailed(format!(
                    "deadline of {duration:?} exceeded waiting for reply"
                )))
            }
        },
    }
}

async fn terminate_all(pending: &PendingCalls) {
    let mut map = pending.lock().await;
    for (_, call) in map.drain() {
        let _ = call.done.send(Err(RpcError::Shutdown));
    }
}

/// Serializes writes onto the connection: a single task owns the
/// [`Encoder`] and drains an unbounded channel, so concurrent callers never
/// interleave a header with someone else's body.
async fn writer_task(mut encoder: Box<dyn Encoder>, mut rx: mpsc::UnboundedReceiver<(Header, Value)>) {
    while let Some((header, body)) = rx.recv().await {
        if let Err(err) = encoder.write(&header, &body).await {
            warn!("rpc client: write error: {err}");
            break;
        }
    }
    let _ = encoder.close().await;
}

/// Demultiplexes incoming frames by `seq`, mirroring the Go source's
/// `receive()` three-way switch: unknown seq (discard the body), server
/// error (discard the body, fail the call), or a normal reply.
async fn receive_loop(mut decoder: Box<dyn Decoder>, pending: PendingCalls, shutdown: Arc<AtomicBool>) {
    loop {
        let header = match decoder.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(err) => {
                warn!("rpc client: read header error: {err}");
                break;
            }
        };

        let call = pending.lock().await.remove(&header.seq);
        match call {
            None => {
                let _ = decoder.read_body_raw().await;
            }
            Some(call) if !header.error.is_empty() => {
                let _ = decoder.read_body_raw().await;
                let _ = call.done.send(Err(RpcError::Method(header.error)));
            }
            Some(call) => match decoder.read_body().await {
                Ok(Some(body)) => {
                    let _ = call.done.send(Ok(body));
                }
                Ok(None) => {
                    let _ = call.done.send(Err(RpcError::ChannelClosed));
                    break;
                }
                Err(err) => {
                    let _ = call.done.send(Err(RpcError::ReadingBody(err.to_string())));
                }
            },
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    terminate_all(&pending).await;
}

/// Fills in the magic number (never caller-settable) and defaults the codec
/// type, mirroring the Go source's `parseOptions`.
fn parse_options(option: Option<ConnectOption>) -> ConnectOption {
    let mut option = option.unwrap_or_default();
    option.magic_number = protocol::MAGIC_NUMBER;
    option
}

async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream, RpcError> {
    if connect_timeout.is_zero() {
        return TcpStream::connect(addr).await.map_err(RpcError::Dial);
    }
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(RpcError::Dial(err)),
        Err(_) => Err(RpcError::ConnectTimeout(connect_timeout)),
    }
}

/// Races a connection-setup future against `connect_timeout`, the same
/// duration that already bounded the TCP dial above it — matching the Go
/// source's `dialTimeout`, which applies `opt.ConnectTimeout` twice: once to
/// `net.DialTimeout` and again to the `NewClient` handshake.
async fn race_connect<F>(connect_timeout: Duration, setup: F) -> Result<Client, RpcError>
where
    F: Future<Output = Result<Client, RpcError>>,
{
    if connect_timeout.is_zero() {
        return setup.await;
    }
    tokio::select! {
        result = setup => result,
        _ = tokio::time::sleep(connect_timeout) => Err(RpcError::ConnectTimeout(connect_timeout)),
    }
}

/// Performs the handshake over an already-connected stream and starts the
/// client's background tasks.
pub async fn new_client(stream: TcpStream, option: ConnectOption) -> Result<Client, RpcError> {
    let (read_half, mut write_half) = stream.into_split();
    protocol::write_handshake(&mut write_half, &option).await?;
    let (decoder, encoder) = new_codec_pair(option.codec_type, read_half, write_half);
    Ok(Client::from_parts(decoder, encoder))
}

/// Dials `addr` over TCP and completes the handshake.
pub async fn dial(addr: &str, option: Option<ConnectOption>) -> Result<Client, RpcError> {
    let option = parse_options(option);
    let connect_timeout = option.connect_timeout;
    let stream = connect_tcp(addr, connect_timeout).await?;
    race_connect(connect_timeout, new_client(stream, option)).await
}

/// Like [`new_client`], but first negotiates the HTTP `CONNECT` tunnel.
pub async fn new_http_client(stream: TcpStream, option: ConnectOption) -> Result<Client, RpcError> {
    let (read_half, mut write_half) = stream.into_split();
    protocol::write_http_connect(&mut write_half).await?;
    let mut reader = BufReader::new(read_half);
    protocol::read_http_connect_response(&mut reader).await?;
    protocol::write_handshake(&mut write_half, &option).await?;
    let (decoder, encoder) = new_codec_pair(option.codec_type, reader, write_half);
    Ok(Client::from_parts(decoder, encoder))
}

/// Dials `addr` over TCP, tunneling through HTTP `CONNECT` first.
pub async fn dial_http(addr: &str, option: Option<ConnectOption>) -> Result<Client, RpcError> {
    let option = parse_options(option);
    let connect_timeout = option.connect_timeout;
    let stream = connect_tcp(addr, connect_timeout).await?;
    race_connect(connect_timeout, new_http_client(stream, option)).await
}

/// Dials `rpc_addr` in `protocol@addr` form (`http@127.0.0.1:8888` or
/// `tcp@127.0.0.1:8888`), matching the Go source's `XDial`. Any protocol
/// other than `http` is dialed as plain TCP — this crate has no Unix-socket
/// transport.
pub async fn x_dial(rpc_addr: &str, option: Option<ConnectOption>) -> Result<Client, RpcError> {
    let parts: Vec<&str> = rpc_addr.split('@').collect();
    if parts.len() != 2 {
        return Err(RpcError::BadAddress(rpc_addr.to_string()));
    }
    match parts[0] {
        "http" => dial_http(parts[1], option).await,
        _ => dial(parts[1], option).await,
    }
}
