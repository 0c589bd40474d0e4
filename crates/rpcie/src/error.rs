use std::time::Duration;

use thiserror::Error;

/// All failure modes surfaced by the crate, grouped the way §7 of the design
/// classifies them: transport, protocol, registration, lookup, decode,
/// method, timeout, and shutdown.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc: dial failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("rpc: connection io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc: invalid codec type {0:?}")]
    InvalidCodecType(String),

    #[error("rpc: invalid magic number {0:#x}")]
    InvalidMagicNumber(u32),

    #[error("rpc: unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(String),

    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),

    #[error("rpc server: service {0:?} has no eligible methods")]
    NoEligibleMethods(String),

    #[error("rpc server: servicer/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    #[error("rpc server: cannot find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: cannot find method {0}")]
    MethodNotFound(String),

    #[error("rpc: failed to encode body: {0}")]
    Encode(String),

    #[error("rpc: failed to decode body: {0}")]
    Decode(String),

    #[error("reading body {0}")]
    ReadingBody(String),

    #[error("rpc server: service invocation panic")]
    MethodPanic,

    #[error("{0}")]
    Method(String),

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    #[error("connection is shut down")]
    Shutdown,

    #[error("rpc client err: wrong format {0:?}, expected protocol@addr")]
    BadAddress(String),

    #[error("no available servers")]
    NoAvailableServers,

    #[error("number of options is more than 1")]
    TooManyOptions,

    #[error("rpc: channel closed")]
    ChannelClosed,
}

/// Returned by [`crate::client::Client::close`] / server shutdown paths on a
/// handle that is already closed. Kept as a freestanding constant (rather
/// than folding it into [`RpcError::Shutdown`] only) so callers can match on
/// it the way the Go source matches `err == ErrShutdown`.
pub fn err_shutdown() -> RpcError {
    RpcError::Shutdown
}
