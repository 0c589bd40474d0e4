//! Wire framing: the `Header` that precedes every body, and the pluggable
//! decoder/encoder pair that owns a connection's read and write halves.
//!
//! A header is always immediately followed by its body on the wire. Two
//! concrete formats ship with the crate: `CodecType::Bincode` (the default,
//! playing the role Go's `encoding/gob` plays in the original source) and
//! `CodecType::Json`. Both frame messages with a length prefix ahead of the
//! encoded bytes, via [`tokio_util::codec::LengthDelimitedCodec`].
//!
//! Unlike the Go source's single `Codec` interface (which reads and writes
//! through one `io.ReadWriteCloser`), this crate splits decoding and
//! encoding into separate [`Decoder`]/[`Encoder`] objects over the stream's
//! read/write halves. That split is what lets the server's per-request
//! handler tasks write responses concurrently with the connection's single
//! read loop without any unsafe aliasing: the decoder is only ever touched
//! by the read loop, and the encoder is shared behind a mutex (or, for the
//! client, owned by a dedicated writer task) the same way
//! `atomize-hq-codex-wrapper`'s `jsonrpc.rs` splits `writer_task`/
//! `reader_task` around an mpsc channel.
//!
//! Bodies cross the decoder/encoder boundary as [`serde_json::Value`]
//! regardless of which wire format was negotiated — that's the opaque
//! argv/replyv slot the service registry (see [`crate::service`]) reads and
//! writes, matching the "bytes-in / bytes-out plus caller-supplied decode
//! closures" substitution for reflection described in the design notes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::RpcError;

/// Precedes every body in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    #[serde(default)]
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// Identifies the wire codec negotiated during the handshake. The wire
/// strings are spelled out explicitly so they match §6 verbatim even though
/// the concrete formats are Rust-idiomatic substitutes for gob/JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    #[serde(rename = "application/bincode")]
    Bincode,
    #[serde(rename = "application/json")]
    Json,
}

impl Default for CodecType {
    fn default() -> Self {
        CodecType::Bincode
    }
}

fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    bincode::serialize(value).map_err(|err| RpcError::Encode(err.to_string()))
}

fn decode_bincode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RpcError> {
    bincode::deserialize(bytes).map_err(|err| RpcError::Decode(err.to_string()))
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(value).map_err(|err| RpcError::Encode(err.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RpcError> {
    serde_json::from_slice(bytes).map_err(|err| RpcError::Decode(err.to_string()))
}

/// Read half of a negotiated codec. Owned exclusively by a connection's
/// request-reading loop; never shared.
#[async_trait]
pub trait Decoder: Send {
    /// `Ok(None)` signals a clean end-of-stream: a normal termination signal
    /// for server loops and a shutdown trigger for client receive loops.
    async fn read_header(&mut self) -> Result<Option<Header>, RpcError>;

    async fn read_body(&mut self) -> Result<Option<serde_json::Value>, RpcError>;

    /// Reads and discards one body frame without decoding it, used when the
    /// header's `seq` doesn't match any pending call or the header already
    /// carries an error.
    async fn read_body_raw(&mut self) -> Result<(), RpcError>;
}

/// Write half of a negotiated codec. Shared across a connection's
/// concurrent handler tasks behind a mutex (server) or funneled through a
/// single writer task (client), so that a `write` call's header+body pair
/// is never interleaved with another.
#[async_trait]
pub trait Encoder: Send {
    async fn write(&mut self, header: &Header, body: &serde_json::Value) -> Result<(), RpcError>;

    async fn close(&mut self) -> Result<(), RpcError>;
}

macro_rules! frame_decoder {
    ($name:ident, $decode_header:ident, $decode_body:ident) => {
        pub struct $name<R> {
            framed: FramedRead<R, LengthDelimitedCodec>,
        }

        impl<R: AsyncRead + Unpin + Send> $name<R> {
            pub fn new(reader: R) -> Self {
                Self {
                    framed: FramedRead::new(reader, LengthDelimitedCodec::new()),
                }
            }

            async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
                match self.framed.next().await {
                    Some(Ok(bytes)) => Ok(Some(bytes.to_vec())),
                    Some(Err(err)) => Err(RpcError::Io(err)),
                    None => Ok(None),
                }
            }
        }

        #[async_trait]
        impl<R: AsyncRead + Unpin + Send> Decoder for $name<R> {
            async fn read_header(&mut self) -> Result<Option<Header>, RpcError> {
                let Some(bytes) = self.read_frame().await? else {
                    return Ok(None);
                };
                Ok(Some($decode_header(&bytes)?))
            }

            async fn read_body(&mut self) -> Result<Option<serde_json::Value>, RpcError> {
                let Some(bytes) = self.read_frame().await? else {
                    return Ok(None);
                };
                let value = $decode_body(&bytes).map_err(|err: RpcError| RpcError::ReadingBody(err.to_string()))?;
                Ok(Some(value))
            }

            async fn read_body_raw(&mut self) -> Result<(), RpcError> {
                self.read_frame().await?;
                Ok(())
            }
        }
    };
}

frame_decoder!(BincodeDecoder, decode_bincode, decode_bincode);
frame_decoder!(JsonDecoder, decode_json, decode_json);

macro_rules! frame_encoder {
    ($name:ident, $encode:ident) => {
        pub struct $name<W> {
            framed: FramedWrite<W, LengthDelimitedCodec>,
        }

        impl<W: AsyncWrite + Unpin + Send> $name<W> {
            pub fn new(writer: W) -> Self {
                Self {
                    framed: FramedWrite::new(writer, LengthDelimitedCodec::new()),
                }
            }

            async fn write_frame(&mut self, bytes: Vec<u8>) -> Result<(), RpcError> {
                self.framed.send(Bytes::from(bytes)).await.map_err(RpcError::Io)
            }
        }

        #[async_trait]
        impl<W: AsyncWrite + Unpin + Send> Encoder for $name<W> {
            async fn write(&mut self, header: &Header, body: &serde_json::Value) -> Result<(), RpcError> {
                let header_bytes = $encode(header)?;
                let body_bytes = $encode(body)?;
                self.write_frame(header_bytes).await?;
                self.write_frame(body_bytes).await
            }

            async fn close(&mut self) -> Result<(), RpcError> {
                SinkExt::<Bytes>::close(&mut self.framed).await.map_err(RpcError::Io)
            }
        }
    };
}

frame_encoder!(BincodeEncoder, encode_bincode);
frame_encoder!(JsonEncoder, encode_json);

/// Builds the negotiated decoder/encoder pair for a split stream — the Rust
/// equivalent of `NewCodecFuncMap[opt.CodecType]`.
pub fn new_codec_pair<R, W>(
    codec_type: CodecType,
    reader: R,
    writer: W,
) -> (Box<dyn Decoder>, Box<dyn Encoder>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match codec_type {
        CodecType::Bincode => (
            Box::new(BincodeDecoder::new(reader)),
            Box::new(BincodeEncoder::new(writer)),
        ),
        CodecType::Json => (
            Box::new(JsonDecoder::new(reader)),
            Box::new(JsonEncoder::new(writer)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn header_round_trips_through_bincode_codec() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut writer = BincodeEncoder::new(client_write);
        let mut reader = BincodeDecoder::new(server_read);
        let _unused = (client_read, server_write);

        let header = Header::new("Foo.Sum", 7);
        let body = serde_json::json!({ "a": 1, "b": 2 });
        writer.write(&header, &body).await.unwrap();

        let got_header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(got_header, header);
        let got_body = reader.read_body().await.unwrap().unwrap();
        assert_eq!(got_body, body);
    }

    #[tokio::test]
    async fn header_round_trips_through_json_codec() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut writer = JsonEncoder::new(client_write);
        let mut reader = JsonDecoder::new(server_read);
        let _unused = (client_read, server_write);

        let header = Header::new("Foo.Sum", 1);
        let body = serde_json::json!({ "a": 3, "b": 4 });
        writer.write(&header, &body).await.unwrap();

        let got_header = reader.read_header().await.unwrap().unwrap();
        assert_eq!(got_header, header);
        let got_body = reader.read_body().await.unwrap().unwrap();
        assert_eq!(got_body, body);
    }

    #[tokio::test]
    async fn read_header_returns_none_on_clean_eof() {
        let (client_io, server_io) = duplex(4096);
        drop(client_io);
        let (server_read, _server_write) = tokio::io::split(server_io);
        let mut reader = BincodeDecoder::new(server_read);
        assert!(reader.read_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_seq_body_can_be_discarded_without_decoding() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut writer = JsonEncoder::new(client_write);
        let mut reader = JsonDecoder::new(server_read);
        let _unused = (client_read, server_write);

        writer
            .write(&Header::new("Foo.Sum", 9), &serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let _ = reader.read_header().await.unwrap().unwrap();
        reader.read_body_raw().await.unwrap();
    }
}
