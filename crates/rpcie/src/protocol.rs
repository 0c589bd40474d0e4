//! The `Option` handshake that precedes codec framing on every connection,
//! plus the optional HTTP `CONNECT` tunnel sugar described in §4.3 and §6.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, AsyncWrite, BufReader};

use crate::codec::CodecType;
use crate::error::RpcError;

/// `rpcie`'s magic number, sent as the first field of every handshake.
pub const MAGIC_NUMBER: u32 = 0x3BEF5C;

/// Status line the server replies with after hijacking an HTTP `CONNECT`.
pub const CONNECTED: &str = "200 Connected to rpcie";
/// Default path used for the `CONNECT` tunnel.
pub const DEFAULT_RPC_PATH: &str = "/_rpcie_";
/// Default path for the debug introspection page.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/rpcie";
/// Default path the registry's HTTP API is mounted on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_rpcie_/registry";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Self-delimited handshake record, sent as one JSON object before any
/// codec framing begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOption {
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,
    #[serde(rename = "CodecType")]
    pub codec_type: CodecType,
    #[serde(rename = "ConnectTimeout", with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "HandleTimeout", with = "duration_millis")]
    pub handle_timeout: Duration,
}

impl Default for ConnectOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// `time.Duration` is encoded as nanoseconds in the Go source; this crate
/// encodes `Duration` as milliseconds-since-epoch-free `u64` instead, which
/// keeps the handshake a plain JSON integer without needing a 64-bit
/// nanosecond overflow story for long timeouts. Documented as an Open
/// Question resolution in DESIGN.md.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Writes the handshake as one newline-terminated JSON object. The trailing
/// newline is this crate's self-delimiting boundary, standing in for Go's
/// `json.Decoder`, which stops at the first balanced `{...}`.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    option: &ConnectOption,
) -> Result<(), RpcError> {
    let mut encoded = serde_json::to_vec(option).expect("ConnectOption always encodes");
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one handshake record from the start of a connection.
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<ConnectOption, RpcError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before handshake",
        )));
    }
    let option: ConnectOption = serde_json::from_str(line.trim_end())
        .map_err(|err| RpcError::Decode(format!("options error: {err}")))?;
    Ok(option)
}

/// Validates a decoded handshake against this crate's constants. Returns the
/// bad-magic error as a plain `RpcError` so the caller can close the
/// connection without a reply, per §4.3.
pub fn validate_handshake(option: &ConnectOption) -> Result<(), RpcError> {
    if option.magic_number != MAGIC_NUMBER {
        return Err(RpcError::InvalidMagicNumber(option.magic_number));
    }
    Ok(())
}

/// Writes the client side of the `CONNECT` tunnel handshake.
pub async fn write_http_connect<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), RpcError> {
    let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and validates the server's `CONNECT` response line.
pub async fn read_http_connect_response<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<(), RpcError> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    // drain headers up to the blank line terminating the response
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    if status_line.contains(CONNECTED) {
        Ok(())
    } else {
        Err(RpcError::UnexpectedHttpResponse(status_line.trim().to_string()))
    }
}

/// Writes the server side of the `CONNECT` tunnel handshake.
pub async fn write_http_connect_response<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), RpcError> {
    let response = format!("HTTP/1.0 {CONNECTED}\r\n\r\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_round_trips() {
        let (mut client_io, server_io) = duplex(4096);
        let option = ConnectOption::default();
        write_handshake(&mut client_io, &option).await.unwrap();

        let mut reader = BufReader::new(server_io);
        let decoded = read_handshake(&mut reader).await.unwrap();
        assert_eq!(decoded.magic_number, option.magic_number);
        assert_eq!(decoded.codec_type, option.codec_type);
        validate_handshake(&decoded).unwrap();
    }

    #[tokio::test]
    async fn bad_magic_number_is_rejected() {
        let mut option = ConnectOption::default();
        option.magic_number = 1;
        assert!(validate_handshake(&option).is_err());
    }

    #[tokio::test]
    async fn http_connect_round_trips() {
        let (mut client_io, server_io) = duplex(4096);
        write_http_connect(&mut client_io).await.unwrap();

        let mut server_reader = BufReader::new(server_io);
        let mut first_line = String::new();
        server_reader.read_line(&mut first_line).await.unwrap();
        assert!(first_line.starts_with("CONNECT /_rpcie_ HTTP/1.0"));
    }
}
