//! Broker handshake and service activation.
//!
//! # Lifecycle
//!
//! ```text
//! Connection::open(config) ── TCP connect
//!        │
//!        ▼
//! read_until("\r\n") == "QCONN\r\n" ──mismatch──► Error::Connection
//! read_exact(3)      (0xFF 0xFD 0x22, discarded, never answered)
//!        │
//!        ├── info()                     (optional, before activation)
//!        ▼
//! activate(ServiceKind) ── "service <name>\r\n" ──► "OK\r\n"
//!        │
//!        ▼
//! command / response exchanges (one at a time)
//!        │
//!        ▼
//! close(terminator) ── optional terminator, then half-close
//! ```
//!
//! A connection carries exactly one service for its lifetime; a caller that
//! needs two sub-protocols opens two connections.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::framer::{PacketStream, Transport};

/// Greeting line the broker sends on accept.
pub const BANNER: &[u8] = b"QCONN\r\n";

/// Negotiation preamble that follows the banner.
pub const PREAMBLE: [u8; 3] = [0xFF, 0xFD, 0x22];

/// Line terminator used by every text command.
pub(crate) const CRLF: &[u8] = b"\r\n";

/// Sub-protocols the broker multiplexes over an activated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Remote file I/O.
    File,
    /// Process, memory-map and system information.
    SInfo,
    /// Signal delivery.
    Cntl,
    /// Program launching.
    Launcher,
}

impl ServiceKind {
    /// Name sent in the `service <name>` activation command.
    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::SInfo => "sinfo",
            Self::Cntl => "cntl",
            Self::Launcher => "launcher",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key/value description returned by the broker's `info` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BrokerInfo {
    entries: BTreeMap<String, String>,
}

impl BrokerInfo {
    /// Parse an `info` response line of space-separated `KEY=VALUE` tokens.
    pub fn parse(line: &str) -> Self {
        let entries = line
            .trim_end_matches(['\r', '\n'])
            .split(' ')
            .filter(|token| !token.is_empty())
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token.to_string(), String::new()),
            })
            .collect();
        Self { entries }
    }

    /// Look up a raw key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Operating system identifier (`OS`), e.g. `nto`.
    pub fn os(&self) -> Option<&str> {
        self.get("OS")
    }

    /// Target host name (`HOSTNAME`).
    pub fn hostname(&self) -> Option<&str> {
        self.get("HOSTNAME")
    }

    /// Broker version (`QCONN_VERSION`).
    pub fn version(&self) -> Option<&str> {
        self.get("QCONN_VERSION")
    }

    /// Target byte order (`ENDIAN`), `le` or `be`.
    pub fn endianness(&self) -> Option<&str> {
        self.get("ENDIAN")
    }
}

/// One handshaken connection to the broker.
///
/// Owns the transport and its receive buffer. It is never shared: each
/// service holds its own `Connection`.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    packets: PacketStream<S>,
    service: Option<ServiceKind>,
}

impl Connection<TcpStream> {
    /// Dial the broker described by `config` and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the TCP connect fails or times out,
    /// or the greeting is wrong or incomplete.
    pub async fn open(config: &Config) -> Result<Self> {
        let addr = config.addr();
        log::debug!("[Session] Connecting to {addr}");
        let connect = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr));
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connection_error(&addr, Error::Io(e))),
            Err(_) => return Err(connection_error(&addr, Error::Timeout(config.connect_timeout()))),
        };
        // Commands are tiny and strictly request/response.
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Session] set_nodelay failed: {e}");
        }
        Self::handshake(stream, &addr, config.read_timeout()).await
    }
}

impl<S: Transport> Connection<S> {
    /// Validate the broker greeting on an already-connected transport.
    ///
    /// `addr` is only used to label errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the banner does not match or the
    /// greeting does not arrive in time. Nothing is written in that case.
    pub async fn handshake(stream: S, addr: &str, read_timeout: Duration) -> Result<Self> {
        let mut packets = PacketStream::with_timeout(stream, read_timeout);

        let banner = packets
            .read_until(CRLF)
            .await
            .map_err(|e| connection_error(addr, e))?;
        if banner != BANNER {
            return Err(connection_error(
                addr,
                Error::protocol(format!("unexpected banner {:?}", printable(&banner))),
            ));
        }

        let preamble = packets
            .read_exact(PREAMBLE.len())
            .await
            .map_err(|e| connection_error(addr, e))?;
        if preamble != PREAMBLE[..] {
            log::warn!(
                "[Session] Unexpected negotiation preamble {:02x?} from {addr}",
                &preamble[..]
            );
        }

        log::debug!("[Session] Handshake complete with {addr}");
        Ok(Self { packets, service: None })
    }

    /// Ask the broker to describe itself.
    ///
    /// Only valid before a service is activated.
    pub async fn info(&mut self) -> Result<BrokerInfo> {
        if let Some(active) = self.service {
            return Err(Error::InvalidArgument(format!(
                "info is unavailable once service {active} is active"
            )));
        }
        self.packets.write(b"info\r\n").await?;
        let line = self.read_line().await?;
        Ok(BrokerInfo::parse(&line))
    }

    /// Activate `kind` on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceActivation`] if a service is already active,
    /// the broker answers anything but `OK`, or the answer times out.
    pub async fn activate(&mut self, kind: ServiceKind) -> Result<()> {
        let activation_error = |reason: String| Error::ServiceActivation {
            service: kind.name().to_string(),
            reason,
        };
        if let Some(active) = self.service {
            return Err(activation_error(format!("service {active} is already active")));
        }

        self.packets
            .write(format!("service {kind}\r\n").as_bytes())
            .await
            .map_err(|e| activation_error(e.to_string()))?;
        let response = self
            .packets
            .read_until(CRLF)
            .await
            .map_err(|e| activation_error(e.to_string()))?;
        if &response[..] != b"OK\r\n" {
            return Err(activation_error(format!(
                "broker answered {:?}",
                printable(&response)
            )));
        }

        log::debug!("[Session] Service {kind} active");
        self.service = Some(kind);
        Ok(())
    }

    /// Currently active service, if any.
    pub fn service(&self) -> Option<ServiceKind> {
        self.service
    }

    /// Send `terminator` (if any) and half-close the transport.
    pub async fn close(mut self, terminator: Option<&[u8]>) -> Result<()> {
        if let Some(terminator) = terminator {
            self.packets.write(terminator).await?;
        }
        self.packets.shutdown().await
    }

    // ── Framer passthrough for the service codecs ────────────────────────

    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.packets.write(data).await
    }

    pub(crate) async fn read_line(&mut self) -> Result<String> {
        let line = self.packets.read_until(CRLF).await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    pub(crate) async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        self.packets.read_exact(n).await
    }

    pub(crate) async fn read_until_close(&mut self) -> Result<Bytes> {
        self.packets.read_until_close().await
    }
}

/// The connection slot every service owns.
///
/// Empty after disconnect, so any further use fails with
/// [`Error::NotConnected`].
#[derive(Debug)]
pub(crate) struct ServiceSlot<S> {
    conn: Option<Connection<S>>,
}

impl<S: Transport> ServiceSlot<S> {
    /// Activate `kind` on `conn` and take ownership of it.
    pub(crate) async fn activate(mut conn: Connection<S>, kind: ServiceKind) -> Result<Self> {
        conn.activate(kind).await?;
        Ok(Self { conn: Some(conn) })
    }

    pub(crate) fn get(&mut self) -> Result<&mut Connection<S>> {
        self.conn.as_mut().ok_or(Error::NotConnected)
    }

    pub(crate) fn take(&mut self) -> Result<Connection<S>> {
        self.conn.take().ok_or(Error::NotConnected)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Close the connection if still open. Idempotent.
    pub(crate) async fn disconnect(&mut self, terminator: Option<&[u8]>) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.close(terminator).await,
            None => Ok(()),
        }
    }
}

fn connection_error(addr: &str, source: Error) -> Error {
    Error::Connection {
        addr: addr.to_string(),
        source: Box::new(source),
    }
}

/// Render a short response for error messages.
pub(crate) fn printable(bytes: &[u8]) -> String {
    let end = bytes.len().min(64);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_handshake_and_activation() {
        let (mut conn, broker) = scripted(b"OK\r\n").await;
        conn.activate(ServiceKind::File).await.unwrap();
        assert_eq!(conn.service(), Some(ServiceKind::File));
        drop(conn);
        assert_eq!(written(broker).await, b"service file\r\n");
    }

    #[tokio::test]
    async fn test_bad_banner_fails_before_sending() {
        let (client, mut broker) = duplex(4096);
        broker.write_all(b"HELLO\r\n\xff\xfd\x22").await.unwrap();

        let err = Connection::handshake(client, "test", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }), "got {err:?}");
        assert!(written(broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_broker_times_out_as_connection_error() {
        let (client, _broker) = duplex(4096);
        let err = Connection::handshake(client, "test", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_odd_preamble_is_tolerated() {
        let (client, mut broker) = duplex(4096);
        broker.write_all(b"QCONN\r\n\x00\x01\x02").await.unwrap();
        assert!(Connection::handshake(client, "test", Duration::from_millis(200))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_activation_rejected() {
        let (mut conn, _broker) = scripted(b"ERROR unknown service\r\n").await;
        let err = conn.activate(ServiceKind::SInfo).await.unwrap_err();
        match err {
            Error::ServiceActivation { service, reason } => {
                assert_eq!(service, "sinfo");
                assert!(reason.contains("ERROR"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(conn.service(), None);
    }

    #[tokio::test]
    async fn test_activation_timeout_names_service() {
        let (mut conn, _broker) = scripted(b"").await;
        let err = conn.activate(ServiceKind::Launcher).await.unwrap_err();
        assert!(err.to_string().contains("launcher"), "{err}");
    }

    #[tokio::test]
    async fn test_second_activation_refused_locally() {
        let (mut conn, broker) = scripted(b"OK\r\n").await;
        conn.activate(ServiceKind::Cntl).await.unwrap();
        assert!(conn.activate(ServiceKind::File).await.is_err());
        drop(conn);
        assert_eq!(written(broker).await, b"service cntl\r\n");
    }

    #[tokio::test]
    async fn test_info_parses_key_values() {
        let (mut conn, _broker) = scripted(
            b"ENDIAN=le OS=nto HOSTNAME=localhost QCONN_VERSION=1.4.207944 NUM_SRVCS=1\r\n",
        )
        .await;
        let info = conn.info().await.unwrap();
        assert_eq!(info.endianness(), Some("le"));
        assert_eq!(info.os(), Some("nto"));
        assert_eq!(info.hostname(), Some("localhost"));
        assert_eq!(info.version(), Some("1.4.207944"));
        assert_eq!(info.get("NUM_SRVCS"), Some("1"));
    }

    #[test]
    fn test_info_token_without_value() {
        let info = BrokerInfo::parse("FLAG A=b\r\n");
        assert_eq!(info.get("FLAG"), Some(""));
        assert_eq!(info.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_close_sends_terminator() {
        let (conn, broker) = scripted(b"").await;
        conn.close(Some(b"quit\r\n")).await.unwrap();
        assert_eq!(written(broker).await, b"quit\r\n");
    }
}
