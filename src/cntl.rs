//! Cntl service: deliver signals to remote processes.
//!
//! `kill <pid> <signal>\r\n` is answered with `ok\r\n`; `quit\r\n` ends the
//! session.

use std::fmt;
use std::str::FromStr;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::framer::Transport;
use crate::session::{printable, Connection, ServiceKind, ServiceSlot};

const TERMINATOR: &[u8] = b"quit\r\n";

/// Signals the broker can deliver, with their target numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Signal {
    /// Hangup.
    Hup = 1,
    /// Interrupt.
    Int = 2,
    /// Quit.
    Quit = 3,
    /// Kill (cannot be caught).
    #[default]
    Kill = 9,
    /// Terminate.
    Term = 15,
    /// User signal 1.
    Usr1 = 16,
    /// User signal 2.
    Usr2 = 17,
}

impl Signal {
    /// Every deliverable signal.
    pub const ALL: [Self; 7] = [
        Self::Hup,
        Self::Int,
        Self::Quit,
        Self::Kill,
        Self::Term,
        Self::Usr1,
        Self::Usr2,
    ];

    /// Signal number on the target.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Lowercase name, e.g. `term`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hup => "hup",
            Self::Int => "int",
            Self::Quit => "quit",
            Self::Kill => "kill",
            Self::Term => "term",
            Self::Usr1 => "usr1",
            Self::Usr2 => "usr2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts a name (`term`, `SIGTERM`) or a number (`15`).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("sig").unwrap_or(&lower);
        Self::ALL
            .into_iter()
            .find(|sig| sig.name() == name || sig.number().to_string() == name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown signal {s:?}")))
    }
}

/// Client for the broker's `cntl` service.
#[derive(Debug)]
pub struct CntlService<S = TcpStream> {
    slot: ServiceSlot<S>,
}

impl CntlService<TcpStream> {
    /// Connect to the broker and activate the cntl service.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::activate(Connection::open(config).await?).await
    }
}

impl<S: Transport> CntlService<S> {
    /// Activate the cntl service on a handshaken connection.
    pub async fn activate(conn: Connection<S>) -> Result<Self> {
        Ok(Self {
            slot: ServiceSlot::activate(conn, ServiceKind::Cntl).await?,
        })
    }

    /// `false` once [`disconnect`](Self::disconnect) has run.
    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Send `quit` and close the connection. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.slot.disconnect(Some(TERMINATOR)).await
    }

    /// Deliver `signal` to `pid`.
    pub async fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        let conn = self.slot.get()?;
        conn.send(format!("kill {pid} {}\r\n", signal.number()).as_bytes())
            .await?;
        let ack = conn.read_line().await?;
        if ack != "ok\r\n" {
            return Err(Error::protocol(format!(
                "kill {pid} {signal} answered {:?}",
                printable(ack.as_bytes())
            )));
        }
        log::debug!("[Cntl] Sent {signal} to {pid}");
        Ok(())
    }
}
