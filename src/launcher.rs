//! Launcher service: start a program and capture its output.
//!
//! ```text
//! start/flags run <cmd> <cmd> <args...>\r\n  ──► one acknowledgement line
//!                                            ──► program output until the
//!                                                broker closes the stream
//! ```
//!
//! The executable is sent twice: once as the path to run, once as argv[0].
//! Arguments are space-joined without escaping, so an argument containing
//! whitespace cannot be expressed and is rejected.

use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::framer::Transport;
use crate::session::{Connection, ServiceKind, ServiceSlot};

/// Client for the broker's `launcher` service.
#[derive(Debug)]
pub struct LauncherService<S = TcpStream> {
    slot: ServiceSlot<S>,
}

impl LauncherService<TcpStream> {
    /// Connect to the broker and activate the launcher service.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::activate(Connection::open(config).await?).await
    }
}

impl<S: Transport> LauncherService<S> {
    /// Activate the launcher service on a handshaken connection.
    pub async fn activate(conn: Connection<S>) -> Result<Self> {
        Ok(Self {
            slot: ServiceSlot::activate(conn, ServiceKind::Launcher).await?,
        })
    }

    /// `false` after [`execute`](Self::execute) or
    /// [`disconnect`](Self::disconnect).
    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Close the connection. No terminator is sent. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.slot.disconnect(None).await
    }

    /// Run `command` with `args` and return everything it printed.
    ///
    /// The broker closes the connection when the program exits, so this
    /// consumes the service: later calls fail with [`Error::NotConnected`].
    pub async fn execute(&mut self, command: &str, args: &[&str]) -> Result<String> {
        check_word(command)?;
        for arg in args {
            check_word(arg)?;
        }
        let mut request = format!("start/flags run {command} {command}");
        for arg in args {
            request.push(' ');
            request.push_str(arg);
        }
        request.push_str("\r\n");

        let mut conn = self.slot.take()?;
        conn.send(request.as_bytes()).await?;
        let ack = conn.read_line().await?;
        log::debug!("[Launcher] {command} acknowledged: {}", ack.trim_end());
        let output = conn.read_until_close().await?;
        if let Err(e) = conn.close(None).await {
            log::debug!("[Launcher] Close after exit failed: {e}");
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

fn check_word(word: &str) -> Result<()> {
    if word.is_empty() || word.contains(char::is_whitespace) {
        return Err(Error::InvalidArgument(format!(
            "{word:?} cannot be sent to the launcher: empty or contains whitespace"
        )));
    }
    Ok(())
}
