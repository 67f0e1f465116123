//! qconn - client for the qconn remote debug broker.
//!
//! The broker listens on a TCP port of a target device and multiplexes a
//! handful of sub-protocols, one per connection:
//!
//! - **file** - remote file I/O over a colon-delimited text protocol
//! - **sinfo** - process table, memory maps and system summary as binary records
//! - **launcher** - start a program and capture its output
//! - **cntl** - deliver signals to processes
//!
//! # Architecture
//!
//! ```text
//! FileService / SInfoService / LauncherService / CntlService
//!          │  (one per connection, owns it)
//!          ▼
//! Connection  ── handshake, service activation
//!          │
//!          ▼
//! PacketStream ── buffered read_exact / read_until / read_until_close
//!          │
//!          ▼
//! Transport (TcpStream in production, any AsyncRead + AsyncWrite in tests)
//! ```
//!
//! # Modules
//!
//! - [`framer`] - byte-stream framing with per-read deadlines
//! - [`session`] - handshake, `info`, service activation
//! - [`file`] - file service codec
//! - [`record`] - fixed-layout binary record decoding
//! - [`sinfo`], [`launcher`], [`cntl`] - the remaining services
//! - [`config`] - configuration loading

pub mod cntl;
pub mod config;
pub mod error;
pub mod file;
pub mod framer;
pub mod launcher;
pub mod record;
pub mod session;
pub mod sinfo;

pub use cntl::{CntlService, Signal};
pub use config::Config;
pub use error::{Error, Result};
pub use file::{Descriptor, FileService, FileStat, OpenFlags, Permissions};
pub use framer::{PacketStream, Transport};
pub use launcher::LauncherService;
pub use record::{ProcessInfo, ProcessMMap, SysInfo};
pub use session::{BrokerInfo, Connection, ServiceKind};
pub use sinfo::SInfoService;

/// Connect, ask the broker to describe itself, and hang up.
pub async fn broker_info(config: &Config) -> Result<BrokerInfo> {
    let mut conn = Connection::open(config).await?;
    let info = conn.info().await?;
    if let Err(e) = conn.close(None).await {
        log::debug!("[Session] Close after info failed: {e}");
    }
    Ok(info)
}
