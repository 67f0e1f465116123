//! SInfo service: process table, memory maps and system summary.
//!
//! Requests are ASCII lines; responses are length-prefixed binary blocks
//! decoded by [`crate::record`].

use std::collections::BTreeMap;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::Result;
use crate::framer::Transport;
use crate::record::{
    self, ProcessInfo, ProcessMMap, SysInfo, SYSINFO_LENGTH_LEN, SYSINFO_PREAMBLE_LEN,
    TABLE_PREAMBLE_LEN,
};
use crate::session::{Connection, ServiceKind, ServiceSlot};

const TERMINATOR: &[u8] = b"done\r\n";

/// Client for the broker's `sinfo` service.
#[derive(Debug)]
pub struct SInfoService<S = TcpStream> {
    slot: ServiceSlot<S>,
}

impl SInfoService<TcpStream> {
    /// Connect to the broker and activate the sinfo service.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::activate(Connection::open(config).await?).await
    }
}

impl<S: Transport> SInfoService<S> {
    /// Activate the sinfo service on a handshaken connection.
    pub async fn activate(conn: Connection<S>) -> Result<Self> {
        Ok(Self {
            slot: ServiceSlot::activate(conn, ServiceKind::SInfo).await?,
        })
    }

    /// `false` once [`disconnect`](Self::disconnect) has run.
    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Send `done` and close the connection. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.slot.disconnect(Some(TERMINATOR)).await
    }

    /// All processes on the target, keyed by pid.
    pub async fn get_pids(&mut self) -> Result<BTreeMap<i32, ProcessInfo>> {
        let payload = self.table(b"get pids\r\n").await?;
        let table = record::decode_processes(&payload)?;
        log::debug!("[SInfo] {} processes", table.len());
        Ok(table)
    }

    /// Memory mappings of `pid`, in broker order.
    pub async fn get_mmaps(&mut self, pid: i32) -> Result<Vec<ProcessMMap>> {
        let payload = self.table(format!("get mmaps {pid}\r\n").as_bytes()).await?;
        record::decode_mmaps(&payload)
    }

    /// Host name and memory summary.
    pub async fn get_sysinfo(&mut self) -> Result<SysInfo> {
        let conn = self.slot.get()?;
        conn.send(b"get sysinfo\r\n").await?;
        conn.read_exact(SYSINFO_PREAMBLE_LEN).await?;
        let length_word = conn.read_exact(SYSINFO_LENGTH_LEN).await?;
        let payload_len = record::sysinfo_payload_len(&length_word)?;
        let payload = conn.read_exact(payload_len).await?;
        SysInfo::decode(&payload)
    }

    /// Send a table request and return its payload.
    async fn table(&mut self, request: &[u8]) -> Result<bytes::Bytes> {
        let conn = self.slot.get()?;
        conn.send(request).await?;
        let preamble = conn.read_exact(TABLE_PREAMBLE_LEN).await?;
        let len = record::table_payload_len(&preamble)?;
        conn.read_exact(len).await
    }
}
