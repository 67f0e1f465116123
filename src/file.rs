//! File service: remote open/close/read/write/stat/delete/move/list.
//!
//! Wire grammar (ASCII, CRLF-terminated, `:`-separated, paths quoted,
//! integers lowercase hex unless noted):
//!
//! ```text
//! o:"<path>":<flags>[:<perms>]      ──► o:<fd, decimal>:_:_:_
//! c:<fd>                            ──► o
//! s:<fd>                            ──► o:<15 hex stat fields>
//! r:<fd>:<offset>:<size>:<raw>      ──► o:<n>:_:_  then n payload bytes
//! w:<fd>:<offset>:<len>:0 <payload> ──► o:<written>:_
//! d:"<path>":1                      ──► o
//! m:"<src>":"<dst>"                 ──► o
//! any failure                       ──► e:<message>
//! ```
//!
//! A [`Descriptor`] is a remote capability: every operation here that opens
//! one closes it again on every path, including failures.
//!
//! Rust guideline compliant 2025-01

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::framer::Transport;
use crate::session::{Connection, ServiceKind, ServiceSlot};

/// Largest payload a single `read` may request.
pub const MAX_READ_SIZE: usize = 2048;

/// Payload size used when a convenience helper splits a write.
pub const WRITE_CHUNK_SIZE: usize = 2048;

/// Most bytes `read_all` reserves up front, whatever `stat` claims.
const READ_ALL_RESERVE: u64 = MAX_READ_SIZE as u64 * 16;

/// Bytes requested per directory page.
const DIR_PAGE_SIZE: usize = 0x400;

/// Terminator sent before the file service hangs up.
const TERMINATOR: &[u8] = b"q";

bitflags! {
    /// Open mode bits, POSIX-style. An empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Write only.
        const WRONLY = 1 << 0;
        /// Read and write.
        const RDWR = 1 << 1;
        /// Append on each write.
        const APPEND = 1 << 3;
        /// Create if missing. Requires permissions.
        const CREAT = 1 << 8;
        /// Truncate to zero length.
        const TRUNC = 1 << 9;
    }
}

impl OpenFlags {
    /// Read only.
    pub const RDONLY: Self = Self::empty();
}

bitflags! {
    /// Permission and file-type bits, as found in `st_mode`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Others may execute.
        const S_IXOTH = 1 << 0;
        /// Others may write.
        const S_IWOTH = 1 << 1;
        /// Others may read.
        const S_IROTH = 1 << 2;
        /// Group may execute.
        const S_IXGRP = 1 << 3;
        /// Group may write.
        const S_IWGRP = 1 << 4;
        /// Group may read.
        const S_IRGRP = 1 << 5;
        /// Owner may execute.
        const S_IXUSR = 1 << 6;
        /// Owner may write.
        const S_IWUSR = 1 << 7;
        /// Owner may read.
        const S_IRUSR = 1 << 8;
        /// Directory.
        const S_IFDIR = 0x4000;
        /// Regular file.
        const S_IFREG = 0x8000;
    }
}

impl Permissions {
    /// Mask selecting the file-type bits of a mode.
    pub const TYPE_MASK: u32 = 0xF000;

    /// Interpret a raw mode, keeping unknown bits.
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_retain(mode)
    }
}

/// Handle naming an open remote file on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Descriptor(u32);

impl Descriptor {
    /// Raw handle value as assigned by the broker.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of remote inode metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs, reason = "field names mirror struct stat")]
pub struct FileStat {
    pub ino: u64,
    pub size: u64,
    pub dev: u64,
    pub rdev: u64,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mode: u64,
    pub nlink: u64,
    pub blocksize: u64,
    pub nblocks: u64,
    pub blksize: u64,
    pub blocks: u64,
}

impl FileStat {
    fn parse(fields: &[&str]) -> Result<Self> {
        let [
            ino, size, dev, rdev, uid, gid, mtime, atime, ctime, mode, nlink, blocksize, nblocks,
            blksize, blocks,
        ] = fields
        else {
            return Err(Error::protocol(format!(
                "stat needs 15 fields, got {}",
                fields.len()
            )));
        };
        Ok(Self {
            ino: hex_field(ino, "ino")?,
            size: hex_field(size, "size")?,
            dev: hex_field(dev, "dev")?,
            rdev: hex_field(rdev, "rdev")?,
            uid: hex_field(uid, "uid")?,
            gid: hex_field(gid, "gid")?,
            mtime: hex_field(mtime, "mtime")?,
            atime: hex_field(atime, "atime")?,
            ctime: hex_field(ctime, "ctime")?,
            mode: hex_field(mode, "mode")?,
            nlink: hex_field(nlink, "nlink")?,
            blocksize: hex_field(blocksize, "blocksize")?,
            nblocks: hex_field(nblocks, "nblocks")?,
            blksize: hex_field(blksize, "blksize")?,
            blocks: hex_field(blocks, "blocks")?,
        })
    }

    /// Permission and type bits of `mode`.
    pub fn permissions(&self) -> Permissions {
        Permissions::from_mode(self.mode as u32)
    }

    /// `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.mode as u32 & Permissions::TYPE_MASK == Permissions::S_IFDIR.bits()
    }

    /// `true` for regular files.
    pub fn is_file(&self) -> bool {
        self.mode as u32 & Permissions::TYPE_MASK == Permissions::S_IFREG.bits()
    }
}

/// How a `read` response reports its payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// File contents; length in the second field.
    Data,
    /// Directory page (raw flag set); length in the third field.
    Directory,
}

impl ReadMode {
    fn raw_flag(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Directory => 1,
        }
    }

    fn length_field(self) -> usize {
        match self {
            Self::Data => 1,
            Self::Directory => 2,
        }
    }
}

/// Client for the broker's `file` service.
#[derive(Debug)]
pub struct FileService<S = TcpStream> {
    slot: ServiceSlot<S>,
}

impl FileService<TcpStream> {
    /// Connect to the broker and activate the file service.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::activate(Connection::open(config).await?).await
    }
}

impl<S: Transport> FileService<S> {
    /// Activate the file service on a handshaken connection.
    pub async fn activate(conn: Connection<S>) -> Result<Self> {
        Ok(Self {
            slot: ServiceSlot::activate(conn, ServiceKind::File).await?,
        })
    }

    /// `false` once [`disconnect`](Self::disconnect) has run.
    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    /// Send the terminator and close the connection. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.slot.disconnect(Some(TERMINATOR)).await
    }

    // ── Primitives ───────────────────────────────────────────────────────

    /// Open `path` and return its descriptor.
    ///
    /// `permissions` is required when `flags` contains
    /// [`OpenFlags::CREAT`]; without it the call fails before anything is
    /// sent. Pass [`Permissions::S_IFDIR`] to open (or create) a directory.
    pub async fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        permissions: Option<Permissions>,
    ) -> Result<Descriptor> {
        if flags.contains(OpenFlags::CREAT) && permissions.is_none() {
            return Err(Error::InvalidArgument(
                "permissions must be set when creating a file".to_string(),
            ));
        }
        let mut request = format!("o:{}:{:x}", quote(path)?, flags.bits());
        if let Some(permissions) = permissions {
            request.push_str(&format!(":{:x}", permissions.bits()));
        }
        request.push_str("\r\n");

        let line = self.exchange(request.as_bytes()).await?;
        let fields = parse_fields(&line, 5, || format!("unable to open {path}"))?;
        let fd = fields[1]
            .parse()
            .map_err(|e| Error::protocol(format!("bad descriptor {:?}: {e}", fields[1])))?;
        log::debug!("[File] Opened {path} as {fd}");
        Ok(Descriptor(fd))
    }

    /// Close a descriptor.
    pub async fn close(&mut self, fd: Descriptor) -> Result<()> {
        let line = self.exchange(format!("c:{fd}\r\n").as_bytes()).await?;
        parse_fields(&line, 1, || format!("could not close descriptor {fd}"))?;
        Ok(())
    }

    /// Fetch inode metadata for an open descriptor.
    pub async fn stat(&mut self, fd: Descriptor) -> Result<FileStat> {
        let line = self.exchange(format!("s:{fd}\r\n").as_bytes()).await?;
        let fields = parse_fields(&line, 16, || format!("unable to stat descriptor {fd}"))?;
        FileStat::parse(&fields[1..])
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// `size` above [`MAX_READ_SIZE`] is rejected without contacting the
    /// broker.
    pub async fn read(&mut self, fd: Descriptor, size: usize, offset: u64) -> Result<Bytes> {
        if size > MAX_READ_SIZE {
            return Err(Error::InvalidArgument(format!(
                "read size {size} exceeds {MAX_READ_SIZE} bytes"
            )));
        }
        self.read_raw(fd, offset, size, ReadMode::Data).await
    }

    /// Write `data` at `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::Integrity`] if the broker reports fewer bytes written than
    /// were sent, even though its response was a success line.
    pub async fn write(&mut self, fd: Descriptor, data: &[u8], offset: u64) -> Result<()> {
        let mut request = format!("w:{fd}:{offset:x}:{:x}:0\r\n", data.len()).into_bytes();
        request.extend_from_slice(data);

        let line = self.exchange(&request).await?;
        let fields = parse_fields(&line, 3, || format!("unable to write descriptor {fd}"))?;
        let written = hex_field(fields[1], "bytes written")?;
        if written != data.len() as u64 {
            return Err(Error::Integrity(format!(
                "could not write whole chunk of {} bytes, only wrote {written} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    /// Delete a remote file or empty directory.
    pub async fn delete(&mut self, path: &str) -> Result<()> {
        let line = self
            .exchange(format!("d:{}:1\r\n", quote(path)?).as_bytes())
            .await?;
        parse_fields(&line, 1, || format!("unable to delete {path}"))?;
        Ok(())
    }

    /// Rename `source` to `dest`.
    pub async fn rename(&mut self, source: &str, dest: &str) -> Result<()> {
        let request = format!("m:{}:{}\r\n", quote(source)?, quote(dest)?);
        let line = self.exchange(request.as_bytes()).await?;
        parse_fields(&line, 1, || format!("unable to move {source} to {dest}"))?;
        Ok(())
    }

    // ── Derived operations ───────────────────────────────────────────────

    /// List the entries of a remote directory, without `.` and `..`.
    ///
    /// The directory descriptor is closed whether or not paging succeeds.
    pub async fn list(&mut self, path: &str) -> Result<Vec<String>> {
        let fd = self
            .open(path, OpenFlags::RDONLY, Some(Permissions::S_IFDIR))
            .await?;
        let listing = self.read_dir_pages(fd).await;
        let closed = self.close(fd).await;
        settle(listing, closed, fd)
    }

    /// Read the whole file behind `fd`, sized by `stat`.
    ///
    /// # Errors
    ///
    /// [`Error::Integrity`] if the file ends before the size `stat`
    /// reported.
    pub async fn read_all(&mut self, fd: Descriptor) -> Result<Vec<u8>> {
        let size = self.stat(fd).await?.size;
        // Peer-controlled; never trusted for the allocation.
        let reserve = usize::try_from(size.min(READ_ALL_RESERVE)).unwrap_or(0);
        let mut data = Vec::with_capacity(reserve);
        let mut offset = 0;
        while offset < size {
            let chunk = self.read(fd, MAX_READ_SIZE, offset).await?;
            if chunk.is_empty() {
                return Err(Error::Integrity(format!(
                    "descriptor {fd} ended at {offset} of {size} bytes"
                )));
            }
            offset += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Open `path` read-only, read it completely and close it.
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path, OpenFlags::RDONLY, None).await?;
        let contents = self.read_all(fd).await;
        let closed = self.close(fd).await;
        settle(contents, closed, fd)
    }

    /// Create or truncate `path` and write `data` to it.
    pub async fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        permissions: Permissions,
    ) -> Result<()> {
        let flags = OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC;
        let fd = self.open(path, flags, Some(permissions)).await?;
        let written = self.write_chunks(fd, data).await;
        let closed = self.close(fd).await;
        settle(written, closed, fd)
    }

    /// Metadata for `path` without keeping a descriptor open.
    pub async fn stat_path(&mut self, path: &str) -> Result<FileStat> {
        let fd = self.open(path, OpenFlags::RDONLY, None).await?;
        let stat = self.stat(fd).await;
        let closed = self.close(fd).await;
        settle(stat, closed, fd)
    }

    /// Create a directory. Fails if `path` already exists.
    pub async fn mkdir(&mut self, path: &str, permissions: Permissions) -> Result<()> {
        let flags = OpenFlags::CREAT | OpenFlags::WRONLY;
        let fd = self
            .open(path, flags, Some(permissions | Permissions::S_IFDIR))
            .await?;
        self.close(fd).await
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Send one request and read its response line.
    async fn exchange(&mut self, request: &[u8]) -> Result<String> {
        let conn = self.slot.get()?;
        conn.send(request).await?;
        conn.read_line().await
    }

    async fn read_raw(
        &mut self,
        fd: Descriptor,
        offset: u64,
        size: usize,
        mode: ReadMode,
    ) -> Result<Bytes> {
        let request = format!("r:{fd}:{offset:x}:{size:x}:{}\r\n", mode.raw_flag());
        let line = self.exchange(request.as_bytes()).await?;
        let fields = parse_fields(&line, 4, || format!("unable to read descriptor {fd}"))?;
        let len = hex_field(fields[mode.length_field()], "bytes read")?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= size)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "descriptor {fd} returned {len} bytes for a read of {size}"
                ))
            })?;
        self.slot.get()?.read_exact(len).await
    }

    async fn read_dir_pages(&mut self, fd: Descriptor) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut page = 0;
        loop {
            let chunk = self.read_raw(fd, page, DIR_PAGE_SIZE, ReadMode::Directory).await?;
            if chunk.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&chunk);
            let mut names: Vec<&str> = text.split("\r\n").collect();
            // Text after the final CRLF is not an entry.
            names.pop();
            entries.extend(names.into_iter().map(str::to_string));
            page += 1;
        }
        entries.retain(|entry| entry != "." && entry != "..");
        Ok(entries)
    }

    async fn write_chunks(&mut self, fd: Descriptor, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            self.write(fd, chunk, offset).await?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }
}

/// Combine an operation result with the close that followed it.
///
/// The operation's own error wins; a close failure only surfaces when the
/// operation itself succeeded.
fn settle<T>(result: Result<T>, closed: Result<()>, fd: Descriptor) -> Result<T> {
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            log::warn!("[File] Closing descriptor {fd} after failure also failed: {close_err}");
            Err(e)
        }
    }
}

/// Split a response line into fields.
///
/// `e:<message>` becomes [`Error::Remote`] labelled by `context`; a wrong
/// field count or a first field other than `o` is a protocol violation.
fn parse_fields(
    line: &str,
    expected: usize,
    context: impl FnOnce() -> String,
) -> Result<Vec<&str>> {
    let line = line.strip_suffix("\r\n").unwrap_or(line);
    if let Some(message) = line.strip_prefix("e:") {
        return Err(Error::Remote {
            context: context(),
            message: message.to_string(),
        });
    }
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != expected {
        return Err(Error::protocol(format!(
            "expected {expected} fields, got {}: {line:?}",
            fields.len()
        )));
    }
    if fields[0] != "o" {
        return Err(Error::protocol(format!("response was not 'o': {line:?}")));
    }
    Ok(fields)
}

fn hex_field(field: &str, name: &str) -> Result<u64> {
    u64::from_str_radix(field, 16)
        .map_err(|e| Error::protocol(format!("bad {name} field {field:?}: {e}")))
}

/// Quote a path for the wire. Quotes and line breaks cannot be escaped.
fn quote(path: &str) -> Result<String> {
    if path.contains(['"', '\r', '\n']) {
        return Err(Error::InvalidArgument(format!(
            "path {path:?} contains a quote or line break"
        )));
    }
    Ok(format!("\"{path}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{scripted, written};
    use tokio::io::DuplexStream;

    const ACTIVATED: &[u8] = b"service file\r\n";

    async fn service(script: &[u8]) -> (FileService<DuplexStream>, DuplexStream) {
        let mut full = b"OK\r\n".to_vec();
        full.extend_from_slice(script);
        let (conn, broker) = scripted(&full).await;
        (FileService::activate(conn).await.unwrap(), broker)
    }

    /// Client traffic after the activation command.
    async fn requests(service: FileService<DuplexStream>, broker: DuplexStream) -> Vec<u8> {
        drop(service);
        let out = written(broker).await;
        assert!(out.starts_with(ACTIVATED));
        out[ACTIVATED.len()..].to_vec()
    }

    fn stat_line(size: u64, mode: u32) -> String {
        format!("o:1f:{size:x}:3:0:0:0:6655e2a1:6655e2a1:6655e2a1:{mode:x}:1:200:4:1000:68\r\n")
    }

    fn read_response(payload: &[u8]) -> Vec<u8> {
        let mut out = format!("o:{:x}:0:0\r\n", payload.len()).into_bytes();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_open_wire_format_and_descriptor() {
        let (mut svc, broker) = service(b"o:3:0:0:0\r\n").await;
        let fd = svc
            .open(
                "/tmp/myfile.txt",
                OpenFlags::CREAT | OpenFlags::WRONLY,
                Some(Permissions::S_IRUSR | Permissions::S_IWUSR),
            )
            .await
            .unwrap();
        assert_eq!(fd.raw(), 3);
        assert_eq!(requests(svc, broker).await, b"o:\"/tmp/myfile.txt\":101:180\r\n");
    }

    #[tokio::test]
    async fn test_create_without_permissions_sends_nothing() {
        let (mut svc, broker) = service(b"").await;
        for flags in [OpenFlags::CREAT, OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC] {
            let err = svc.open("/tmp/x", flags, None).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
        }
        assert!(requests(svc, broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_directory_fails() {
        let (mut svc, _broker) = service(b"e:File exists\r\n").await;
        let err = svc
            .open(
                "/tmp",
                OpenFlags::CREAT | OpenFlags::WRONLY,
                Some(Permissions::S_IFDIR | Permissions::S_IRUSR | Permissions::S_IWUSR),
            )
            .await
            .unwrap_err();
        match err {
            Error::Remote { context, message } => {
                assert_eq!(context, "unable to open /tmp");
                assert_eq!(message, "File exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_wrong_field_count_is_protocol_violation() {
        let (mut svc, _broker) = service(b"o:3\r\n").await;
        let err = svc.open("/bin/sh", OpenFlags::RDONLY, None).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_stat_twice_is_identical() {
        let mode = (Permissions::S_IFREG | Permissions::S_IRUSR | Permissions::S_IXUSR).bits();
        let line = stat_line(211_840, mode);
        let (mut svc, broker) = service(format!("{line}{line}").as_bytes()).await;
        let fd = Descriptor(5);

        let first = svc.stat(fd).await.unwrap();
        let second = svc.stat(fd).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 211_840);
        assert_eq!(first.ino, 0x1f);
        assert_eq!(first.blocks, 0x68);
        assert!(first.is_file());
        assert!(!first.is_dir());
        assert!(first.permissions().contains(Permissions::S_IXUSR));
        assert_eq!(requests(svc, broker).await, b"s:5\r\ns:5\r\n");
    }

    #[tokio::test]
    async fn test_oversized_read_rejected_locally() {
        let (mut svc, broker) = service(b"").await;
        let err = svc.read(Descriptor(1), MAX_READ_SIZE + 1, 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(requests(svc, broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_returns_payload() {
        let (mut svc, broker) = service(&read_response(b"hello")).await;
        let data = svc.read(Descriptor(3), 5, 16).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(requests(svc, broker).await, b"r:3:10:5:0\r\n");
    }

    #[tokio::test]
    async fn test_read_all_spans_chunks() {
        let contents: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut script = stat_line(2500, 0x81a4).into_bytes();
        script.extend(read_response(&contents[..2048]));
        script.extend(read_response(&contents[2048..]));

        let (mut svc, broker) = service(&script).await;
        assert_eq!(svc.read_all(Descriptor(7)).await.unwrap(), contents);
        assert_eq!(
            requests(svc, broker).await,
            b"s:7\r\nr:7:0:800:0\r\nr:7:800:800:0\r\n"
        );
    }

    #[tokio::test]
    async fn test_read_all_huge_stat_size_does_not_preallocate() {
        let mut script = stat_line(u64::MAX, 0x81a4).into_bytes();
        script.extend(read_response(b"tiny"));
        script.extend(read_response(b""));
        let (mut svc, _broker) = service(&script).await;

        let err = svc.read_all(Descriptor(4)).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_read_all_early_end_is_integrity_error() {
        let mut script = stat_line(5000, 0x81a4).into_bytes();
        script.extend(read_response(b""));
        let (mut svc, _broker) = service(&script).await;

        let err = svc.read_all(Descriptor(7)).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "got {err:?}");
        assert!(err.to_string().contains("ended at 0 of 5000"), "{err}");
    }

    #[tokio::test]
    async fn test_read_longer_than_requested_is_protocol_violation() {
        let (mut svc, _broker) = service(b"o:10:0:0\r\n0123456789abcdef").await;
        let err = svc.read(Descriptor(3), 5, 0).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_directory_page_longer_than_requested_is_rejected() {
        let (mut svc, broker) = service(b"o:4:0:0:0\r\no:0:401:0\r\no\r\n").await;
        let err = svc.list("/").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "got {err:?}");
        assert!(requests(svc, broker).await.ends_with(b"c:4\r\n"));
    }

    #[tokio::test]
    async fn test_write_wire_format() {
        let (mut svc, broker) = service(b"o:8:0\r\n").await;
        svc.write(Descriptor(3), b"Filedata", 0).await.unwrap();
        assert_eq!(requests(svc, broker).await, b"w:3:0:8:0\r\nFiledata");
    }

    #[tokio::test]
    async fn test_short_write_is_integrity_error() {
        let (mut svc, _broker) = service(b"o:4:0\r\n").await;
        let err = svc.write(Descriptor(3), b"Filedata", 0).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_list_pages_and_closes() {
        let page = b".\r\n..\r\nbin\r\netc\r\n";
        let page2 = b"home\r\ntmp\r\n";
        let mut script = b"o:4:0:0:0\r\n".to_vec();
        script.extend(format!("o:1:{:x}:0\r\n", page.len()).into_bytes());
        script.extend_from_slice(page);
        script.extend(format!("o:2:{:x}:0\r\n", page2.len()).into_bytes());
        script.extend_from_slice(page2);
        script.extend_from_slice(b"o:3:0:0\r\n");
        script.extend_from_slice(b"o\r\n");

        let (mut svc, broker) = service(&script).await;
        let entries = svc.list("/").await.unwrap();
        assert_eq!(entries, ["bin", "etc", "home", "tmp"]);
        assert_eq!(
            requests(svc, broker).await,
            b"o:\"/\":0:4000\r\nr:4:0:400:1\r\nr:4:1:400:1\r\nr:4:2:400:1\r\nc:4\r\n"
        );
    }

    #[tokio::test]
    async fn test_list_closes_descriptor_when_page_fails() {
        let (mut svc, broker) = service(b"o:4:0:0:0\r\no:garbage\r\no\r\n").await;
        let err = svc.list("/proc").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "got {err:?}");
        let sent = requests(svc, broker).await;
        assert!(sent.ends_with(b"c:4\r\n"), "{:?}", String::from_utf8_lossy(&sent));
    }

    #[tokio::test]
    async fn test_delete_remote_error_keeps_colons() {
        let (mut svc, broker) = service(b"e:stat: No such file\r\n").await;
        let err = svc.delete("/tmp/gone").await.unwrap_err();
        assert_eq!(err.to_string(), "unable to delete /tmp/gone: stat: No such file");
        assert_eq!(requests(svc, broker).await, b"d:\"/tmp/gone\":1\r\n");
    }

    #[tokio::test]
    async fn test_rename_wire_format() {
        let (mut svc, broker) = service(b"o\r\n").await;
        svc.rename("/tmp/a", "/tmp/b").await.unwrap();
        assert_eq!(requests(svc, broker).await, b"m:\"/tmp/a\":\"/tmp/b\"\r\n");
    }

    #[tokio::test]
    async fn test_quote_in_path_rejected() {
        let (mut svc, broker) = service(b"").await;
        assert!(matches!(
            svc.delete("/tmp/\"x").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(requests(svc, broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_write_file_chunks_and_closes() {
        let data = vec![b'x'; 3000];
        let script = b"o:6:0:0:0\r\no:800:0\r\no:3b8:0\r\no\r\n";
        let (mut svc, broker) = service(script).await;
        svc.write_file("/tmp/big", &data, Permissions::S_IRUSR | Permissions::S_IWUSR)
            .await
            .unwrap();

        let sent = requests(svc, broker).await;
        assert!(sent.starts_with(b"o:\"/tmp/big\":301:180\r\nw:6:0:800:0\r\n"));
        let second_write = b"w:6:800:3b8:0\r\n";
        assert!(sent.windows(second_write.len()).any(|w| w == second_write));
        assert!(sent.ends_with(b"c:6\r\n"));
    }

    #[tokio::test]
    async fn test_mkdir_sets_directory_bit() {
        let (mut svc, broker) = service(b"o:2:0:0:0\r\no\r\n").await;
        svc.mkdir("/tmp/mytestdir", Permissions::S_IRUSR | Permissions::S_IWUSR)
            .await
            .unwrap();
        assert_eq!(
            requests(svc, broker).await,
            b"o:\"/tmp/mytestdir\":101:4180\r\nc:2\r\n"
        );
    }

    #[tokio::test]
    async fn test_stat_path_closes_descriptor() {
        let mut script = b"o:4:0:0:0\r\n".to_vec();
        script.extend(stat_line(12, 0x41ed).into_bytes());
        script.extend_from_slice(b"o\r\n");
        let (mut svc, broker) = service(&script).await;

        let stat = svc.stat_path("/tmp").await.unwrap();
        assert!(stat.is_dir());
        assert_eq!(requests(svc, broker).await, b"o:\"/tmp\":0\r\ns:4\r\nc:4\r\n");
    }

    #[tokio::test]
    async fn test_disconnect_then_use_is_not_connected() {
        let (mut svc, broker) = service(b"").await;
        svc.disconnect().await.unwrap();
        assert!(!svc.is_connected());
        assert!(matches!(svc.stat(Descriptor(1)).await, Err(Error::NotConnected)));
        svc.disconnect().await.unwrap();
        assert_eq!(requests(svc, broker).await, b"q");
    }
}
