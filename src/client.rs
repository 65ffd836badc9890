//! Blocking client for the fsrv protocol
//!
//! One `Client` is one session. Requests are written in a single buffer;
//! responses are read field by field.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::protocol::{code, subcommand, SENTINEL};
use crate::protocol_core::{put_i32, put_str, put_u32, read_i32, read_u32};

// Upper bound for a listed name; anything bigger means we lost framing
const MAX_LISTED_NAME: usize = 4096;

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("connect to server")?;
        let _ = stream.set_nodelay(true);
        Ok(Client { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Client { stream }
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).context("send request")?;
        self.stream.flush()?;
        Ok(())
    }

    /// Send a bare command code. Mostly useful for poking at the server.
    pub fn send_command(&mut self, command: u32) -> Result<()> {
        let mut buf = Vec::with_capacity(4);
        put_u32(&mut buf, command);
        self.send(&buf)
    }

    /// Send a command code followed by an arbitrary string argument.
    pub fn send_request(&mut self, command: u32, arg: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + arg.len());
        put_u32(&mut buf, command);
        put_str(&mut buf, arg)?;
        self.send(&buf)
    }

    fn expect_u32(&mut self, what: &str) -> Result<u32> {
        read_u32(&mut self.stream)?.with_context(|| format!("server closed connection before {}", what))
    }

    pub fn list(&mut self) -> Result<Vec<String>> {
        self.send_request(code::LIST, subcommand::LIST)?;
        let count = self.expect_u32("file count")?;
        let mut names = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let len = self.expect_u32("name length")? as usize;
            if len > MAX_LISTED_NAME {
                bail!("listed name length {} is implausible", len);
            }
            let mut name = vec![0u8; len];
            self.stream.read_exact(&mut name).context("read listed name")?;
            names.push(String::from_utf8_lossy(&name).into_owned());
        }
        Ok(names)
    }

    /// Stream `name` into `out`. `Ok(None)` when the server does not have it.
    pub fn download_to<W: Write>(&mut self, name: &str, out: &mut W) -> Result<Option<u64>> {
        self.send_request(code::DOWNLOAD, name)?;
        // Failure is a 4-byte negative sentinel; success is an 8-byte size
        // whose high word is never negative
        let high = read_i32(&mut self.stream)?.context("server closed connection before file size")?;
        if high < 0 {
            return Ok(None);
        }
        let low = self.expect_u32("file size")?;
        let size = ((high as u64) << 32) | low as u64;

        let copied = io::copy(&mut (&mut self.stream).take(size), out).context("receive file body")?;
        if copied != size {
            bail!("download of {} cut short: {} of {} bytes", name, copied, size);
        }
        out.flush()?;
        Ok(Some(size))
    }

    /// Download `name` into the file at `local`.
    ///
    /// The body is staged in a temporary file beside `local` and only moved
    /// into place once it arrived complete, so a refused or broken download
    /// leaves any existing `local` untouched.
    pub fn download_file(&mut self, name: &str, local: &Path) -> Result<Option<u64>> {
        let dir = match local.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temporary file in {}", dir.display()))?;
        let size = match self.download_to(name, &mut io::BufWriter::new(staged.as_file_mut()))? {
            Some(size) => size,
            None => return Ok(None),
        };
        staged
            .persist(local)
            .with_context(|| format!("move download into {}", local.display()))?;
        Ok(Some(size))
    }

    pub fn download(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        Ok(self.download_to(name, &mut buf)?.map(|_| buf))
    }

    /// Send exactly `size` bytes from `reader` as `name`.
    ///
    /// The server does not acknowledge success; a rejection shows up as a
    /// closed connection on the next request.
    pub fn upload_from<R: Read>(&mut self, name: &str, reader: R, size: u64) -> Result<()> {
        let wire_size = i32::try_from(size)
            .with_context(|| format!("{} bytes is too large for the upload size field", size))?;
        let mut header = Vec::with_capacity(24 + name.len());
        put_u32(&mut header, code::UPLOAD);
        put_str(&mut header, subcommand::UPLOAD)?;
        put_i32(&mut header, wire_size);
        put_str(&mut header, name)?;
        self.send(&header)?;

        let copied = io::copy(&mut reader.take(size), &mut self.stream).context("send file body")?;
        if copied != size {
            bail!("local source for {} ended after {} of {} bytes", name, copied, size);
        }
        self.stream.flush()?;
        Ok(())
    }

    pub fn upload(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.upload_from(name, data, data.len() as u64)
    }

    /// Tell the server an announced upload will not happen.
    ///
    /// Returns true when the server answered with the NACK sentinel. The
    /// server closes the session afterwards.
    pub fn abort_upload(&mut self) -> Result<bool> {
        let mut buf = Vec::with_capacity(18);
        put_u32(&mut buf, code::UPLOAD);
        put_str(&mut buf, subcommand::UPLOAD)?;
        put_i32(&mut buf, SENTINEL);
        self.send(&buf)?;
        Ok(read_i32(&mut self.stream)? == Some(SENTINEL))
    }

    /// True once the server has closed its side of the connection.
    pub fn is_closed_by_server(&mut self) -> Result<bool> {
        let mut b = [0u8; 1];
        match self.stream.read(&mut b) {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// End the session and wait for the server to hang up.
    pub fn exit(mut self) -> Result<()> {
        self.send_request(code::EXIT, subcommand::EXIT)?;
        let mut rest = Vec::new();
        match self.stream.read_to_end(&mut rest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
            Err(e) => Err(e).context("waiting for server to close"),
        }
    }
}
