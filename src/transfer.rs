//! File operations against the single served directory
//!
//! Listing, chunked download and size-prefixed upload. Every name that
//! reaches this module came off the network and is resolved through
//! `normalize_under_root` before any filesystem call.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::protocol::{CHUNK_SIZE, SENTINEL, UPLOAD_BUF_SIZE};
use crate::protocol_core::{normalize_under_root, put_i32, put_str, put_u32, put_u64};

/// Declared upload size as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSize {
    /// Client signalled an abort, or the size never arrived
    Failed,
    Bytes(u64),
}

impl UploadSize {
    pub fn from_wire(v: i32) -> Self {
        if v < 0 {
            UploadSize::Failed
        } else {
            UploadSize::Bytes(v as u64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Sent(u64),
    /// Sentinel was sent; the session can continue
    NotFound(String),
    /// Local read failed after the size went out; the stream is short
    Aborted { sent: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored { bytes: u64, replaced: bool },
    /// NACK was sent, nothing was written
    Rejected(String),
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open the served directory. It must already exist.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.exists() {
            bail!("root directory does not exist: {}", root.display());
        }
        if !root.is_dir() {
            bail!("root path is not a directory: {}", root.display());
        }
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))?;
        Ok(FileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the regular files directly inside the root, sorted.
    pub fn file_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = entry.with_context(|| format!("reading {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            // A lossy name could never be downloaded again, so leave it out
            match entry.file_name().to_str() {
                Some(name) => names.push(name.to_string()),
                None => warn!(path = %entry.path().display(), "skipping non UTF-8 file name"),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Send the file count followed by each length-prefixed name.
    pub fn list<W: Write>(&self, w: &mut W) -> Result<usize> {
        let names = self.file_names()?;
        let count = u32::try_from(names.len()).context("too many files to list")?;
        let mut buf = Vec::with_capacity(4 + names.iter().map(|n| 4 + n.len()).sum::<usize>());
        put_u32(&mut buf, count);
        for name in &names {
            put_str(&mut buf, name)?;
        }
        w.write_all(&buf)?;
        w.flush()?;
        Ok(names.len())
    }

    /// Send the size and then the content of `name` in `CHUNK_SIZE` pieces.
    ///
    /// Socket write failures are returned as errors; anything wrong on the
    /// file side is reported through the outcome.
    pub fn download<W: Write>(&self, name: &str, w: &mut W) -> Result<DownloadOutcome> {
        let opened = normalize_under_root(&self.root, name).and_then(|path| {
            let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
            let md = file.metadata()?;
            if !md.is_file() {
                bail!("{} is not a regular file", path.display());
            }
            Ok((file, md.len()))
        });
        let (mut file, size) = match opened {
            Ok(v) => v,
            Err(e) => {
                let mut nack = Vec::with_capacity(4);
                put_i32(&mut nack, SENTINEL);
                w.write_all(&nack)?;
                w.flush()?;
                return Ok(DownloadOutcome::NotFound(format!("{:#}", e)));
            }
        };

        let mut header = Vec::with_capacity(8);
        put_u64(&mut header, size);
        w.write_all(&header)?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = match file.read(&mut buf[..want]) {
                Ok(0) => {
                    return Ok(DownloadOutcome::Aborted {
                        sent,
                        reason: "file shrank during transfer".to_string(),
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Ok(DownloadOutcome::Aborted {
                        sent,
                        reason: e.to_string(),
                    })
                }
            };
            w.write_all(&buf[..n])?;
            sent += n as u64;
        }
        w.flush()?;
        Ok(DownloadOutcome::Sent(size))
    }

    /// Receive exactly `size` bytes from `stream` into `name`, replacing any
    /// existing file of that name.
    ///
    /// A failed size, a bad name or an unopenable target sends the NACK and
    /// writes nothing. A receive error mid-body is returned as an error and
    /// leaves the partial file behind.
    pub fn upload<S: Read + Write>(
        &self,
        name: &str,
        size: UploadSize,
        stream: &mut S,
    ) -> Result<UploadOutcome> {
        let size = match size {
            UploadSize::Bytes(n) => n,
            UploadSize::Failed => {
                send_nack(stream);
                return Ok(UploadOutcome::Rejected("client aborted upload".to_string()));
            }
        };

        let opened = normalize_under_root(&self.root, name).and_then(|path| {
            let replaced = path.is_file();
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("open {} for writing", path.display()))?;
            Ok((file, replaced))
        });
        let (mut file, replaced) = match opened {
            Ok(v) => v,
            Err(e) => {
                send_nack(stream);
                return Ok(UploadOutcome::Rejected(format!("{:#}", e)));
            }
        };

        let mut buf = vec![0u8; UPLOAD_BUF_SIZE.min(size.max(1) as usize)];
        let mut remaining = size;
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            let n = match stream.read(&mut buf[..to_read]) {
                Ok(0) => bail!(
                    "peer closed with {} of {} upload bytes outstanding",
                    remaining,
                    size
                ),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("receiving upload body"),
            };
            file.write_all(&buf[..n]).context("writing upload body")?;
            remaining -= n as u64;
        }
        file.flush()?;
        Ok(UploadOutcome::Stored {
            bytes: size,
            replaced,
        })
    }
}

// Best effort: the peer may already be gone
fn send_nack<W: Write>(w: &mut W) {
    let mut nack = Vec::with_capacity(4);
    put_i32(&mut nack, SENTINEL);
    let _ = w.write_all(&nack).and_then(|_| w.flush());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Duplex;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn decode_list(bytes: &[u8]) -> Vec<String> {
        let mut cur = Cursor::new(bytes);
        let mut b4 = [0u8; 4];
        cur.read_exact(&mut b4).unwrap();
        let count = u32::from_be_bytes(b4);
        let mut names = Vec::new();
        for _ in 0..count {
            cur.read_exact(&mut b4).unwrap();
            let mut name = vec![0u8; u32::from_be_bytes(b4) as usize];
            cur.read_exact(&mut name).unwrap();
            names.push(String::from_utf8(name).unwrap());
        }
        assert_eq!(cur.position() as usize, bytes.len(), "trailing bytes after list");
        names
    }

    #[test]
    fn test_open_requires_directory() {
        let dir = TempDir::new().unwrap();
        assert!(FileStore::open(&dir.path().join("missing")).is_err());
        let file = dir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        assert!(FileStore::open(&file).is_err());
    }

    #[test]
    fn test_list_empty_directory_sends_zero() {
        let (_dir, store) = store();
        let mut out = Vec::new();
        assert_eq!(store.list(&mut out).unwrap(), 0);
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_list_only_regular_files() {
        let (dir, store) = store();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir/nested.txt"), "n").unwrap();

        let mut out = Vec::new();
        assert_eq!(store.list(&mut out).unwrap(), 2);
        let mut names = decode_list(&out);
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_list_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (dir, store) = store();
        fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.bin")), "x").unwrap();

        let mut out = Vec::new();
        assert_eq!(store.list(&mut out).unwrap(), 1);
        assert_eq!(decode_list(&out), vec!["ok.txt"]);
    }

    #[test]
    fn test_download_missing_file_sends_sentinel_only() {
        let (_dir, store) = store();
        let mut out = Vec::new();
        let outcome = store.download("missing.bin", &mut out).unwrap();
        assert!(matches!(outcome, DownloadOutcome::NotFound(_)));
        assert_eq!(out, (-1i32).to_be_bytes().to_vec());
    }

    #[test]
    fn test_download_small_file() {
        let (dir, store) = store();
        fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let mut out = Vec::new();
        assert_eq!(store.download("hello.txt", &mut out).unwrap(), DownloadOutcome::Sent(2));
        let mut expected = 2u64.to_be_bytes().to_vec();
        expected.extend_from_slice(b"hi");
        assert_eq!(out, expected);
    }

    #[test]
    fn test_download_multi_chunk_file() {
        let (dir, store) = store();
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.bin"), &content).unwrap();
        let mut out = Vec::new();
        assert_eq!(store.download("big.bin", &mut out).unwrap(), DownloadOutcome::Sent(2500));
        assert_eq!(&out[..8], &2500u64.to_be_bytes());
        assert_eq!(&out[8..], &content[..]);
    }

    #[test]
    fn test_download_rejects_traversal_and_directories() {
        let (dir, store) = store();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        for name in ["../etc/passwd", "subdir", "/etc/passwd"] {
            let mut out = Vec::new();
            let outcome = store.download(name, &mut out).unwrap();
            assert!(matches!(outcome, DownloadOutcome::NotFound(_)), "{name}");
            assert_eq!(out, (-1i32).to_be_bytes().to_vec());
        }
    }

    #[test]
    fn test_upload_writes_exact_bytes_and_overwrites() {
        let (dir, store) = store();
        fs::write(dir.path().join("a.txt"), "something much longer").unwrap();

        let mut io = Duplex::new(b"abcde".to_vec());
        let outcome = store.upload("a.txt", UploadSize::Bytes(5), &mut io).unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { bytes: 5, replaced: true });
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abcde");
        assert!(io.output.is_empty());

        // Same content again leaves the same bytes
        let mut io = Duplex::new(b"abcde".to_vec());
        store.upload("a.txt", UploadSize::Bytes(5), &mut io).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abcde");
    }

    #[test]
    fn test_upload_reads_only_declared_size() {
        let (dir, store) = store();
        let mut io = Duplex::new(b"abcdeXYZ".to_vec());
        store.upload("new.bin", UploadSize::Bytes(5), &mut io).unwrap();
        assert_eq!(fs::read(dir.path().join("new.bin")).unwrap(), b"abcde");
        let mut rest = Vec::new();
        io.input.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"XYZ");
    }

    #[test]
    fn test_upload_empty_file() {
        let (dir, store) = store();
        let mut io = Duplex::new(Vec::new());
        let outcome = store.upload("empty", UploadSize::Bytes(0), &mut io).unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { bytes: 0, replaced: false });
        assert_eq!(fs::read(dir.path().join("empty")).unwrap().len(), 0);
    }

    #[test]
    fn test_upload_failed_size_sends_nack_without_io() {
        let (dir, store) = store();
        let mut io = Duplex::new(b"ignored".to_vec());
        let outcome = store.upload("x.txt", UploadSize::from_wire(-1), &mut io).unwrap();
        assert!(matches!(outcome, UploadOutcome::Rejected(_)));
        assert_eq!(io.output, (-1i32).to_be_bytes().to_vec());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_upload_rejects_traversal() {
        let (dir, store) = store();
        let mut io = Duplex::new(b"abc".to_vec());
        let outcome = store.upload("../escape.txt", UploadSize::Bytes(3), &mut io).unwrap();
        assert!(matches!(outcome, UploadOutcome::Rejected(_)));
        assert_eq!(io.output, (-1i32).to_be_bytes().to_vec());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_upload_through_dangling_symlink_is_rejected() {
        let (dir, store) = store();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("planted.txt");
        std::os::unix::fs::symlink(&target, dir.path().join("link.txt")).unwrap();

        let mut io = Duplex::new(b"pwned".to_vec());
        let outcome = store.upload("link.txt", UploadSize::Bytes(5), &mut io).unwrap();
        assert!(matches!(outcome, UploadOutcome::Rejected(_)));
        assert_eq!(io.output, (-1i32).to_be_bytes().to_vec());
        assert!(!target.exists());
    }

    #[test]
    fn test_upload_short_body_is_an_error() {
        let (dir, store) = store();
        let mut io = Duplex::new(b"abc".to_vec());
        assert!(store.upload("short.bin", UploadSize::Bytes(10), &mut io).is_err());
        // Partial file is an accepted leftover
        assert_eq!(fs::read(dir.path().join("short.bin")).unwrap(), b"abc");
    }
}
