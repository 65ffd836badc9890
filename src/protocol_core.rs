//! Wire helpers shared by the server session and the client
//!
//! Integers are big-endian. Strings are a u32 length followed by UTF-8 bytes.

use anyhow::{bail, Context, Result};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::protocol::MAX_STR_LEN;

/// Resolve a client-supplied filename to a path directly inside `root`.
///
/// The namespace is flat, so anything that is not a single plain file
/// name is refused:
/// 1. Empty names and names containing NUL
/// 2. Path separators of either flavour
/// 3. `.`, `..`, root and prefix components
/// 4. On Windows, ':' (ADS defense)
/// 5. Existing entries, symlinks included, whose canonical path leaves the
///    root or cannot be resolved (dangling links)
///
/// `root` must already be canonical.
pub fn normalize_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        bail!("empty file name");
    }
    if name.contains('\0') {
        bail!("file name contains NUL byte");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("file name contains a path separator: {:?}", name);
    }
    #[cfg(windows)]
    if name.contains(':') {
        bail!("file name contains colon (potential ADS attack)");
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        (Some(other), _) => bail!("file name has disallowed component: {:?}", other),
        (None, _) => bail!("empty file name"),
    }

    let joined = root.join(name);
    // symlink_metadata does not follow the leaf, so a dangling link is seen
    // as present and goes through canonicalize (which refuses it)
    let final_path = match std::fs::symlink_metadata(&joined) {
        Ok(_) => joined
            .canonicalize()
            .with_context(|| format!("failed to canonicalize {:?}", joined))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => joined,
        Err(e) => return Err(e).with_context(|| format!("failed to stat {:?}", joined)),
    };

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", name, root);
    }
    Ok(final_path)
}

/// Fill `buf` completely.
///
/// Returns `Ok(false)` when the peer closed before sending a single byte;
/// a close part-way through the field is an `UnexpectedEof` error.
pub fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<Option<u32>> {
    let mut b = [0u8; 4];
    Ok(read_exact_or_eof(r, &mut b)?.then(|| u32::from_be_bytes(b)))
}

pub fn read_i32<R: Read>(r: &mut R) -> io::Result<Option<i32>> {
    let mut b = [0u8; 4];
    Ok(read_exact_or_eof(r, &mut b)?.then(|| i32::from_be_bytes(b)))
}

/// Read a length-prefixed string of at most `MAX_STR_LEN` bytes.
///
/// `Ok(None)` means the peer closed cleanly before the length arrived.
pub fn read_string<R: Read>(r: &mut R) -> Result<Option<String>> {
    let len = match read_u32(r)? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    if len > MAX_STR_LEN {
        bail!("string length {} exceeds limit {}", len, MAX_STR_LEN);
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    let s = String::from_utf8(bytes).context("string is not valid utf-8")?;
    Ok(Some(s))
}

/// Strip the trailing NUL/newline padding some clients append to literals.
pub fn trim_literal(s: &str) -> &str {
    s.trim_end_matches(['\0', '\r', '\n'])
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a length-prefixed string (u32 length, then bytes).
pub fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u32::try_from(s.len()).context("string too long for u32 length prefix")?;
    put_u32(buf, len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}
