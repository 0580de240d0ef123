use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Buffers shorter than this get a hex dump in the crash narration.
const HEX_PREVIEW_LIMIT: usize = 200;

/// Persists the buffer that triggered a fatal outcome. The filename is
/// derived from the buffer's content hash unless an exact path is
/// configured, in which case that path is always overwritten.
pub fn write_crash(buf: &[u8], dir: &Path, exact_path: Option<&Path>) -> io::Result<PathBuf> {
    let path = match exact_path {
        Some(p) => p.to_path_buf(),
        None => dir.join(format!("crash-{}", hex(&Sha256::digest(buf)))),
    };
    fs::write(&path, buf)?;
    println!("crash was written to {}", path.display());
    if buf.len() < HEX_PREVIEW_LIMIT {
        println!("crash(hex)={}", hex(buf));
    }
    Ok(path)
}

pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
