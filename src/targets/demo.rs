//! Built-in demonstration targets. They exercise the coverage API the way
//! an instrumentation layer would and hide a crash behind a short byte
//! sequence so a campaign against them eventually terminates.

use anyhow::{Result, bail};

use crate::runner::coverage;

use std::future::Future;
use std::pin::Pin;

/// Parses a toy record format: `REC!` magic, a length byte, then payload.
pub fn parse_record(buf: &[u8]) -> Result<()> {
    coverage::hit(100);
    if buf.len() < 4 || &buf[..4] != b"REC!" {
        return Ok(());
    }
    coverage::hit(101);
    let Some(&len) = buf.get(4) else {
        coverage::hit(102);
        bail!("magic without length byte");
    };
    coverage::hit(103);
    let payload = &buf[5..];
    if payload.len() < len as usize {
        coverage::hit(104);
        return Ok(());
    }
    coverage::hit(105);
    if payload.starts_with(b"boom") {
        coverage::hit(106);
        panic!("demo target reached the crash token");
    }
    if len > 0 {
        coverage::hit(107 + (len as usize % 8));
    }
    Ok(())
}

pub fn parse_record_async(buf: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>>>> {
    Box::pin(async move {
        coverage::hit(200);
        tokio::task::yield_now().await;
        parse_record(&buf)
    })
}
