pub mod demo;

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use tokio::runtime::Runtime;

type SyncTarget = fn(&[u8]) -> Result<()>;
type AsyncTarget = fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>>>>;

/// A target callable compiled into this binary. The worker invokes it once
/// per dispatched buffer; an `Err` or a panic counts as a crash.
#[derive(Clone, Copy)]
pub enum TargetFn {
    Sync(SyncTarget),
    Async(AsyncTarget),
}

impl TargetFn {
    /// Runs the callable to completion. Asynchronous targets are awaited
    /// before returning, so a hang inside the future is only ever detected
    /// by the manager's execution timeout.
    pub fn invoke(&self, buf: &[u8], rt: &Runtime) -> Result<()> {
        match self {
            TargetFn::Sync(f) => f(buf),
            TargetFn::Async(f) => rt.block_on(f(buf.to_vec())),
        }
    }
}

/// Looks up a registered target by name.
pub fn get_target(name: &str) -> Option<TargetFn> {
    match name {
        "demo" => Some(TargetFn::Sync(demo::parse_record)),
        "demo_async" => Some(TargetFn::Async(demo::parse_record_async)),
        _ => None,
    }
}
