//! Sandboxed execution of untrusted scripts
//!
//! Scripts are WebAssembly modules run by wasmtime. Linear memory is capped
//! by a [`wasmtime::ResourceLimiter`]; time is bounded preemptively through
//! epoch interruption, so a script that never yields is still stopped.

mod engine;
mod limits;
mod request;

pub use engine::ScriptSandbox;
pub use limits::{MemoryLimitExceeded, ResolvedLimits};
pub use request::{ScriptErrorKind, ScriptOutcome, ScriptRequest, ScriptResult};
