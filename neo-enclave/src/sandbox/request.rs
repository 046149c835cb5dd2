//! Script execution request and result types

use std::fmt;
use zeroize::Zeroize;

/// A script to run inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    /// WebAssembly module, text or binary
    pub script: Vec<u8>,
    /// Exported function to call
    pub entry_point: String,
    /// JSON-encoded input
    pub input: Vec<u8>,
    /// Linear memory ceiling in bytes; 0 selects the configured default
    pub memory_limit: u64,
    /// Wall-clock timeout; 0 selects the configured default
    pub timeout_ms: u64,
}

impl ScriptRequest {
    pub fn new(
        script: impl Into<Vec<u8>>,
        entry_point: impl Into<String>,
        input: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            script: script.into(),
            entry_point: entry_point.into(),
            input: input.into(),
            memory_limit: 0,
            timeout_ms: 0,
        }
    }

    pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Why a script run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptErrorKind {
    /// Script did not compile or uses unsupported imports
    InvalidScript,
    /// Input was not valid JSON
    InvalidInput,
    /// A required export is missing or has the wrong type
    MissingExport,
    /// Script trapped
    Trap,
    /// Script tried to grow memory past its limit
    MemoryLimitExceeded,
    /// Script ran past its timeout and was interrupted
    Timeout,
    /// Output was out of bounds or not valid JSON
    InvalidOutput,
}

impl fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptErrorKind::InvalidScript => "invalid script",
            ScriptErrorKind::InvalidInput => "invalid input",
            ScriptErrorKind::MissingExport => "missing export",
            ScriptErrorKind::Trap => "trap",
            ScriptErrorKind::MemoryLimitExceeded => "memory limit exceeded",
            ScriptErrorKind::Timeout => "timeout",
            ScriptErrorKind::InvalidOutput => "invalid output",
        };
        f.write_str(name)
    }
}

/// Output or error, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Success { output: Vec<u8> },
    Failure { kind: ScriptErrorKind, message: String },
}

/// Result of one script run.
///
/// Owns its buffers and wipes them when dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResult {
    pub outcome: ScriptOutcome,
    /// Peak linear memory in bytes
    pub memory_used: u64,
    pub duration_ms: u64,
    /// Lines the script logged through `env.log`
    pub logs: Vec<String>,
}

impl ScriptResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, ScriptOutcome::Success { .. })
    }

    /// JSON output, on success
    pub fn output(&self) -> Option<&[u8]> {
        match &self.outcome {
            ScriptOutcome::Success { output } => Some(output),
            ScriptOutcome::Failure { .. } => None,
        }
    }

    /// Human-readable error, on failure
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ScriptOutcome::Success { .. } => None,
            ScriptOutcome::Failure { message, .. } => Some(message),
        }
    }

    pub fn error_kind(&self) -> Option<ScriptErrorKind> {
        match &self.outcome {
            ScriptOutcome::Success { .. } => None,
            ScriptOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Release output, error and logs together
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ScriptResult {
    fn drop(&mut self) {
        match &mut self.outcome {
            ScriptOutcome::Success { output } => output.zeroize(),
            ScriptOutcome::Failure { message, .. } => message.zeroize(),
        }
        self.logs.zeroize();
    }
}
