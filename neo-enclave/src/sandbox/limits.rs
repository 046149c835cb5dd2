//! Memory and time bounds for a single script run

use crate::config::SandboxConfig;
use crate::error::{TeeError, TeeResult};
use crate::sandbox::ScriptRequest;
use std::time::Duration;
use wasmtime::ResourceLimiter;

/// Table elements a script may allocate
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Limits after applying defaults and maxima
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub memory_limit: u64,
    pub timeout: Duration,
}

impl ResolvedLimits {
    /// Apply defaults for zero limits and reject limits above the maxima
    pub fn resolve(request: &ScriptRequest, config: &SandboxConfig) -> TeeResult<Self> {
        let memory_limit = match request.memory_limit {
            0 => config.default_memory_limit,
            limit if limit > config.max_memory_limit => {
                return Err(TeeError::InvalidParameter(format!(
                    "memory limit {} exceeds maximum {}",
                    limit, config.max_memory_limit
                )))
            }
            limit => limit,
        };

        let timeout_ms = match request.timeout_ms {
            0 => config.default_timeout_ms,
            timeout if timeout > config.max_timeout_ms => {
                return Err(TeeError::InvalidParameter(format!(
                    "timeout {}ms exceeds maximum {}ms",
                    timeout, config.max_timeout_ms
                )))
            }
            timeout => timeout,
        };

        Ok(Self {
            memory_limit,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Epoch ticks before interruption: the timeout rounded up to whole
    /// ticks, plus one for the tick already in progress
    pub fn deadline_ticks(&self, tick: Duration) -> u64 {
        let tick_ms = tick.as_millis().max(1);
        let ticks = self.timeout.as_millis().div_ceil(tick_ms);
        u64::try_from(ticks).unwrap_or(u64::MAX - 1).saturating_add(1)
    }
}

/// Raised when a script grows linear memory past its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("memory limit exceeded: {desired} bytes requested, limit is {limit}")]
pub struct MemoryLimitExceeded {
    pub desired: usize,
    pub limit: usize,
}

/// Caps linear memory growth and records the high-water mark
#[derive(Debug)]
pub struct MemoryLimiter {
    limit: usize,
    peak: usize,
    exceeded: bool,
}

impl MemoryLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            peak: 0,
            exceeded: false,
        }
    }

    /// Largest linear memory size granted, in bytes
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.limit {
            self.exceeded = true;
            return Err(MemoryLimitExceeded {
                desired,
                limit: self.limit,
            }
            .into());
        }
        self.peak = self.peak.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        Ok(desired as usize <= MAX_TABLE_ELEMENTS)
    }

    fn instances(&self) -> usize {
        1
    }

    fn tables(&self) -> usize {
        1
    }

    fn memories(&self) -> usize {
        1
    }
}
