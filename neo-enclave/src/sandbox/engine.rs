//! WebAssembly execution engine
//!
//! Guest contract:
//! - export `memory`
//! - export `alloc(len: i32) -> i32`, returning space for the input
//! - export the entry point `(ptr: i32, len: i32) -> i64`, returning
//!   `(out_ptr << 32) | out_len` of its JSON output
//!
//! The only import offered is `env.log(ptr: i32, len: i32)`.

use crate::config::SandboxConfig;
use crate::crypto::hash;
use crate::error::{TeeError, TeeResult};
use crate::sandbox::limits::{MemoryLimitExceeded, MemoryLimiter, ResolvedLimits};
use crate::sandbox::request::{ScriptErrorKind, ScriptOutcome, ScriptRequest, ScriptResult};
use crate::telemetry::SCRIPT_LOG_TARGET;
use anyhow::{anyhow, Context};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace_span, warn};
use serde::de::IgnoredAny;
use wasmtime::{Caller, Engine, Extern, ExternType, Linker, Memory, Module, Store, Trap, ValType};

const LOG_MODULE: &str = "env";
const LOG_FUNCTION: &str = "log";
const MEMORY_EXPORT: &str = "memory";
const ALLOC_EXPORT: &str = "alloc";

/// Per-run guest state
struct HostState {
    limiter: MemoryLimiter,
    logs: Vec<String>,
    max_log_entries: usize,
    max_log_line: usize,
    dropped_logs: usize,
}

impl HostState {
    fn push_log(&mut self, bytes: &[u8]) {
        if self.logs.len() >= self.max_log_entries {
            self.dropped_logs += 1;
            return;
        }
        let line = &bytes[..bytes.len().min(self.max_log_line)];
        let line = String::from_utf8_lossy(line).into_owned();
        debug!(target: SCRIPT_LOG_TARGET, "{}", line);
        self.logs.push(line);
    }
}

struct ScriptFailure {
    kind: ScriptErrorKind,
    message: String,
}

impl ScriptFailure {
    fn new(kind: ScriptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Advances the engine epoch on a fixed interval until dropped
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> TeeResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("neo-enclave-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Runs untrusted scripts under memory and time bounds.
///
/// Compiled modules are cached by source hash; every run gets a fresh
/// store and instance, so runs never share guest state.
pub struct ScriptSandbox {
    engine: Engine,
    linker: Linker<HostState>,
    modules: Mutex<LruCache<[u8; 32], Module>>,
    config: SandboxConfig,
    tick: Duration,
    _ticker: EpochTicker,
}

impl ScriptSandbox {
    pub fn new(config: &SandboxConfig) -> TeeResult<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config
            .epoch_interruption(true)
            .cranelift_nan_canonicalization(true);

        let engine = trace_span!("initialize Wasmtime engine")
            .in_scope(|| Engine::new(&wasm_config))
            .context("failed to create execution engine")?;

        let mut linker = trace_span!("setup linker").in_scope(|| Linker::new(&engine));
        trace_span!("link host log")
            .in_scope(|| {
                linker
                    .func_wrap(LOG_MODULE, LOG_FUNCTION, host_log)
                    .map(|_| ())
            })
            .context("failed to link host log function")?;

        let capacity = NonZeroUsize::new(config.module_cache_capacity).ok_or_else(|| {
            TeeError::Config("sandbox.module_cache_capacity must be non-zero".to_string())
        })?;
        let tick = Duration::from_millis(config.epoch_tick_ms.max(1));
        let ticker = EpochTicker::start(engine.clone(), tick)?;

        info!(
            epoch_tick_ms = config.epoch_tick_ms,
            cache = config.module_cache_capacity,
            "script sandbox ready"
        );
        Ok(Self {
            engine,
            linker,
            modules: Mutex::new(LruCache::new(capacity)),
            config: config.clone(),
            tick,
            _ticker: ticker,
        })
    }

    /// Execute `request`.
    ///
    /// Bad request parameters are errors; anything that goes wrong with
    /// the script itself is a failed [`ScriptResult`]. The timeout covers
    /// execution only; compilation happens first and is bounded by
    /// `max_script_size`.
    #[instrument(skip_all, fields(
        entry_point = %request.entry_point,
        script_len = request.script.len(),
        input_len = request.input.len(),
    ))]
    pub fn execute(&self, request: &ScriptRequest) -> TeeResult<ScriptResult> {
        self.validate(request)?;
        let limits = ResolvedLimits::resolve(request, &self.config)?;

        let started = Instant::now();
        let prepared = self.prepare(request);

        let mut store = Store::new(
            &self.engine,
            HostState {
                limiter: MemoryLimiter::new(limits.memory_limit),
                logs: Vec::new(),
                max_log_entries: self.config.max_log_entries,
                max_log_line: self.config.max_log_line,
                dropped_logs: 0,
            },
        );
        store.limiter(|state| &mut state.limiter);
        store.set_epoch_deadline(limits.deadline_ticks(self.tick));
        store.epoch_deadline_trap();

        let outcome = match prepared.and_then(|module| self.run(&mut store, &module, request)) {
            Ok(output) => ScriptOutcome::Success { output },
            Err(failure) => ScriptOutcome::Failure {
                kind: failure.kind,
                message: failure.message,
            },
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let state = store.into_data();
        if state.dropped_logs > 0 {
            warn!(dropped = state.dropped_logs, "script log lines dropped");
        }

        let result = ScriptResult {
            outcome,
            memory_used: state.limiter.peak() as u64,
            duration_ms,
            logs: state.logs,
        };
        debug!(
            success = result.success(),
            memory_used = result.memory_used,
            duration_ms,
            "script finished"
        );
        Ok(result)
    }

    /// Number of compiled modules currently cached
    pub fn cached_modules(&self) -> usize {
        self.modules.lock().len()
    }

    fn validate(&self, request: &ScriptRequest) -> TeeResult<()> {
        if request.entry_point.is_empty() {
            return Err(TeeError::InvalidParameter(
                "entry point must not be empty".to_string(),
            ));
        }
        if request.script.is_empty() || request.script.len() > self.config.max_script_size {
            return Err(TeeError::InvalidParameter(format!(
                "script must be 1..={} bytes, got {}",
                self.config.max_script_size,
                request.script.len()
            )));
        }
        if request.input.len() > self.config.max_input_size {
            return Err(TeeError::InvalidParameter(format!(
                "input must be at most {} bytes, got {}",
                self.config.max_input_size,
                request.input.len()
            )));
        }
        Ok(())
    }

    /// Check the input and compile the script, before any deadline runs
    fn prepare(&self, request: &ScriptRequest) -> Result<Module, ScriptFailure> {
        serde_json::from_slice::<IgnoredAny>(&request.input).map_err(|e| {
            ScriptFailure::new(ScriptErrorKind::InvalidInput, format!("input is not JSON: {}", e))
        })?;
        self.compile(&request.script)
    }

    fn run(
        &self,
        store: &mut Store<HostState>,
        module: &Module,
        request: &ScriptRequest,
    ) -> Result<Vec<u8>, ScriptFailure> {
        let input_len = i32::try_from(request.input.len()).map_err(|_| {
            ScriptFailure::new(ScriptErrorKind::InvalidInput, "input too large for guest")
        })?;

        let instance = trace_span!("instantiate script")
            .in_scope(|| self.linker.instantiate(&mut *store, module))
            .map_err(|e| classify(e, store, "failed to instantiate script"))?;

        let memory = instance
            .get_memory(&mut *store, MEMORY_EXPORT)
            .ok_or_else(|| missing_export(MEMORY_EXPORT, "memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, ALLOC_EXPORT)
            .map_err(|_| missing_export(ALLOC_EXPORT, "func(i32) -> i32"))?;
        let entry = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, &request.entry_point)
            .map_err(|_| missing_export(&request.entry_point, "func(i32, i32) -> i64"))?;

        let input_ptr = alloc
            .call(&mut *store, input_len)
            .map_err(|e| classify(e, store, "alloc failed"))?;
        let offset = usize::try_from(input_ptr).map_err(|_| {
            ScriptFailure::new(ScriptErrorKind::Trap, "alloc returned a negative pointer")
        })?;
        memory
            .write(&mut *store, offset, &request.input)
            .map_err(|_| {
                ScriptFailure::new(ScriptErrorKind::Trap, "alloc returned an out-of-bounds region")
            })?;

        let packed = trace_span!("execute entry point")
            .in_scope(|| entry.call(&mut *store, (input_ptr, input_len)))
            .map_err(|e| classify(e, store, "script execution failed"))?;

        read_output(store, memory, packed, self.config.max_output_size)
    }

    fn compile(&self, script: &[u8]) -> Result<Module, ScriptFailure> {
        let key = hash(script);
        if let Some(module) = self.modules.lock().get(&key) {
            return Ok(module.clone());
        }

        let module = trace_span!("compile script")
            .in_scope(|| Module::new(&self.engine, script))
            .map_err(|e| {
                ScriptFailure::new(
                    ScriptErrorKind::InvalidScript,
                    format!("failed to compile script: {:#}", e),
                )
            })?;

        for import in module.imports() {
            if (import.module(), import.name()) != (LOG_MODULE, LOG_FUNCTION) {
                return Err(ScriptFailure::new(
                    ScriptErrorKind::InvalidScript,
                    format!(
                        "unsupported import {}.{}",
                        import.module(),
                        import.name()
                    ),
                ));
            }
            if !is_log_signature(&import.ty()) {
                return Err(ScriptFailure::new(
                    ScriptErrorKind::InvalidScript,
                    format!(
                        "import {}.{} must be func(i32, i32)",
                        LOG_MODULE, LOG_FUNCTION
                    ),
                ));
            }
        }

        self.modules.lock().put(key, module.clone());
        Ok(module)
    }
}

/// `env.log` takes `(ptr: i32, len: i32)` and returns nothing
fn is_log_signature(ty: &ExternType) -> bool {
    match ty {
        ExternType::Func(func) => {
            func.params().len() == 2
                && func.params().all(|param| matches!(param, ValType::I32))
                && func.results().len() == 0
        }
        _ => false,
    }
}

fn host_log(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<()> {
    let memory = caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("log called without an exported memory"))?;

    let start = usize::try_from(ptr).context("negative log pointer")?;
    let len = usize::try_from(len).context("negative log length")?;
    let (data, state) = memory.data_and_store_mut(&mut caller);
    let bytes = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| anyhow!("log region out of bounds"))?;

    state.push_log(bytes);
    Ok(())
}

/// Copy out the JSON output. Validation walks the guest bytes in place
/// without building a document, so host memory stays bounded by
/// `max_output_size`.
fn read_output(
    store: &Store<HostState>,
    memory: Memory,
    packed: i64,
    max_output_size: usize,
) -> Result<Vec<u8>, ScriptFailure> {
    let packed = packed as u64;
    let out_ptr = (packed >> 32) as usize;
    let out_len = (packed & 0xffff_ffff) as usize;

    if out_len > max_output_size {
        return Err(ScriptFailure::new(
            ScriptErrorKind::InvalidOutput,
            format!(
                "output is {} bytes, maximum is {}",
                out_len, max_output_size
            ),
        ));
    }

    let output = out_ptr
        .checked_add(out_len)
        .and_then(|end| memory.data(store).get(out_ptr..end))
        .ok_or_else(|| {
            ScriptFailure::new(
                ScriptErrorKind::InvalidOutput,
                format!("output region {}+{} out of bounds", out_ptr, out_len),
            )
        })?;

    serde_json::from_slice::<IgnoredAny>(output).map_err(|e| {
        ScriptFailure::new(
            ScriptErrorKind::InvalidOutput,
            format!("output is not JSON: {}", e),
        )
    })?;
    Ok(output.to_vec())
}

fn missing_export(name: &str, expected: &str) -> ScriptFailure {
    ScriptFailure::new(
        ScriptErrorKind::MissingExport,
        format!("script must export `{}` as {}", name, expected),
    )
}

fn classify(err: anyhow::Error, store: &Store<HostState>, context: &str) -> ScriptFailure {
    if store.data().limiter.exceeded() || err.downcast_ref::<MemoryLimitExceeded>().is_some() {
        return ScriptFailure::new(ScriptErrorKind::MemoryLimitExceeded, format!("{:#}", err));
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => ScriptFailure::new(
            ScriptErrorKind::Timeout,
            "script exceeded its timeout and was interrupted",
        ),
        _ => ScriptFailure::new(ScriptErrorKind::Trap, format!("{}: {:#}", context, err)),
    }
}
