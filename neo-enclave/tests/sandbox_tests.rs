//! Script sandbox tests for neo-enclave
//!
//! Resource bounds are enforced inside the sandbox: runaway loops are
//! interrupted and memory growth past the limit fails the script.

use neo_enclave::sandbox::ScriptErrorKind;
use neo_enclave::{Enclave, EnclaveConfig, ScriptRequest, TeeError};
use std::io::Write;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const MIB: u64 = 1024 * 1024;

const INFINITE_LOOP: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "run") (param i32 i32) (result i64)
        (loop $forever (br $forever))
        (i64.const 0)))
"#;

const MEMORY_HOG: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "run") (param i32 i32) (result i64)
        (drop (memory.grow (i32.const 1000)))
        (i64.const 0)))
"#;

const SMALL_GROWTH: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "run") (param i32 i32) (result i64)
        (drop (memory.grow (i32.const 3)))
        (i64.or (i64.shl (i64.const 16) (i64.const 32)) (i64.const 11)))
      (data (i32.const 16) "{\"ok\":true}"))
"#;

const NOT_JSON: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "run") (param i32 i32) (result i64)
        (i64.or (i64.shl (i64.const 16) (i64.const 32)) (i64.const 8)))
      (data (i32.const 16) "not json"))
"#;

const REVERSE: &str = r#"
    (module
      (import "env" "log" (func $log (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "run") (param $ptr i32) (param $len i32) (result i64)
        (local $i i32)
        (call $log (i32.const 0) (i32.const 9))
        ;; copy the input back to front into 4096..
        (block $done
          (loop $copy
            (br_if $done (i32.ge_u (local.get $i) (local.get $len)))
            (i32.store8
              (i32.add (i32.const 4096) (local.get $i))
              (i32.load8_u
                (i32.sub
                  (i32.add (local.get $ptr) (local.get $len))
                  (i32.add (local.get $i) (i32.const 1)))))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br $copy)))
        (i64.or (i64.shl (i64.const 4096) (i64.const 32)) (i64.extend_i32_u (local.get $len))))
      (data (i32.const 0) "reversing"))
"#;

// Returns "[0,0,...,0]" with a million elements, 2_000_001 bytes.
const LARGE_ARRAY: &str = r#"
    (module
      (memory (export "memory") 40)
      (func (export "alloc") (param i32) (result i32) (i32.const 0))
      (func (export "run") (param i32 i32) (result i64)
        (local $k i32)
        (i32.store8 (i32.const 0) (i32.const 91))
        (block $done
          (loop $fill
            (br_if $done (i32.ge_u (local.get $k) (i32.const 1000000)))
            (i32.store8
              (i32.add (i32.const 1) (i32.shl (local.get $k) (i32.const 1)))
              (i32.const 48))
            (i32.store8
              (i32.add (i32.const 2) (i32.shl (local.get $k) (i32.const 1)))
              (i32.const 44))
            (local.set $k (i32.add (local.get $k) (i32.const 1)))
            (br $fill)))
        ;; closing bracket replaces the trailing comma
        (i32.store8 (i32.const 2000000) (i32.const 93))
        (i64.const 2000001)))
"#;

fn enclave() -> (Enclave, NamedTempFile) {
    enclave_with(EnclaveConfig::default())
}

fn enclave_with(config: EnclaveConfig) -> (Enclave, NamedTempFile) {
    let mut image = NamedTempFile::new().unwrap();
    image.write_all(b"sandbox image").unwrap();
    let enclave = Enclave::new(config).unwrap();
    enclave.init(image.path(), false).unwrap();
    (enclave, image)
}

#[test]
fn test_infinite_loop_is_interrupted() {
    let (enclave, _image) = enclave();
    let request = ScriptRequest::new(INFINITE_LOOP, "run", "{}").with_timeout_ms(200);

    let started = Instant::now();
    let result = enclave.execute_script(&request).unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success());
    assert_eq!(result.error_kind(), Some(ScriptErrorKind::Timeout));
    assert!(result.output().is_none());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert!(result.duration_ms >= 200);
}

#[test]
fn test_memory_limit_is_enforced() {
    let (enclave, _image) = enclave();
    let request = ScriptRequest::new(MEMORY_HOG, "run", "{}").with_memory_limit(MIB);

    let result = enclave.execute_script(&request).unwrap();
    assert!(!result.success());
    assert_eq!(result.error_kind(), Some(ScriptErrorKind::MemoryLimitExceeded));
    assert!(result.memory_used <= MIB);
}

#[test]
fn test_memory_usage_reported() {
    let (enclave, _image) = enclave();
    let request = ScriptRequest::new(SMALL_GROWTH, "run", "{}").with_memory_limit(MIB);

    let result = enclave.execute_script(&request).unwrap();
    assert!(result.success(), "{:?}", result.error());
    assert_eq!(result.output(), Some(&br#"{"ok":true}"#[..]));
    assert_eq!(result.memory_used, 4 * 65536);
}

#[test]
fn test_invalid_output_is_failure() {
    let (enclave, _image) = enclave();
    let result = enclave
        .execute_script(&ScriptRequest::new(NOT_JSON, "run", "{}"))
        .unwrap();
    assert_eq!(result.error_kind(), Some(ScriptErrorKind::InvalidOutput));
    assert!(result.output().is_none());
}

#[test]
fn test_repeated_runs_are_deterministic() {
    let (enclave, _image) = enclave();
    let request = ScriptRequest::new(REVERSE, "run", r#""abc""#);

    let first = enclave.execute_script(&request).unwrap();
    let second = enclave.execute_script(&request).unwrap();
    assert!(first.success(), "{:?}", first.error());
    assert_eq!(first.output(), Some(&br#""cba""#[..]));
    assert_eq!(first.output(), second.output());
    assert_eq!(first.logs, vec!["reversing".to_string()]);
    assert_eq!(first.logs, second.logs);
}

#[test]
fn test_limits_above_maximum_are_rejected() {
    let (enclave, _image) = enclave();
    let request = ScriptRequest::new(INFINITE_LOOP, "run", "{}").with_memory_limit(513 * MIB);
    assert!(matches!(
        enclave.execute_script(&request),
        Err(TeeError::InvalidParameter(_))
    ));
}

#[test]
fn test_scripts_require_live_enclave() {
    let enclave = Enclave::new(EnclaveConfig::default()).unwrap();
    assert!(matches!(
        enclave.execute_script(&ScriptRequest::new(INFINITE_LOOP, "run", "{}")),
        Err(TeeError::EnclaveNotInitialized)
    ));
}

#[test]
fn test_output_size_is_bounded() {
    let request = ScriptRequest::new(LARGE_ARRAY, "run", "{}").with_memory_limit(4 * MIB);

    // Default limit is 1 MiB, so the 2 MB array is refused before it is
    // copied out of the guest.
    let (enclave, _image) = enclave();
    let result = enclave.execute_script(&request).unwrap();
    assert_eq!(result.error_kind(), Some(ScriptErrorKind::InvalidOutput));
    assert!(result.output().is_none());
    assert!(result.memory_used <= 4 * MIB);

    let mut config = EnclaveConfig::default();
    config.sandbox.max_output_size = 4 * MIB as usize;
    let (enclave, _image) = enclave_with(config);
    let result = enclave.execute_script(&request).unwrap();
    assert!(result.success(), "{:?}", result.error());
    let output = result.output().unwrap();
    assert_eq!(output.len(), 2_000_001);
    assert!(output.starts_with(b"[0,0,"));
    assert!(output.ends_with(b",0]"));
}
