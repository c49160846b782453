//! Sandbox for tenant-authored transformation code.
//!
//! Scripts are WebAssembly modules (text or base64 binary). Each run gets a
//! fresh [`Store`] with its own fuel budget, memory cap and epoch deadline. The
//! only host functions are the three in the `host` namespace that read the
//! JSON input and write the JSON output; there is no file, network or process
//! access.

use std::time::Duration;

use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wasmtime::{Caller, Config, Engine, Extern, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};

const EPOCH_TICK: Duration = Duration::from_millis(100);
const MODULE_CACHE_LIMIT: usize = 256;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script does not compile: {0}")]
    Compile(String),
    #[error("script has no '{0}' export")]
    MissingExport(String),
    #[error("script exceeded its fuel budget")]
    FuelExhausted,
    #[error("script exceeded its time budget")]
    Timeout,
    #[error("script trapped: {0}")]
    Trap(String),
    #[error("script output is not JSON: {0}")]
    InvalidOutput(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    pub fuel: u64,
    pub timeout: Duration,
    pub memory_bytes: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            fuel: 10_000_000,
            timeout: Duration::from_secs(2),
            memory_bytes: 16 * 1024 * 1024,
        }
    }
}

struct ScriptState {
    input_json: String,
    output_json: Option<String>,
    limits: StoreLimits,
}

pub struct ScriptSandbox {
    engine: Engine,
    limits: ScriptLimits,
    modules: DashMap<String, Module>,
    ticker: JoinHandle<()>,
}

impl ScriptSandbox {
    /// Must be called inside a Tokio runtime; the epoch ticker runs as a task.
    pub fn new(limits: ScriptLimits) -> Result<Self, ScriptError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| ScriptError::Compile(e.to_string()))?;

        let ticking = engine.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            loop {
                interval.tick().await;
                ticking.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            limits,
            modules: DashMap::new(),
            ticker,
        })
    }

    /// Runs `function` (default `run`) of the module in `code` with `input`
    /// and returns the captured output value.
    pub async fn run(&self, code: &str, function: Option<&str>, input: &Value) -> Result<Value, ScriptError> {
        let module = self.module(code)?;
        let export = function
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or("run")
            .to_string();

        let state = ScriptState {
            input_json: input.to_string(),
            output_json: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(self.limits.memory_bytes)
                .instances(1)
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|s| &mut s.limits);
        store
            .set_fuel(self.limits.fuel)
            .map_err(|e| ScriptError::Trap(e.to_string()))?;
        store.epoch_deadline_trap();
        let ticks = (self.limits.timeout.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64;
        store.set_epoch_deadline(ticks);

        let mut linker = Linker::new(&self.engine);
        define_host_functions(&mut linker).map_err(|e| ScriptError::Compile(e.to_string()))?;

        let call = tokio::task::spawn_blocking(move || {
            let instance = linker.instantiate(&mut store, &module)?;
            let func = instance
                .get_typed_func::<(), ()>(&mut store, &export)
                .map_err(|_| anyhow!("missing export '{export}'"))?;
            func.call(&mut store, ())?;
            Ok::<Option<String>, anyhow::Error>(store.into_data().output_json)
        });

        // Outer guard in case the guest sits in a host call past its deadline.
        let joined = tokio::time::timeout(self.limits.timeout + EPOCH_TICK * 5, call)
            .await
            .map_err(|_| ScriptError::Timeout)?
            .map_err(|e| ScriptError::Trap(format!("script task failed: {e}")))?;

        let output = joined.map_err(classify)?;
        parse_output(output)
    }

    fn module(&self, code: &str) -> Result<Module, ScriptError> {
        if let Some(module) = self.modules.get(code) {
            return Ok(module.clone());
        }
        let trimmed = code.trim();
        let bytes = if trimmed.starts_with('(') {
            trimmed.as_bytes().to_vec()
        } else {
            STANDARD
                .decode(trimmed)
                .map_err(|e| ScriptError::Compile(format!("code is neither WAT nor base64 wasm: {e}")))?
        };
        let module = Module::new(&self.engine, &bytes).map_err(|e| ScriptError::Compile(format!("{e:#}")))?;

        if self.modules.len() >= MODULE_CACHE_LIMIT {
            self.modules.clear();
        }
        self.modules.insert(code.to_string(), module.clone());
        debug!(cached = self.modules.len(), "Compiled script module");
        Ok(module)
    }
}

impl Drop for ScriptSandbox {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

fn classify(e: anyhow::Error) -> ScriptError {
    let message = format!("{e:#}");
    if let Some(trap) = e.downcast_ref::<wasmtime::Trap>() {
        match trap {
            wasmtime::Trap::OutOfFuel => return ScriptError::FuelExhausted,
            wasmtime::Trap::Interrupt => return ScriptError::Timeout,
            _ => {}
        }
    }
    if message.contains("missing export") {
        let name = message.split('\'').nth(1).unwrap_or("run").to_string();
        return ScriptError::MissingExport(name);
    }
    if message.contains("all fuel consumed") {
        ScriptError::FuelExhausted
    } else if message.contains("interrupt") {
        ScriptError::Timeout
    } else {
        ScriptError::Trap(message)
    }
}

/// A JSON object with an `output` key yields that value; any other document is
/// the output itself. No output at all is `null`.
fn parse_output(raw: Option<String>) -> Result<Value, ScriptError> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| ScriptError::InvalidOutput(e.to_string()))?;
    Ok(match value {
        Value::Object(mut map) if map.contains_key("output") => map.remove("output").unwrap_or(Value::Null),
        other => other,
    })
}

fn define_host_functions(linker: &mut Linker<ScriptState>) -> anyhow::Result<()> {
    linker.func_wrap("host", "get_input_len", |caller: Caller<'_, ScriptState>| -> i32 {
        caller.data().input_json.len() as i32
    })?;

    linker.func_wrap(
        "host",
        "get_input",
        |mut caller: Caller<'_, ScriptState>, ptr: i32| -> Result<(), wasmtime::Error> {
            let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                return Err(anyhow!("script exports no memory").into());
            };
            let input = caller.data().input_json.clone();
            memory
                .write(&mut caller, ptr as usize, input.as_bytes())
                .map_err(|e| anyhow!("input does not fit in script memory: {e}"))?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "host",
        "set_output",
        |mut caller: Caller<'_, ScriptState>, ptr: i32, len: i32| -> Result<(), wasmtime::Error> {
            let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                return Err(anyhow!("script exports no memory").into());
            };
            let (start, len) = (ptr as usize, len as usize);
            let bytes = memory
                .data(&caller)
                .get(start..start.saturating_add(len))
                .ok_or_else(|| anyhow!("output range out of bounds"))?
                .to_vec();
            match String::from_utf8(bytes) {
                Ok(s) => caller.data_mut().output_json = Some(s),
                Err(e) => warn!(error = %e, "Script output is not UTF-8, ignoring"),
            }
            Ok(())
        },
    )?;

    Ok(())
}
