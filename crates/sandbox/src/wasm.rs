//! WASM executor for bytecode plugins.
//!
//! Runs plugin modules under wasmtime with fuel and memory limits derived
//! from the isolation level. The guest ABI is JSON over linear memory:
//!
//! - guest exports: `memory`, `dplug_alloc(len) -> ptr`,
//!   `dplug_load(ptr, len) -> packed`, `dplug_call(ptr, len) -> packed`
//! - host imports (module `"dplug"`): `host_call(ptr, len) -> packed`,
//!   `host_log(level, ptr, len)`
//!
//! `packed` is an `i64` with the pointer in the high 32 bits and the length
//! in the low 32; zero signals failure. `dplug_load` receives the context
//! snapshot and returns the exported method names; `dplug_call` receives a
//! `{"kind": "call" | "hook" | "event", ...}` envelope and returns
//! `{"ok": value}` or `{"err": message}`.
//!
//! Mediated `host_call`s block the executor task while the host round-trip
//! completes, so this executor requires the multi-threaded tokio runtime.

use async_trait::async_trait;
use serde_json::{json, Value};
use wasmtime::{Caller, Config, Engine, Linker, Memory, Store, StoreLimits, StoreLimitsBuilder, TypedFunc};

use dplug_protocol::{ContextSnapshot, HookName, HostCall, LogLevel, PluginCode};

use crate::executor::{ExecError, HostBridge, PluginExecutor};
use crate::IsolationLevel;

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// Per-call fuel and memory budgets for an isolation level.
#[derive(Debug, Clone, Copy)]
struct ResourceBudget {
    fuel: u64,
    memory_bytes: usize,
}

impl ResourceBudget {
    fn for_level(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::None => Self {
                fuel: u64::MAX,
                memory_bytes: 256 * 1024 * 1024,
            },
            IsolationLevel::Basic => Self {
                fuel: 500_000_000,
                memory_bytes: 64 * 1024 * 1024,
            },
            IsolationLevel::Strict => Self {
                fuel: 50_000_000,
                memory_bytes: 16 * 1024 * 1024,
            },
        }
    }
}

struct GuestState {
    limits: StoreLimits,
    bridge: HostBridge,
    plugin_id: String,
}

struct LoadedModule {
    store: Store<GuestState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    call: TypedFunc<(i32, i32), i64>,
}

/// wasmtime-backed [`PluginExecutor`].
pub struct WasmExecutor {
    budget: ResourceBudget,
    loaded: Option<LoadedModule>,
}

impl WasmExecutor {
    #[must_use]
    pub fn new(level: IsolationLevel) -> Self {
        Self {
            budget: ResourceBudget::for_level(level),
            loaded: None,
        }
    }

    fn instantiate(
        &self,
        bytes: &[u8],
        context: &ContextSnapshot,
        host: &HostBridge,
    ) -> Result<(LoadedModule, Vec<String>), ExecError> {
        if bytes.len() < 4 || bytes[0..4] != WASM_MAGIC {
            return Err(ExecError::UnsupportedCode);
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(wasm_err)?;
        let module = wasmtime::Module::new(&engine, bytes).map_err(wasm_err)?;

        let state = GuestState {
            limits: StoreLimitsBuilder::new()
                .memory_size(self.budget.memory_bytes)
                .build(),
            bridge: host.clone(),
            plugin_id: context.plugin_id.clone(),
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limits);
        store.set_fuel(self.budget.fuel).map_err(wasm_err)?;

        let mut linker: Linker<GuestState> = Linker::new(&engine);
        linker
            .func_wrap(
                "dplug",
                "host_call",
                |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i64 {
                    let payload = match read_guest(&mut caller, ptr, len) {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            tracing::error!(plugin = %caller.data().plugin_id, %error, "bad host_call payload");
                            return 0;
                        }
                    };
                    let call: HostCall = match serde_json::from_slice(&payload) {
                        Ok(call) => call,
                        Err(error) => {
                            tracing::error!(plugin = %caller.data().plugin_id, %error, "malformed host call");
                            return 0;
                        }
                    };
                    let bridge = caller.data().bridge.clone();
                    let outcome = tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(bridge.call(call))
                    });
                    let reply = match outcome {
                        Ok(value) => json!({ "ok": value }),
                        Err(message) => json!({ "err": message }),
                    };
                    match write_guest(&mut caller, &reply) {
                        Ok(packed) => packed,
                        Err(error) => {
                            tracing::error!(plugin = %caller.data().plugin_id, %error, "failed to write host reply");
                            0
                        }
                    }
                },
            )
            .map_err(wasm_err)?;
        linker
            .func_wrap(
                "dplug",
                "host_log",
                |mut caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32| {
                    let Ok(payload) = read_guest(&mut caller, ptr, len) else {
                        return;
                    };
                    let message = String::from_utf8_lossy(&payload).into_owned();
                    let level = match level {
                        0 => LogLevel::Debug,
                        1 => LogLevel::Info,
                        2 => LogLevel::Warn,
                        _ => LogLevel::Error,
                    };
                    let bridge = caller.data().bridge.clone();
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(bridge.log(level, message))
                    });
                },
            )
            .map_err(wasm_err)?;

        let instance = linker.instantiate(&mut store, &module).map_err(wasm_err)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ExecError::Failed("module exports no memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "dplug_alloc")
            .map_err(wasm_err)?;
        let load = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "dplug_load")
            .map_err(wasm_err)?;
        let call = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "dplug_call")
            .map_err(wasm_err)?;

        let mut loaded = LoadedModule {
            store,
            memory,
            alloc,
            call,
        };
        let context_value =
            serde_json::to_value(context).map_err(|e| ExecError::Failed(e.to_string()))?;
        let packed = {
            let (ptr, len) = loaded.write_payload(&context_value)?;
            load.call(&mut loaded.store, (ptr, len)).map_err(wasm_err)?
        };
        let exports: Vec<String> = loaded.read_packed(packed)?;
        Ok((loaded, exports))
    }
}

impl LoadedModule {
    fn write_payload(&mut self, value: &Value) -> Result<(i32, i32), ExecError> {
        let bytes = serde_json::to_vec(value).map_err(|e| ExecError::Failed(e.to_string()))?;
        let len = i32::try_from(bytes.len())
            .map_err(|_| ExecError::Failed("payload too large for guest".to_string()))?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(wasm_err)?;
        self.memory
            .write(&mut self.store, ptr as usize, &bytes)
            .map_err(|e| ExecError::Failed(e.to_string()))?;
        Ok((ptr, len))
    }

    fn read_packed<T: serde::de::DeserializeOwned>(&mut self, packed: i64) -> Result<T, ExecError> {
        if packed == 0 {
            return Err(ExecError::Failed("guest returned no payload".to_string()));
        }
        let ptr = (packed >> 32) as usize;
        let len = (packed & 0xffff_ffff) as usize;
        let mut bytes = vec![0u8; len];
        self.memory
            .read(&self.store, ptr, &mut bytes)
            .map_err(|e| ExecError::Failed(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ExecError::Failed(format!("malformed guest payload: {e}")))
    }

    fn dispatch(&mut self, envelope: &Value, fuel: u64) -> Result<Value, ExecError> {
        // Fresh fuel budget per invocation.
        self.store.set_fuel(fuel).map_err(wasm_err)?;
        let (ptr, len) = self.write_payload(envelope)?;
        let packed = self
            .call
            .call(&mut self.store, (ptr, len))
            .map_err(wasm_err)?;
        let reply: Value = self.read_packed(packed)?;
        if let Some(err) = reply.get("err").and_then(Value::as_str) {
            return Err(ExecError::Failed(err.to_string()));
        }
        Ok(reply.get("ok").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PluginExecutor for WasmExecutor {
    async fn load(
        &mut self,
        code: &PluginCode,
        context: &ContextSnapshot,
        host: &HostBridge,
    ) -> Result<Vec<String>, ExecError> {
        let PluginCode::Bytes(bytes) = code else {
            return Err(ExecError::UnsupportedCode);
        };
        let (loaded, exports) = self.instantiate(bytes, context, host)?;
        self.loaded = Some(loaded);
        Ok(exports)
    }

    async fn invoke(
        &mut self,
        method: &str,
        args: &[Value],
        _host: &HostBridge,
    ) -> Result<Value, ExecError> {
        let fuel = self.budget.fuel;
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| ExecError::Failed("no module loaded".to_string()))?;
        loaded.dispatch(&json!({ "kind": "call", "method": method, "args": args }), fuel)
    }

    async fn hook(
        &mut self,
        hook: HookName,
        data: &Value,
        _host: &HostBridge,
    ) -> Result<Value, ExecError> {
        let fuel = self.budget.fuel;
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| ExecError::Failed("no module loaded".to_string()))?;
        loaded.dispatch(&json!({ "kind": "hook", "hook": hook.as_str(), "data": data }), fuel)
    }

    async fn on_event(&mut self, name: &str, payload: &Value, _host: &HostBridge) {
        let fuel = self.budget.fuel;
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };
        // Broadcasts carry no acknowledgement; a failing handler is logged
        // and dropped.
        if let Err(error) =
            loaded.dispatch(&json!({ "kind": "event", "name": name, "payload": payload }), fuel)
        {
            tracing::debug!(event = %name, %error, "event handler failed");
        }
    }
}

fn read_guest(
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, String> {
    let memory = caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
        .ok_or_else(|| "module exports no memory".to_string())?;
    let mut bytes = vec![0u8; len as usize];
    memory
        .read(&*caller, ptr as usize, &mut bytes)
        .map_err(|e| e.to_string())?;
    Ok(bytes)
}

fn write_guest(caller: &mut Caller<'_, GuestState>, value: &Value) -> Result<i64, String> {
    let memory = caller
        .get_export("memory")
        .and_then(wasmtime::Extern::into_memory)
        .ok_or_else(|| "module exports no memory".to_string())?;
    let alloc = caller
        .get_export("dplug_alloc")
        .and_then(wasmtime::Extern::into_func)
        .ok_or_else(|| "module exports no dplug_alloc".to_string())?
        .typed::<i32, i32>(&*caller)
        .map_err(|e| e.to_string())?;

    let bytes = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    let len = i32::try_from(bytes.len()).map_err(|_| "payload too large".to_string())?;
    let ptr = alloc.call(&mut *caller, len).map_err(|e| e.to_string())?;
    memory
        .write(&mut *caller, ptr as usize, &bytes)
        .map_err(|e| e.to_string())?;
    Ok((i64::from(ptr) << 32) | i64::from(len))
}

fn wasm_err(error: wasmtime::Error) -> ExecError {
    ExecError::Failed(error.to_string())
}
