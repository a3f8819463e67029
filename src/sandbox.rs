//! Sandbox controller
//!
//! Owns the engine instance and ties the quota, gating, and output
//! subsystems together. Each sandbox is single-threaded: the thread that
//! created it is the only one allowed to touch its engine, buffers, and
//! counters. Guest-visible closures (`output`, `require`, `write`) capture a
//! shared handle to the sandbox interior, so multiple sandboxes in one
//! process stay fully isolated.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::{HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value, VmState};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{guest_message, Result, SandboxError};
use crate::library::{self, LibraryLoader, LibraryRegistry};
use crate::output::OutputBuffer;
use crate::require;
use crate::serialize::{self, SerializeError};
use crate::usage::{UsageStat, UsageTracker, UsageType};

/// Bytecode instructions between firings of the instruction hook. A runaway
/// loop executes at most this many instructions past its ceiling.
const INSTRUCTION_QUANTUM: u32 = 1000;

/// Ceiling for the recorded error message, truncated on a UTF-8 boundary.
const ERROR_MESSAGE_SIZE: usize = 255;

/// Guest entry point called by `invoke`.
const ENTRY_POINT: &str = "process";

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, no guest code run yet
    Uninitialized,
    /// Script loaded; `invoke` is accepted
    Running,
    /// Engine released; counters frozen. Absorbing.
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Uninitialized => "uninitialized",
            State::Running => "running",
            State::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Sandbox interior shared with the guest-visible closures
pub(crate) struct Shared {
    pub output: OutputBuffer,
    pub usage: UsageTracker,
    pub error_message: Option<String>,
    pub module_path: Option<PathBuf>,
    pub registry: LibraryRegistry,
}

impl Shared {
    /// Record a message into the bounded error slot.
    pub fn record_error(&mut self, msg: &str) {
        let mut end = msg.len().min(ERROR_MESSAGE_SIZE);
        while end > 0 && !msg.is_char_boundary(end) {
            end -= 1;
        }
        self.error_message = Some(msg[..end].to_string());
    }

    fn sync_output_stats(&mut self) {
        let pos = self.output.pos() as u64;
        self.usage.set_current(UsageType::Output, pos);
    }
}

/// An isolated guest execution context with enforced quotas
pub struct Sandbox {
    lua: Option<Lua>,
    state: State,
    shared: Rc<RefCell<Shared>>,
    /// Instructions executed since the last reset, quantized to the hook
    /// interval. Shared with the engine hook.
    instructions: Rc<Cell<u64>>,
    config: SandboxConfig,
}

impl Sandbox {
    /// Build an engine with the interposers attached. No guest code runs.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let setup = |e: mlua::Error| SandboxError::Setup(e.to_string());

        let lua = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(setup)?;

        let mut usage = UsageTracker::new();
        usage.set_limit(UsageType::Memory, config.memory_limit);
        usage.set_limit(UsageType::Instructions, config.instruction_limit);
        usage.set_limit(UsageType::Output, config.output_limit);

        let shared = Rc::new(RefCell::new(Shared {
            output: OutputBuffer::new(config.output_limit as usize),
            usage,
            error_message: None,
            module_path: config.module_path.clone(),
            registry: LibraryRegistry::with_builtins(),
        }));
        let instructions = Rc::new(Cell::new(0u64));

        // The engine owns its allocator; configuring the ceiling reuses its
        // charge-before-allocate refusal and native OOM unwind. Engines that
        // cannot enforce it leave the limit advisory.
        if config.memory_limit != 0 {
            if let Err(e) = lua.set_memory_limit(config.memory_limit as usize) {
                warn!(error = %e, "engine cannot enforce a memory limit; ceiling is advisory");
            }
        }

        {
            let count = instructions.clone();
            let limit = config.instruction_limit;
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(INSTRUCTION_QUANTUM),
                move |_lua, _debug| {
                    let used = count.get() + u64::from(INSTRUCTION_QUANTUM);
                    count.set(used);
                    if limit != 0 && used > limit {
                        return Err(mlua::Error::RuntimeError(
                            "instruction_limit exceeded".to_string(),
                        ));
                    }
                    Ok(VmState::Continue)
                },
            );
        }

        library::strip_globals(&lua.globals(), library::DENIED_BASE_GLOBALS).map_err(setup)?;

        // Fabricated module cache; the engine's own package machinery is
        // never loaded.
        let package = lua.create_table().map_err(setup)?;
        package.set("loaded", lua.create_table().map_err(setup)?).map_err(setup)?;
        lua.globals().set("package", package).map_err(setup)?;

        install_output(&lua, &shared).map_err(setup)?;
        require::install(&lua, &shared).map_err(setup)?;
        install_write(&lua).map_err(setup)?;

        debug!(
            memory_limit = config.memory_limit,
            instruction_limit = config.instruction_limit,
            output_limit = config.output_limit,
            "sandbox created"
        );
        Ok(Sandbox {
            lua: Some(lua),
            state: State::Uninitialized,
            shared,
            instructions,
            config,
        })
    }

    /// Load and run the guest source under all three limits.
    pub fn init(&mut self, source: &str) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(SandboxError::InvalidState { operation: "init", state: self.state });
        }
        self.shared.borrow_mut().error_message = None;
        self.instructions.set(0);

        let result = match &self.lua {
            Some(lua) => lua.load(source).set_name("=sandbox").exec(),
            None => unreachable!("engine released only in terminated state"),
        };
        self.sample_usage();

        match result {
            Ok(()) => {
                self.state = State::Running;
                debug!("sandbox initialized");
                Ok(())
            }
            Err(e) => {
                self.fail(&guest_message(&e));
                Err(e.into())
            }
        }
    }

    /// Call the guest entry point with one integer argument and collect its
    /// integer status. A guest error terminates the sandbox.
    pub fn invoke(&mut self, arg: i64) -> Result<i64> {
        if self.state != State::Running {
            return Err(SandboxError::InvalidState { operation: "invoke", state: self.state });
        }
        self.shared.borrow_mut().error_message = None;
        self.instructions.set(0);

        let call = match &self.lua {
            Some(lua) => match lua.globals().get::<mlua::Function>(ENTRY_POINT) {
                Ok(f) => Some(f.call::<Value>(arg)),
                Err(_) => None,
            },
            None => unreachable!("engine released only in terminated state"),
        };
        self.sample_usage();

        let result = match call {
            Some(r) => r,
            None => {
                let msg = "process() function was not found";
                self.fail(msg);
                return Err(SandboxError::EntryPoint(msg.to_string()));
            }
        };
        match result {
            Ok(Value::Integer(status)) => Ok(status),
            Ok(Value::Number(n)) if n.fract() == 0.0 => Ok(n as i64),
            Ok(_) => {
                let msg = "process() must return a numeric status";
                self.fail(msg);
                Err(SandboxError::EntryPoint(msg.to_string()))
            }
            Err(e) => {
                let msg = guest_message(&e);
                warn!(error = %msg, "invoke failed");
                self.fail(&msg);
                Err(e.into())
            }
        }
    }

    /// Release the engine and freeze the counters. Absorbing; safe to call
    /// repeatedly.
    pub fn terminate(&mut self) {
        if self.state == State::Terminated {
            return;
        }
        self.lua = None;
        self.shared.borrow_mut().usage.set_current(UsageType::Memory, 0);
        self.state = State::Terminated;
        debug!("sandbox terminated");
    }

    /// Read a usage counter. Live counters are refreshed from the engine
    /// while it is alive; after termination the frozen values are returned.
    pub fn usage(&self, utype: UsageType, stat: UsageStat) -> u64 {
        if stat != UsageStat::Limit && self.lua.is_some() {
            self.sample_usage();
        }
        self.shared.borrow().usage.get(utype, stat)
    }

    /// The last recorded error message, empty if none.
    pub fn last_error(&self) -> String {
        self.shared.borrow().error_message.clone().unwrap_or_default()
    }

    /// Drain the output buffer. Resets the current output counter; the
    /// high-water mark is preserved.
    pub fn take_output(&mut self) -> Vec<u8> {
        let mut shared = self.shared.borrow_mut();
        let bytes = shared.output.take();
        shared.usage.set_current(UsageType::Output, 0);
        bytes
    }

    /// Register an extension library (e.g. lpeg, pb, bloom_filter,
    /// hyperloglog) to be loaded through the gate on `require(name)`.
    pub fn register_library<F>(&mut self, name: &str, denylist: &[&str], loader: F) -> Result<()>
    where
        F: Fn(&Lua) -> mlua::Result<Table> + 'static,
    {
        if self.state == State::Terminated {
            return Err(SandboxError::InvalidState {
                operation: "register_library",
                state: self.state,
            });
        }
        let loader: LibraryLoader = Rc::new(loader);
        self.shared.borrow_mut().registry.register(name, denylist, loader);
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Where the host snapshots guest globals, if configured. Opaque to the
    /// sandbox core.
    pub fn preservation_path(&self) -> Option<&Path> {
        self.config.preservation_path.as_deref()
    }

    /// Refresh live counters into the tracker.
    fn sample_usage(&self) {
        let mut shared = self.shared.borrow_mut();
        if let Some(lua) = &self.lua {
            shared.usage.set_current(UsageType::Memory, lua.used_memory() as u64);
        }
        shared.usage.set_current(UsageType::Instructions, self.instructions.get());
        shared.sync_output_stats();
    }

    /// Record a fatal error and terminate.
    fn fail(&mut self, msg: &str) {
        self.shared.borrow_mut().record_error(msg);
        self.terminate();
    }
}

/// Install the guest-visible `output(...)` closure.
fn install_output(lua: &Lua, shared: &Rc<RefCell<Shared>>) -> mlua::Result<()> {
    let state = shared.clone();
    let output = lua.create_function(move |_lua, args: MultiValue| {
        if args.is_empty() {
            return Err(mlua::Error::RuntimeError(
                "output() must have at least one argument".to_string(),
            ));
        }
        let mut shared = state.borrow_mut();
        let mut failure: Option<SerializeError> = None;
        for value in args.iter() {
            if let Err(e) = serialize::serialize_value(&mut shared.output, value) {
                failure = Some(e);
                break;
            }
        }
        // Stats reflect whatever was committed, even on partial success.
        shared.sync_output_stats();

        if let Some(err) = failure {
            if let SerializeError::Message(msg) = err {
                shared.record_error(&msg);
            }
            let msg = shared
                .error_message
                .clone()
                .unwrap_or_else(|| "output_limit exceeded".to_string());
            return Err(mlua::Error::RuntimeError(msg));
        }
        Ok(())
    })?;
    lua.globals().set("output", output)
}

/// `write()` signals "flush my output"; a host-provided no-op here.
fn install_write(lua: &Lua) -> mlua::Result<()> {
    let write = lua.create_function(|_, _: MultiValue| Ok(()))?;
    lua.globals().set("write", write)
}
