/// `scripting/sandbox.rs` - sandboxed Lua runtime
///
/// A `Sandbox` owns a private global environment inside a host engine. Chunks
/// run with that environment, so scripts never see the interpreter's true
/// globals. Standard libraries are projected into the environment as filtered
/// copies, and the script-visible file primitives (`dofile`, `loadfile`,
/// `require_file`, ...) resolve every path through the sandbox's filesystem
/// policy. Script errors are caught and returned - never allowed to take the
/// host down.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{Error, FromLua, Function, IntoLua, Lua, MultiValue, Table, Value};
use serde::{Deserialize, Serialize};

use super::engine::{open_library, HostCore, LuaHost, OpenedLibs};
use super::libs::{rules_for, LuaLib, SymbolRules};
use super::memory::{is_memory_error, SharedAllocator};
use super::paths::{is_bytecode, ScriptPaths};
use super::watchdog::{GuardedScope, Watchdog};

/// Framing prefix for sandbox `print` output; one line per call.
pub const PRINT_PREFIX: &str = "[lua sandbox]:> ";

const DENIED_MISSING: &str = "Attempting to run a non-existent script";
const DENIED_OUTSIDE: &str = "Attempting to run a script outside the allowed path";
const DENIED_BYTECODE: &str = "Attempting to run precompiled Lua bytecode";

/// Receives sandbox `print` output, one framed line per call.
pub type PrintSink = Arc<Mutex<dyn Write + Send>>;

fn stdout_sink() -> PrintSink {
    Arc::new(Mutex::new(io::stdout()))
}

type SharedEnv = Arc<Mutex<Table>>;
type LoadedLibs = Arc<Mutex<BTreeSet<LuaLib>>>;
type SharedPaths = Arc<Mutex<ScriptPaths>>;

// ── Preset ────────────────────────────────────────────────────────────────────

/// Named bundle of libraries a sandbox starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Nothing at all.
    Core,
    /// base + table.
    #[default]
    Minimal,
    /// base, coroutine, math, os, string, table.
    Complete,
    /// Empty at start; grows only through explicit `require`.
    Custom,
}

impl Preset {
    pub fn libraries(self) -> &'static [LuaLib] {
        match self {
            Preset::Core | Preset::Custom => &[],
            Preset::Minimal => &[LuaLib::Base, LuaLib::Table],
            Preset::Complete => &[
                LuaLib::Base,
                LuaLib::Coroutine,
                LuaLib::Math,
                LuaLib::Os,
                LuaLib::String,
                LuaLib::Table,
            ],
        }
    }
}

// ── SandboxConfig ─────────────────────────────────────────────────────────────

/// Declarative sandbox description, loadable from configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub preset: Preset,
    /// Absolute scripts root; empty disables file loading.
    #[serde(default)]
    pub root: PathBuf,
    /// Allowed path prefixes; relative entries are joined to `root`.
    /// Empty means the root itself.
    #[serde(default)]
    pub allowed: Vec<PathBuf>,
}

// ── Sandbox ───────────────────────────────────────────────────────────────────

/// A capability-, filesystem- and resource-sandboxed scripting domain on one
/// host engine. Several sandboxes may share a host; each has an independent
/// environment, while library function values are shared through projection.
pub struct Sandbox {
    core: HostCore,
    env: SharedEnv,
    preset: Preset,
    paths: SharedPaths,
    loaded: LoadedLibs,
    sink: PrintSink,
    allocator: Option<SharedAllocator>,
    watchdog: Arc<Watchdog>,
}

impl Sandbox {
    /// Sandbox without file loading, printing to stdout.
    pub fn new(host: &LuaHost, preset: Preset) -> mlua::Result<Self> {
        Self::with_sink(host, preset, Path::new(""), &[], stdout_sink())
    }

    /// Sandbox with a scripts root and allow-list, printing to stdout.
    pub fn with_paths(
        host: &LuaHost,
        preset: Preset,
        root: &Path,
        allowed: &[PathBuf],
    ) -> mlua::Result<Self> {
        Self::with_sink(host, preset, root, allowed, stdout_sink())
    }

    pub fn from_config(host: &LuaHost, config: &SandboxConfig) -> mlua::Result<Self> {
        Self::with_sink(host, config.preset, &config.root, &config.allowed, stdout_sink())
    }

    /// Fully specified sandbox. Construction eagerly performs a
    /// [`reset`](Sandbox::reset) without garbage collection.
    pub fn with_sink(
        host: &LuaHost,
        preset: Preset,
        root: &Path,
        allowed: &[PathBuf],
        sink: PrintSink,
    ) -> mlua::Result<Self> {
        let core = host.core().clone();
        let env = core.lua().create_table()?;
        let mut sandbox = Self {
            core,
            env: Arc::new(Mutex::new(env)),
            preset,
            paths: Arc::new(Mutex::new(ScriptPaths::new(root, allowed))),
            loaded: Arc::new(Mutex::new(BTreeSet::new())),
            sink,
            allocator: host.allocator().cloned(),
            watchdog: host.watchdog().clone(),
        };
        sandbox.reset(false)?;
        Ok(sandbox)
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    /// The current sandbox environment table.
    pub fn environment(&self) -> Table {
        self.env.lock().unwrap().clone()
    }

    /// Rebuild the environment from scratch: fresh table, `_G` self-binding,
    /// the libraries loaded before the reset (or the preset's bundle when
    /// nothing was ever loaded), then the safe script-visible primitives.
    /// The previous environment becomes unreachable and collectable.
    pub fn reset(&mut self, collect_garbage: bool) -> mlua::Result<()> {
        let lua = self.core.lua();
        let env = lua.create_table()?;
        env.set("_G", env.clone())?;
        *self.env.lock().unwrap() = env.clone();

        let libs: Vec<LuaLib> = {
            let loaded = self.loaded.lock().unwrap();
            if loaded.is_empty() {
                self.preset.libraries().to_vec()
            } else {
                loaded.iter().copied().collect()
            }
        };
        self.loaded.lock().unwrap().clear();
        let opened = self.core.opened();
        for lib in libs {
            load_library(lua, &opened, &env, &self.loaded, lib);
        }

        self.install_primitives(&env)?;
        if collect_garbage {
            lua.gc_collect()?;
        }
        Ok(())
    }

    /// Execute a text chunk inside the sandbox environment.
    pub fn run(&self, script: &str) -> mlua::Result<MultiValue> {
        let env = self.environment();
        let result = self
            .core
            .lua()
            .load(script)
            .set_environment(env)
            .eval::<MultiValue>();
        self.observe(&result);
        result
    }

    /// Resolve `path` through the filesystem policy and execute the file.
    /// Non-existent, out-of-allow-list and bytecode files are refused.
    pub fn run_file(&self, path: &Path) -> mlua::Result<MultiValue> {
        let result = exec_script_file(self.core.lua(), &self.env, &self.paths, path);
        self.observe(&result);
        result
    }

    /// Load a library into the sandbox. Only `Custom` sandboxes may grow.
    pub fn require(&self, lib: LuaLib) -> bool {
        if self.preset != Preset::Custom {
            return false;
        }
        let env = self.environment();
        load_library(self.core.lua(), &self.core.opened(), &env, &self.loaded, lib)
    }

    /// Append to the filesystem allow-list; ignored while file loading is
    /// disabled.
    pub fn allow_script_path(&self, path: &Path) {
        self.paths.lock().unwrap().allow(path);
    }

    pub fn loaded_libraries(&self) -> Vec<LuaLib> {
        self.loaded.lock().unwrap().iter().copied().collect()
    }

    /// Read a value from the sandbox environment.
    pub fn get<V: FromLua>(&self, key: &str) -> mlua::Result<V> {
        self.environment().get(key)
    }

    /// Write a value into the sandbox environment.
    pub fn set(&self, key: &str, value: impl IntoLua) -> mlua::Result<()> {
        self.environment().set(key, value)
    }

    /// True when the environment holds a non-nil value for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.environment().contains_key(key).unwrap_or(false)
    }

    /// Scoped deadline over the host's shared watchdog.
    pub fn guarded_scope(&self, budget: Duration) -> GuardedScope {
        GuardedScope::new(self.watchdog.clone(), budget)
    }

    fn observe(&self, result: &mlua::Result<MultiValue>) {
        let Some(allocator) = &self.allocator else {
            return;
        };
        let mut allocator = allocator.lock().unwrap();
        allocator.sync_used(self.core.lua().used_memory());
        if let Err(err) = result {
            if is_memory_error(err) {
                allocator.note_limit_reached();
            }
        }
    }

    // ── Script-visible primitives ─────────────────────────────────────────

    fn install_primitives(&self, env: &Table) -> mlua::Result<()> {
        let lua = self.core.lua();

        env.set("print", self.make_print(lua)?)?;
        env.set("dofile", self.make_dofile(lua)?)?;
        env.set("safe_dofile", self.make_safe_dofile(lua)?)?;
        env.set("loadfile", self.make_loadfile(lua)?)?;
        env.set("require", self.make_require(lua)?)?;
        env.set("require_file", self.make_require_file(lua)?)?;
        Ok(())
    }

    /// `print(...)`: stringify through the engine, join by single spaces,
    /// frame as one prefixed line, write atomically to the sink.
    fn make_print(&self, lua: &Lua) -> mlua::Result<Function> {
        let sink = self.sink.clone();
        lua.create_function(move |_, args: MultiValue| {
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                parts.push(value.to_string()?);
            }
            let line = format!("{PRINT_PREFIX}{}\n", parts.join(" "));
            let mut sink = sink.lock().unwrap();
            sink.write_all(line.as_bytes())
                .and_then(|()| sink.flush())
                .map_err(Error::external)?;
            Ok(())
        })
    }

    /// `dofile(name)`: execute an admitted file; any failure (resolution,
    /// load, runtime, bad argument) yields nil and a logged error.
    fn make_dofile(&self, lua: &Lua) -> mlua::Result<Function> {
        let env = self.env.clone();
        let paths = self.paths.clone();
        let allocator = self.allocator.clone();
        lua.create_function(move |lua, name: Value| {
            let Value::String(name) = name else {
                log::error!("[lua sandbox] dofile: script name must be a string");
                return Ok(MultiValue::from_vec(vec![Value::Nil]));
            };
            let name = name.to_string_lossy();
            match exec_script_file(lua, &env, &paths, Path::new(&name)) {
                Ok(values) => Ok(values),
                Err(err) => {
                    observe_error(allocator.as_ref(), &err);
                    log::error!("[lua sandbox] dofile('{name}') failed: {err}");
                    Ok(MultiValue::from_vec(vec![Value::Nil]))
                }
            }
        })
    }

    /// `safe_dofile(name)`: `(true, ...chunk results)` on success,
    /// `(false, message)` on failure.
    fn make_safe_dofile(&self, lua: &Lua) -> mlua::Result<Function> {
        let env = self.env.clone();
        let paths = self.paths.clone();
        let allocator = self.allocator.clone();
        lua.create_function(move |lua, name: String| {
            match exec_script_file(lua, &env, &paths, Path::new(&name)) {
                Ok(values) => {
                    let mut out = Vec::with_capacity(values.len() + 1);
                    out.push(Value::Boolean(true));
                    out.extend(values);
                    Ok(MultiValue::from_vec(out))
                }
                Err(err) => {
                    observe_error(allocator.as_ref(), &err);
                    log::warn!("[lua sandbox] safe_dofile('{name}') failed: {err}");
                    Ok(MultiValue::from_vec(vec![
                        Value::Boolean(false),
                        Value::String(lua.create_string(err.to_string())?),
                    ]))
                }
            }
        })
    }

    /// `loadfile(name)`: `(chunk, nil)` with the chunk bound to the sandbox
    /// environment, or `(nil, message)`. No execution.
    fn make_loadfile(&self, lua: &Lua) -> mlua::Result<Function> {
        let env = self.env.clone();
        let paths = self.paths.clone();
        lua.create_function(move |lua, name: String| {
            match load_script_chunk(lua, &env, &paths, Path::new(&name)) {
                Ok(chunk) => Ok((Value::Function(chunk), Value::Nil)),
                Err(err) => {
                    log::warn!("[lua sandbox] loadfile('{name}') failed: {err}");
                    Ok((Value::Nil, Value::String(lua.create_string(err.to_string())?)))
                }
            }
        })
    }

    /// `require(name)`: load a whitelisted library by canonical name and
    /// memoize it. Never interprets `name` as a file path; script modules go
    /// through `require_file`.
    fn make_require(&self, lua: &Lua) -> mlua::Result<Function> {
        let opened = self.core.opened();
        let env = self.env.clone();
        let loaded = self.loaded.clone();
        let preset = self.preset;
        lua.create_function(move |lua, name: String| {
            let Some(lib) = LuaLib::from_name(&name) else {
                log::warn!(
                    "[lua sandbox] require('{name}'): not a library name \
                     (script modules load through require_file)"
                );
                return Ok(Value::Nil);
            };
            let env = env.lock().unwrap().clone();
            if loaded.lock().unwrap().contains(&lib) {
                return env.get(lib.lookup_name());
            }
            if preset != Preset::Custom {
                log::warn!("[lua sandbox] require('{name}') denied: preset forbids loading libraries");
                return Ok(Value::Nil);
            }
            if load_library(lua, &opened, &env, &loaded, lib) {
                env.get(lib.lookup_name())
            } else {
                Ok(Value::Nil)
            }
        })
    }

    /// `require_file(name)`: load an admitted file as a module and return its
    /// first result, or `(nil, message)`.
    fn make_require_file(&self, lua: &Lua) -> mlua::Result<Function> {
        let env = self.env.clone();
        let paths = self.paths.clone();
        let allocator = self.allocator.clone();
        lua.create_function(move |lua, name: String| {
            let chunk = match load_script_chunk(lua, &env, &paths, Path::new(&name)) {
                Ok(chunk) => chunk,
                Err(err) => {
                    log::warn!("[lua sandbox] require_file('{name}') failed: {err}");
                    return Ok((Value::Nil, Value::String(lua.create_string(err.to_string())?)));
                }
            };
            match chunk.call::<MultiValue>(()) {
                Ok(values) => {
                    let first = values.into_iter().next().unwrap_or(Value::Nil);
                    Ok((first, Value::Nil))
                }
                Err(err) => {
                    observe_error(allocator.as_ref(), &err);
                    log::warn!("[lua sandbox] require_file('{name}') failed: {err}");
                    Ok((Value::Nil, Value::String(lua.create_string(err.to_string())?)))
                }
            }
        })
    }
}

// ── Library projection ────────────────────────────────────────────────────────

/// Open `lib` in the host if needed and project it into `env` under its
/// symbol rules. Libraries without rules are refused.
fn load_library(
    lua: &Lua,
    opened: &OpenedLibs,
    env: &Table,
    loaded: &LoadedLibs,
    lib: LuaLib,
) -> bool {
    let Some(rules) = rules_for(lib) else {
        log::warn!("[lua sandbox] library '{}' is not allowed in sandboxes", lib.name());
        return false;
    };
    if !open_library(lua, opened, lib) {
        return false;
    }
    match project_library(lua, env, lib, rules) {
        Ok(()) => {
            loaded.lock().unwrap().insert(lib);
            true
        }
        Err(err) => {
            log::error!("[lua sandbox] failed to project library '{}': {err}", lib.name());
            false
        }
    }
}

/// Copy the permitted part of a host library table into the sandbox. `base`
/// merges into the environment itself; every other library becomes a fresh
/// table, so removing an entry in one sandbox never affects another.
fn project_library(lua: &Lua, env: &Table, lib: LuaLib, rules: &SymbolRules) -> mlua::Result<()> {
    let globals = lua.globals();
    let source: Table = if lib == LuaLib::Base {
        globals
    } else {
        globals.get(lib.name())?
    };
    let target: Table = if lib == LuaLib::Base {
        env.clone()
    } else {
        let table = lua.create_table()?;
        env.set(lib.name(), table.clone())?;
        table
    };

    if rules.allow_all_except {
        for pair in source.pairs::<Value, Value>() {
            let (key, value) = pair?;
            target.set(key, value)?;
        }
    } else {
        for name in rules.allowed {
            let value: Value = source.get(*name)?;
            target.set(*name, value)?;
        }
    }
    for name in rules.restricted {
        target.set(*name, Value::Nil)?;
    }
    Ok(())
}

// ── File resolution and execution ─────────────────────────────────────────────

fn policy_error(category: &str, path: &Path) -> Error {
    Error::RuntimeError(format!("{category}: {}", path.display()))
}

/// Resolve a script name through the policy and admit or refuse it.
fn admit_script(paths: &Mutex<ScriptPaths>, name: &Path) -> mlua::Result<PathBuf> {
    let resolved = {
        let paths = paths.lock().unwrap();
        let resolved = paths.resolve(name);
        if !paths.is_allowed(&resolved) {
            return Err(policy_error(DENIED_OUTSIDE, &resolved));
        }
        resolved
    };
    if !resolved.is_file() {
        return Err(policy_error(DENIED_MISSING, &resolved));
    }
    if is_bytecode(&resolved) {
        return Err(policy_error(DENIED_BYTECODE, &resolved));
    }
    Ok(resolved)
}

/// Load an admitted file as a chunk bound to the sandbox environment.
fn load_script_chunk(
    lua: &Lua,
    env: &SharedEnv,
    paths: &SharedPaths,
    name: &Path,
) -> mlua::Result<Function> {
    let path = admit_script(paths, name)?;
    let source = fs::read(&path).map_err(Error::external)?;
    let env = env.lock().unwrap().clone();
    lua.load(&source[..])
        .set_name(path.display().to_string())
        .set_environment(env)
        .into_function()
}

fn exec_script_file(
    lua: &Lua,
    env: &SharedEnv,
    paths: &SharedPaths,
    name: &Path,
) -> mlua::Result<MultiValue> {
    let chunk = load_script_chunk(lua, env, paths, name)?;
    chunk.call(())
}

fn observe_error(allocator: Option<&SharedAllocator>, error: &Error) {
    if let Some(allocator) = allocator {
        if is_memory_error(error) {
            allocator.lock().unwrap().note_limit_reached();
        }
    }
}
