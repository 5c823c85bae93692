/// `scripting/engine.rs` - interpreter host
///
/// `LuaHost` owns one engine instance plus the pieces shared by every sandbox
/// built on top of it: the set of natively opened standard libraries, the
/// optional memory accounting state, and the engine's timeout watchdog.
/// Sandboxes hold reference-counted clones of the engine handle, so resetting
/// the host orphans them onto the old engine rather than invalidating memory.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{Lua, LuaOptions, StdLib};

use super::libs::LuaLib;
use super::memory::{LimitedAllocator, SharedAllocator};
use super::watchdog::{GuardedScope, Watchdog};

// ── HostCore ──────────────────────────────────────────────────────────────────

/// Opened-library registry shared between a host and its sandboxes.
pub(crate) type OpenedLibs = Arc<Mutex<BTreeSet<LuaLib>>>;

/// Open a native standard library exactly once. Repeat calls are no-ops.
///
/// Free-standing so script-visible callbacks can reach it through the `&Lua`
/// they are invoked with, without capturing an engine handle (which would
/// cycle the engine into itself).
pub(crate) fn open_library(lua: &Lua, opened: &Mutex<BTreeSet<LuaLib>>, lib: LuaLib) -> bool {
    let mut opened = opened.lock().unwrap();
    if opened.contains(&lib) {
        return true;
    }
    if lib == LuaLib::Base {
        opened.insert(lib);
        return true;
    }
    let Some(flags) = lib.std_lib() else {
        log::error!(
            "[lua sandbox] library '{}' is not available in this engine build",
            lib.name()
        );
        return false;
    };
    match lua.load_std_libs(flags) {
        Ok(()) => {
            opened.insert(lib);
            true
        }
        Err(err) => {
            log::error!("[lua sandbox] failed to open library '{}': {err}", lib.name());
            false
        }
    }
}

/// Engine handle plus the opened-library set, cloned into each sandbox.
#[derive(Clone)]
pub(crate) struct HostCore {
    lua: Lua,
    opened: OpenedLibs,
}

impl HostCore {
    fn create() -> mlua::Result<Self> {
        // Bare engine: sandboxes decide what gets opened. The base library is
        // part of state creation and always present.
        let lua = Lua::new_with(StdLib::NONE, LuaOptions::default())?;
        Ok(Self {
            lua,
            opened: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    pub(crate) fn opened(&self) -> OpenedLibs {
        self.opened.clone()
    }

    pub(crate) fn open(&self, lib: LuaLib) -> bool {
        open_library(&self.lua, &self.opened, lib)
    }

    pub(crate) fn is_open(&self, lib: LuaLib) -> bool {
        self.opened.lock().unwrap().contains(&lib)
    }
}

// ── LuaHost ───────────────────────────────────────────────────────────────────

/// One engine instance with optional memory accounting and a shared watchdog.
pub struct LuaHost {
    core: HostCore,
    allocator: Option<SharedAllocator>,
    watchdog: Arc<Watchdog>,
}

impl LuaHost {
    /// Engine with the default allocator (no memory cap).
    pub fn new() -> mlua::Result<Self> {
        Self::build(None)
    }

    /// Engine whose allocations are capped at `limit` bytes. The accounting
    /// state outlives any engine it is wired to and survives [`reset`].
    ///
    /// [`reset`]: LuaHost::reset
    pub fn with_memory_limit(limit: usize) -> mlua::Result<Self> {
        Self::build(Some(limit))
    }

    fn build(limit: Option<usize>) -> mlua::Result<Self> {
        let core = HostCore::create()?;
        let allocator = match limit {
            Some(limit) => {
                core.lua().set_memory_limit(limit)?;
                Some(LimitedAllocator::shared(limit))
            }
            None => None,
        };
        let watchdog = Arc::new(Watchdog::new());
        watchdog.attach(core.lua(), false);
        Ok(Self {
            core,
            allocator,
            watchdog,
        })
    }

    pub fn lua(&self) -> &Lua {
        self.core.lua()
    }

    pub(crate) fn core(&self) -> &HostCore {
        &self.core
    }

    /// Open a native standard library in the engine; idempotent.
    pub fn require(&self, lib: LuaLib) -> bool {
        self.core.open(lib)
    }

    pub fn is_open(&self, lib: LuaLib) -> bool {
        self.core.is_open(lib)
    }

    /// Destroy and recreate the engine. Memory accounting keeps its `used`
    /// and `limit` values so the numbers stay continuous; the opened-library
    /// set resets to empty and the watchdog is rebound to the new engine.
    /// Sandboxes created before the reset stay on the old engine.
    pub fn reset(&mut self) -> mlua::Result<()> {
        self.watchdog.detach();
        let fresh = HostCore::create()?;
        if let Some(allocator) = &self.allocator {
            let limit = allocator.lock().unwrap().limit();
            fresh.lua().set_memory_limit(limit)?;
        }
        self.watchdog.attach(fresh.lua(), false);
        self.core = fresh;
        Ok(())
    }

    /// Update the memory cap. Fails when the host was created without one.
    pub fn set_memory_limit(&self, limit: usize) -> bool {
        let Some(allocator) = &self.allocator else {
            log::error!("[lua sandbox] engine was created without a memory limit");
            return false;
        };
        if let Err(err) = self.core.lua().set_memory_limit(limit) {
            log::error!("[lua sandbox] failed to update the memory limit: {err}");
            return false;
        }
        allocator.lock().unwrap().set_limit(limit);
        true
    }

    /// Snapshot of the memory accounting state, with `used` refreshed from
    /// the engine. `None` when the host has no memory limit.
    pub fn memory(&self) -> Option<LimitedAllocator> {
        let allocator = self.allocator.as_ref()?;
        let mut state = allocator.lock().unwrap();
        state.sync_used(self.core.lua().used_memory());
        Some(state.clone())
    }

    /// Clear the sticky allocator failure flags.
    pub fn reset_memory_flags(&self) {
        if let Some(allocator) = &self.allocator {
            allocator.lock().unwrap().reset_error_flags();
        }
    }

    pub(crate) fn allocator(&self) -> Option<&SharedAllocator> {
        self.allocator.as_ref()
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// Scoped deadline over the host's shared watchdog.
    pub fn guarded_scope(&self, budget: Duration) -> GuardedScope {
        GuardedScope::new(self.watchdog.clone(), budget)
    }
}
