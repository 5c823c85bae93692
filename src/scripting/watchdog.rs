/// `scripting/watchdog.rs` - instruction-hook deadline enforcement
///
/// A `Watchdog` binds to one engine and, while armed, installs a debug hook
/// that fires every N executed instructions. The hook looks up the watchdog's
/// context through a named registry slot on the engine and raises a
/// script-level error once the deadline has passed. `GuardedScope` is the
/// scoped arm/disarm wrapper used around a script execution.
///
/// Only one watchdog may be armed on a given engine at a time; the registry
/// slot doubles as the occupancy marker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{AnyUserData, Error, HookTriggers, Lua, UserData, Value, VmState};

/// Instructions executed between deadline checks.
pub const DEFAULT_CHECK_PERIOD: u32 = 10_000;
/// Time budget used when a caller does not supply one.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_millis(5);

/// Hook invoked every check period. The default is [`deadline_hook`].
pub type TimeoutHook = fn(&Lua) -> mlua::Result<VmState>;

// ── Registry slot ─────────────────────────────────────────────────────────────

/// Registry key for the per-engine hook context. Unique to this crate; the
/// slot must be empty before a watchdog may arm.
const CONTEXT_SLOT: &str = "warkeep.watchdog.context";

struct ContextHandle(Arc<Mutex<HookContext>>);

impl UserData for ContextHandle {}

fn slot_set(lua: &Lua, context: Arc<Mutex<HookContext>>) -> mlua::Result<()> {
    lua.set_named_registry_value(CONTEXT_SLOT, ContextHandle(context))
}

fn slot_get(lua: &Lua) -> Option<Arc<Mutex<HookContext>>> {
    let data: AnyUserData = lua.named_registry_value(CONTEXT_SLOT).ok()?;
    let handle = data.borrow::<ContextHandle>().ok()?;
    Some(handle.0.clone())
}

fn slot_is_empty(lua: &Lua) -> bool {
    matches!(lua.named_registry_value::<Value>(CONTEXT_SLOT), Ok(Value::Nil))
}

fn slot_clear(lua: &Lua) -> mlua::Result<()> {
    lua.unset_named_registry_value(CONTEXT_SLOT)
}

// ── HookContext ───────────────────────────────────────────────────────────────

/// Deadline state read by the hook. Mutated only by the owning watchdog.
#[derive(Debug, Default)]
pub struct HookContext {
    deadline: Option<Instant>,
    enabled: bool,
}

impl HookContext {
    fn start(&mut self, budget: Duration) {
        self.enabled = true;
        self.deadline = Some(Instant::now() + budget);
    }

    fn reset(&mut self) {
        *self = HookContext::default();
    }

    pub fn is_timed_out(&self) -> bool {
        self.enabled && self.deadline.is_some_and(|deadline| Instant::now() > deadline)
    }
}

/// Default timeout hook: reads the context from the engine's registry slot
/// and raises `"Script timed out"` once the deadline has passed. A missing
/// slot is reported rather than ignored; the hook never touches the engine
/// beyond raising the error.
pub fn deadline_hook(lua: &Lua) -> mlua::Result<VmState> {
    let Some(context) = slot_get(lua) else {
        return Err(Error::RuntimeError("Unable to get hook context".into()));
    };
    if context.lock().unwrap().is_timed_out() {
        return Err(Error::RuntimeError("Script timed out".into()));
    }
    Ok(VmState::Continue)
}

// ── Watchdog ──────────────────────────────────────────────────────────────────

struct WatchdogInner {
    lua: Option<Lua>,
    check_period: u32,
    hook: TimeoutHook,
    context: Arc<Mutex<HookContext>>,
    armed: bool,
}

/// Deadline watchdog for one engine.
///
/// Lifecycle: detached -> attached (`attach`) -> armed (`arm`) -> back via
/// `disarm`/`detach`. Configuration is rejected while armed.
pub struct Watchdog {
    inner: Mutex<WatchdogInner>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_CHECK_PERIOD)
    }

    pub fn with_period(check_period: u32) -> Self {
        let check_period = if check_period > 0 {
            check_period
        } else {
            DEFAULT_CHECK_PERIOD
        };
        Self {
            inner: Mutex::new(WatchdogInner {
                lua: None,
                check_period,
                hook: deadline_hook,
                context: Arc::new(Mutex::new(HookContext::default())),
                armed: false,
            }),
        }
    }

    /// Bind to an engine. Refused while armed unless `force`, which disarms
    /// the previous engine first.
    pub fn attach(&self, lua: &Lua, force: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.armed {
            if !force {
                log::error!("[lua sandbox] watchdog: refusing to attach while armed");
                return false;
            }
            Self::disarm_inner(&mut inner);
        }
        inner.lua = Some(lua.clone());
        true
    }

    /// Disarm if needed and drop the engine binding. Idempotent.
    pub fn detach(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::disarm_inner(&mut inner);
        inner.lua = None;
    }

    /// Replace the check period and hook. Rejected while armed; the period
    /// must be positive.
    pub fn configure(&self, check_period: u32, hook: TimeoutHook) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.armed {
            log::error!("[lua sandbox] watchdog: cannot reconfigure while armed");
            return false;
        }
        if check_period == 0 {
            log::error!("[lua sandbox] watchdog: check period must be positive");
            return false;
        }
        inner.check_period = check_period;
        inner.hook = hook;
        true
    }

    /// Replace the check period, keeping the current hook.
    pub fn set_check_period(&self, check_period: u32) -> bool {
        let hook = self.inner.lock().unwrap().hook;
        self.configure(check_period, hook)
    }

    pub fn check_period(&self) -> u32 {
        self.inner.lock().unwrap().check_period
    }

    pub fn armed(&self) -> bool {
        self.inner.lock().unwrap().armed
    }

    pub fn timed_out(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let context = inner.context.lock().unwrap();
        context.is_timed_out()
    }

    /// Install the hook and start the deadline. Fails without side effects
    /// when detached, already armed, or when the engine's registry slot is
    /// occupied (another watchdog owns the hook).
    pub fn arm(&self, budget: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(lua) = inner.lua.clone() else {
            log::error!("[lua sandbox] watchdog: cannot arm, no engine attached");
            return false;
        };
        if inner.armed {
            log::error!("[lua sandbox] watchdog: cannot arm, already armed");
            return false;
        }
        if !slot_is_empty(&lua) {
            log::error!("[lua sandbox] watchdog: cannot arm, registry slot is occupied");
            return false;
        }
        if let Err(err) = slot_set(&lua, inner.context.clone()) {
            log::error!("[lua sandbox] watchdog: failed to install hook context: {err}");
            return false;
        }

        let hook = inner.hook;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(inner.check_period),
            move |lua, _debug| hook(lua),
        );
        inner.context.lock().unwrap().start(budget);
        inner.armed = true;
        true
    }

    /// Refresh the deadline of an armed watchdog without touching the hook
    /// or the registry slot.
    pub fn rearm(&self, budget: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.armed {
            log::error!("[lua sandbox] watchdog: cannot rearm, not armed");
            return false;
        }
        inner.context.lock().unwrap().start(budget);
        true
    }

    /// Remove the hook, clear the registry slot, reset the context.
    /// Idempotent when not armed.
    pub fn disarm(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::disarm_inner(&mut inner);
    }

    fn disarm_inner(inner: &mut WatchdogInner) {
        if !inner.armed {
            return;
        }
        if let Some(lua) = &inner.lua {
            lua.remove_hook();
            if let Err(err) = slot_clear(lua) {
                log::error!("[lua sandbox] watchdog: failed to clear hook context: {err}");
            }
        }
        inner.context.lock().unwrap().reset();
        inner.armed = false;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::disarm_inner(&mut inner);
            inner.lua = None;
        }
    }
}

// ── GuardedScope ──────────────────────────────────────────────────────────────

/// Scoped arming of a watchdog: arms on construction, disarms on drop.
///
/// Construction on a watchdog that refuses to arm (detached, or already
/// armed by another scope) yields a disabled scope; a disabled scope never
/// reports timeouts and its drop is a no-op.
pub struct GuardedScope {
    watchdog: Option<Arc<Watchdog>>,
    restore_period: Option<u32>,
}

impl GuardedScope {
    pub fn new(watchdog: Arc<Watchdog>, budget: Duration) -> Self {
        if watchdog.arm(budget) {
            Self {
                watchdog: Some(watchdog),
                restore_period: None,
            }
        } else {
            Self::disabled()
        }
    }

    /// Arm with a scope-local check period; the watchdog's previous period is
    /// restored when the scope ends.
    pub fn with_period(watchdog: Arc<Watchdog>, budget: Duration, check_period: u32) -> Self {
        let previous = watchdog.check_period();
        if !watchdog.set_check_period(check_period) {
            return Self::disabled();
        }
        if watchdog.arm(budget) {
            Self {
                watchdog: Some(watchdog),
                restore_period: Some(previous),
            }
        } else {
            watchdog.set_check_period(previous);
            Self::disabled()
        }
    }

    fn disabled() -> Self {
        Self {
            watchdog: None,
            restore_period: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Disarm and arm again with a fresh budget. A failure leaves the scope
    /// disabled.
    pub fn rearm(&mut self, budget: Duration) -> bool {
        let Some(watchdog) = self.watchdog.clone() else {
            return false;
        };
        watchdog.disarm();
        if watchdog.arm(budget) {
            return true;
        }
        if let Some(period) = self.restore_period.take() {
            watchdog.set_check_period(period);
        }
        self.watchdog = None;
        false
    }

    pub fn timed_out(&self) -> bool {
        self.watchdog
            .as_ref()
            .is_some_and(|watchdog| watchdog.timed_out())
    }
}

impl Drop for GuardedScope {
    fn drop(&mut self) {
        let Some(watchdog) = self.watchdog.take() else {
            return;
        };
        watchdog.disarm();
        if let Some(period) = self.restore_period.take() {
            watchdog.set_check_period(period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIN: &str = "while true do end";

    #[test]
    fn arm_requires_an_attached_engine() {
        let watchdog = Watchdog::new();
        assert!(!watchdog.arm(DEFAULT_TIME_BUDGET));
        assert!(!watchdog.armed());
    }

    #[test]
    fn arm_refuses_double_arming() {
        let lua = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua, false));

        assert!(watchdog.arm(Duration::from_secs(60)));
        assert!(watchdog.armed());
        assert!(!watchdog.arm(Duration::from_secs(60)));

        watchdog.disarm();
        assert!(!watchdog.armed());
        assert!(watchdog.arm(Duration::from_secs(60)));
        watchdog.disarm();
    }

    #[test]
    fn arm_refuses_an_occupied_registry_slot() {
        let lua = Lua::new();
        let first = Watchdog::new();
        let second = Watchdog::new();
        assert!(first.attach(&lua, false));
        assert!(second.attach(&lua, false));

        assert!(first.arm(Duration::from_secs(60)));
        assert!(!second.arm(Duration::from_secs(60)));

        first.disarm();
        assert!(slot_is_empty(&lua));
    }

    #[test]
    fn watchdog_arms_on_scope_and_times_out() {
        let lua = Lua::new();
        let watchdog = Arc::new(Watchdog::new());
        assert!(watchdog.attach(&lua, false));
        assert!(!watchdog.armed());

        {
            let scope = GuardedScope::new(watchdog.clone(), Duration::from_millis(5));
            assert!(watchdog.armed());

            let err = lua.load(SPIN).exec().unwrap_err();
            assert!(
                err.to_string().contains("Script timed out"),
                "unexpected error: {err}"
            );
            assert!(scope.timed_out());
        }

        assert!(!watchdog.armed());
        assert!(slot_is_empty(&lua), "scope exit must clear the registry slot");
    }

    #[test]
    fn missing_context_is_reported_not_fatal() {
        let lua = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua, false));
        assert!(watchdog.arm(Duration::from_millis(5)));

        // Pull the context out from under the installed hook.
        slot_clear(&lua).unwrap();

        let err = lua.load(SPIN).exec().unwrap_err();
        assert!(
            err.to_string().contains("Unable to get hook context"),
            "unexpected error: {err}"
        );
        watchdog.disarm();
    }

    #[test]
    fn configure_is_rejected_while_armed() {
        let lua = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua, false));

        assert!(!watchdog.configure(0, deadline_hook));
        assert!(watchdog.configure(5_000, deadline_hook));
        assert_eq!(watchdog.check_period(), 5_000);

        assert!(watchdog.arm(Duration::from_secs(60)));
        assert!(!watchdog.configure(7_000, deadline_hook));
        assert_eq!(watchdog.check_period(), 5_000);
        watchdog.disarm();
    }

    #[test]
    fn rearm_refreshes_only_when_armed() {
        let lua = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua, false));

        assert!(!watchdog.rearm(Duration::from_secs(1)));
        assert!(watchdog.arm(Duration::from_secs(1)));
        assert!(watchdog.rearm(Duration::from_secs(60)));
        assert!(!watchdog.timed_out());
        watchdog.disarm();
    }

    #[test]
    fn configured_custom_hook_replaces_the_default() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static TICKS: AtomicUsize = AtomicUsize::new(0);

        fn counting_hook(lua: &Lua) -> mlua::Result<VmState> {
            TICKS.fetch_add(1, Ordering::Relaxed);
            deadline_hook(lua)
        }

        let lua = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua, false));
        assert!(watchdog.configure(1_000, counting_hook));
        assert!(watchdog.arm(Duration::from_millis(5)));

        let err = lua.load(SPIN).exec().unwrap_err();
        assert!(err.to_string().contains("Script timed out"));
        assert!(TICKS.load(Ordering::Relaxed) > 0, "custom hook never ran");
        watchdog.disarm();
    }

    #[test]
    fn guarded_scope_restores_hook_period() {
        let lua = Lua::new();
        let watchdog = Arc::new(Watchdog::with_period(5_000));
        assert!(watchdog.attach(&lua, false));
        assert_eq!(watchdog.check_period(), 5_000);

        {
            let _scope =
                GuardedScope::with_period(watchdog.clone(), Duration::from_millis(10), 20_000);
            assert_eq!(watchdog.check_period(), 20_000);
        }
        assert_eq!(watchdog.check_period(), 5_000);
    }

    #[test]
    fn secondary_scope_on_armed_watchdog_is_inert() {
        let lua = Lua::new();
        let watchdog = Arc::new(Watchdog::new());
        assert!(watchdog.attach(&lua, false));

        let first = GuardedScope::new(watchdog.clone(), Duration::from_secs(60));
        assert!(first.is_enabled());

        let second = GuardedScope::new(watchdog.clone(), Duration::from_secs(60));
        assert!(!second.is_enabled());
        assert!(!second.timed_out());

        drop(second);
        assert!(watchdog.armed(), "dropping the inert scope must not disarm");
        drop(first);
        assert!(!watchdog.armed());
    }

    #[test]
    fn scope_rearm_recovers_after_timeout() {
        let lua = Lua::new();
        let watchdog = Arc::new(Watchdog::new());
        assert!(watchdog.attach(&lua, false));

        let mut scope = GuardedScope::new(watchdog.clone(), Duration::from_millis(5));
        let err = lua.load(SPIN).exec().unwrap_err();
        assert!(err.to_string().contains("Script timed out"));
        assert!(scope.timed_out());

        assert!(scope.rearm(Duration::from_secs(60)));
        assert!(!scope.timed_out());
        let value: i64 = lua.load("return 1 + 1").eval().unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn watchdog_reattaches_to_a_new_engine() {
        let lua1 = Lua::new();
        let watchdog = Arc::new(Watchdog::new());
        assert!(watchdog.attach(&lua1, false));

        {
            let _scope = GuardedScope::new(watchdog.clone(), Duration::from_millis(5));
            assert!(lua1.load(SPIN).exec().is_err());
        }

        let lua2 = Lua::new();
        assert!(watchdog.attach(&lua2, false));

        {
            let _scope = GuardedScope::new(watchdog.clone(), Duration::from_millis(5));
            let err = lua2.load(SPIN).exec().unwrap_err();
            assert!(err.to_string().contains("Script timed out"));
        }
        assert!(slot_is_empty(&lua2));
    }

    #[test]
    fn forced_attach_disarms_the_previous_engine() {
        let lua1 = Lua::new();
        let lua2 = Lua::new();
        let watchdog = Watchdog::new();
        assert!(watchdog.attach(&lua1, false));
        assert!(watchdog.arm(Duration::from_secs(60)));

        assert!(!watchdog.attach(&lua2, false));
        assert!(watchdog.attach(&lua2, true));
        assert!(!watchdog.armed());
        assert!(slot_is_empty(&lua1), "forced attach must release the old slot");
    }
}
