/// `scripting/libs.rs` - Lua standard library identifiers and symbol rules
///
/// `LuaLib` is the closed set of libraries the engine knows about. Which of
/// them a sandbox may load, and which symbols survive projection, is decided
/// by the static rule table at the bottom of this file. Libraries without a
/// rule entry can never be loaded into a sandbox.

use mlua::StdLib;
use serde::{Deserialize, Serialize};

// ── LuaLib ────────────────────────────────────────────────────────────────────

/// Identifier for one of the engine's built-in standard libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LuaLib {
    Base,
    /// Lua 5.2 only.
    Bit32,
    Coroutine,
    Debug,
    /// LuaJIT only.
    Ffi,
    Io,
    /// LuaJIT only.
    Jit,
    Math,
    Os,
    Package,
    String,
    Table,
    Utf8,
}

impl LuaLib {
    pub const ALL: [LuaLib; 13] = [
        LuaLib::Base,
        LuaLib::Bit32,
        LuaLib::Coroutine,
        LuaLib::Debug,
        LuaLib::Ffi,
        LuaLib::Io,
        LuaLib::Jit,
        LuaLib::Math,
        LuaLib::Os,
        LuaLib::Package,
        LuaLib::String,
        LuaLib::Table,
        LuaLib::Utf8,
    ];

    /// Canonical short name.
    pub fn name(self) -> &'static str {
        match self {
            LuaLib::Base => "base",
            LuaLib::Bit32 => "bit32",
            LuaLib::Coroutine => "coroutine",
            LuaLib::Debug => "debug",
            LuaLib::Ffi => "ffi",
            LuaLib::Io => "io",
            LuaLib::Jit => "jit",
            LuaLib::Math => "math",
            LuaLib::Os => "os",
            LuaLib::Package => "package",
            LuaLib::String => "string",
            LuaLib::Table => "table",
            LuaLib::Utf8 => "utf8",
        }
    }

    /// Name of the interpreter-global table holding the library.
    /// `base` lives in the global table itself rather than a named subtable.
    pub fn lookup_name(self) -> &'static str {
        match self {
            LuaLib::Base => "_G",
            other => other.name(),
        }
    }

    pub fn from_name(name: &str) -> Option<LuaLib> {
        LuaLib::ALL.iter().copied().find(|lib| lib.name() == name)
    }

    /// The mlua `StdLib` flag for this library, if the Lua 5.4 engine build
    /// ships it. `base` has no flag (mlua opens it at state creation);
    /// `bit32`, `ffi` and `jit` are absent from this engine entirely.
    pub(crate) fn std_lib(self) -> Option<StdLib> {
        match self {
            LuaLib::Base | LuaLib::Bit32 | LuaLib::Ffi | LuaLib::Jit => None,
            LuaLib::Coroutine => Some(StdLib::COROUTINE),
            LuaLib::Debug => Some(StdLib::DEBUG),
            LuaLib::Io => Some(StdLib::IO),
            LuaLib::Math => Some(StdLib::MATH),
            LuaLib::Os => Some(StdLib::OS),
            LuaLib::Package => Some(StdLib::PACKAGE),
            LuaLib::String => Some(StdLib::STRING),
            LuaLib::Table => Some(StdLib::TABLE),
            LuaLib::Utf8 => Some(StdLib::UTF8),
        }
    }
}

// ── Symbol rules ──────────────────────────────────────────────────────────────

/// Per-library projection rule: either an explicit allow-list, or
/// everything-except-`restricted`.
#[derive(Debug, Clone, Copy)]
pub struct SymbolRules {
    pub allow_all_except: bool,
    /// Ignored when `allow_all_except` is set.
    pub allowed: &'static [&'static str],
    pub restricted: &'static [&'static str],
}

const ALLOW_ALL: SymbolRules = SymbolRules {
    allow_all_except: true,
    allowed: &[],
    restricted: &[],
};

const BASE_RULES: SymbolRules = SymbolRules {
    allow_all_except: false,
    allowed: &[
        "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber",
        "tostring", "type", "unpack", "_VERSION", "xpcall",
    ],
    restricted: &[],
};

const MATH_RULES: SymbolRules = SymbolRules {
    allow_all_except: true,
    allowed: &[],
    restricted: &["random", "randomseed"],
};

const OS_RULES: SymbolRules = SymbolRules {
    allow_all_except: false,
    allowed: &["clock", "difftime", "time"],
    restricted: &[],
};

const STRING_RULES: SymbolRules = SymbolRules {
    allow_all_except: true,
    allowed: &[],
    restricted: &["dump"],
};

/// Projection rules for `lib`, or `None` when the library is not loadable
/// into any sandbox (`debug`, `io`, `package`, `ffi`, `jit`, `bit32`, `utf8`).
pub fn rules_for(lib: LuaLib) -> Option<&'static SymbolRules> {
    match lib {
        LuaLib::Base => Some(&BASE_RULES),
        LuaLib::Coroutine | LuaLib::Table => Some(&ALLOW_ALL),
        LuaLib::Math => Some(&MATH_RULES),
        LuaLib::Os => Some(&OS_RULES),
        LuaLib::String => Some(&STRING_RULES),
        _ => None,
    }
}
