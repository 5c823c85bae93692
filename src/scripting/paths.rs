/// `scripting/paths.rs` - filesystem policy for script loading
///
/// A sandbox resolves every script name against a fixed root and admits the
/// result only when it falls under one of the allowed prefixes. Precompiled
/// bytecode is refused by signature, never by extension.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::util::fs::{normalize, starts_with_any};

/// Four-byte magic prefix of precompiled Lua chunks (ESC + "Lua").
pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";

/// True when the file starts with the bytecode signature. Short or unreadable
/// files are not bytecode.
pub fn is_bytecode(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut header = [0u8; LUA_SIGNATURE.len()];
    match file.read(&mut header) {
        Ok(n) if n == header.len() => header == *LUA_SIGNATURE,
        _ => false,
    }
}

// ── ScriptPaths ───────────────────────────────────────────────────────────────

/// Root and allow-list for script file resolution.
///
/// The root must be absolute; an empty root disables file loading entirely.
/// Allow-list entries are stored absolute and normalized; relative entries
/// are joined to the root first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptPaths {
    root: PathBuf,
    allowed: Vec<PathBuf>,
}

impl ScriptPaths {
    /// Build a policy. A root that is empty or not absolute clears both the
    /// root and the allow-list, so nothing can be loaded.
    pub fn new(root: &Path, allowed: &[PathBuf]) -> Self {
        if root.as_os_str().is_empty() || !root.is_absolute() {
            if !root.as_os_str().is_empty() {
                log::warn!(
                    "[lua sandbox] scripts root {:?} is not absolute, file loading disabled",
                    root
                );
            }
            return Self::disabled();
        }

        let root = normalize(root);
        let allowed: Vec<PathBuf> = if allowed.is_empty() {
            // No explicit allow-list: scripts under the root itself.
            vec![root.clone()]
        } else {
            allowed
                .iter()
                .map(|path| {
                    if path.is_absolute() {
                        normalize(path)
                    } else {
                        normalize(&root.join(path))
                    }
                })
                .collect()
        };
        Self { root, allowed }
    }

    /// No root, no allow-list: every admission check fails.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed(&self) -> &[PathBuf] {
        &self.allowed
    }

    pub fn is_enabled(&self) -> bool {
        !self.root.as_os_str().is_empty()
    }

    /// Append to the allow-list. Silently ignored while file loading is
    /// disabled; relative paths are joined to the root before storing.
    pub fn allow(&mut self, path: &Path) {
        if !self.is_enabled() {
            return;
        }
        let path = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.root.join(path))
        };
        self.allowed.push(path);
    }

    /// Resolve a script name: relative names are joined to the root, then the
    /// result is lexically normalized.
    pub fn resolve(&self, name: &Path) -> PathBuf {
        if name.is_absolute() || !self.is_enabled() {
            normalize(name)
        } else {
            normalize(&self.root.join(name))
        }
    }

    /// Admission predicate: some allow-list entry is a whole-component prefix
    /// of the (already resolved) path. An empty allow-list admits nothing.
    pub fn is_allowed(&self, path: &Path) -> bool {
        starts_with_any(path, &self.allowed)
    }
}
