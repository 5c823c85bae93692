/// `util/fs.rs` - lexical path helpers
///
/// Admission checks for script paths work on lexically normalized paths and
/// whole path components; no filesystem access happens here.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.` components, resolve `..` against the
/// preceding component where possible, keep leading `..` of relative paths.
///
/// Mirrors `std::filesystem::path::lexically_normal` minus the trailing
/// separator (`a/b/` and `a/b` normalize to the same path).
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut absolute = false;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                absolute = true;
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let ends_in_name =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                if ends_in_name {
                    out.pop();
                } else if !absolute {
                    out.push("..");
                }
                // `..` above the root stays at the root.
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// True when `root` is a whole-component prefix of `path`, both taken in
/// normalized form. An empty `root` never matches.
pub fn starts_with(path: &Path, root: &Path) -> bool {
    if root.as_os_str().is_empty() {
        return false;
    }
    normalize(path).starts_with(normalize(root))
}

/// True when any of `roots` is a whole-component prefix of `path`.
pub fn starts_with_any<'a, I>(path: &Path, roots: I) -> bool
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    roots.into_iter().any(|root| starts_with(path, root))
}
