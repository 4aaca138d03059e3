use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `root` and confirm the result stays inside it.
///
/// Relative paths are joined to `root`. `.` and `..` are folded lexically;
/// a path that climbs above `root` yields `None`. Symlinks are not followed,
/// the backend confines those.
pub fn confine(root: &Path, path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = normalize(&joined)?;
    let root = normalize(root)?;
    normalized.starts_with(&root).then_some(normalized)
}

/// Lexical normalization. `None` when `..` climbs past the filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
