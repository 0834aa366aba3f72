use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above the root, so `/a/../../etc` becomes `/etc`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// `path` lies at or below `root` once both are normalized.
pub fn is_within(path: &Path, root: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_components_are_resolved() {
        assert_eq!(
            normalize_path(Path::new("/work/s1/../../../etc/shadow")),
            PathBuf::from("/etc/shadow")
        );
        assert_eq!(normalize_path(Path::new("/work/./s1/")), PathBuf::from("/work/s1"));
    }

    #[test]
    fn escaping_paths_are_not_within() {
        assert!(is_within(Path::new("/work/s1/out.txt"), Path::new("/work")));
        assert!(!is_within(Path::new("/work/../etc/passwd"), Path::new("/work")));
        assert!(!is_within(Path::new("/workshop"), Path::new("/work")));
    }
}
