use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: strip `.` components, resolve `..` against
/// parent components and drop trailing separators. Unlike `canonicalize`
/// this never touches the filesystem, so it works for deleted files.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Prefix check over whole components, so `/media/tvx` is not considered
/// to be under `/media/tv`.
pub fn path_has_prefix(path: &Path, prefix: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(prefix))
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// True for symlinks whose target no longer exists.
pub fn is_broken_symlink(path: &Path) -> bool {
    path.is_symlink() && !path.exists()
}

/// Display name for a folder in notifications. Generic season-style folder
/// names are qualified with their parent so "Season 01" becomes
/// "Show Name - Season 01".
pub fn display_folder_name(folder: &Path) -> String {
    let name = file_name(folder);
    let generic = name.eq_ignore_ascii_case("specials")
        || name.eq_ignore_ascii_case("extras")
        || is_season_folder(&name);
    if generic {
        if let Some(parent) = folder.parent().and_then(|p| p.file_name()) {
            return format!("{} - {}", parent.to_string_lossy(), name);
        }
    }
    name
}

fn is_season_folder(name: &str) -> bool {
    match name.to_ascii_lowercase().strip_prefix("season") {
        Some(rest) => {
            let rest = rest.trim();
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dots_and_trailing_separators() {
        assert_eq!(
            normalize_path(Path::new("/media/./tv/")),
            PathBuf::from("/media/tv")
        );
        assert_eq!(
            normalize_path(Path::new("/media/tv/../movies")),
            PathBuf::from("/media/movies")
        );
    }

    #[test]
    fn prefix_check_respects_component_boundaries() {
        assert!(path_has_prefix(
            Path::new("/media/tv/Show"),
            Path::new("/media/tv")
        ));
        assert!(!path_has_prefix(
            Path::new("/media/tvx/Show"),
            Path::new("/media/tv")
        ));
    }

    #[test]
    fn season_folders_are_qualified_with_parent() {
        assert_eq!(
            display_folder_name(Path::new("/media/tv/The Wire/Season 01")),
            "The Wire - Season 01"
        );
        assert_eq!(
            display_folder_name(Path::new("/media/tv/The Wire/Specials")),
            "The Wire - Specials"
        );
        assert_eq!(
            display_folder_name(Path::new("/media/movies/Heat (1995)")),
            "Heat (1995)"
        );
    }

    #[test]
    fn season_detection_requires_numeric_suffix() {
        assert!(is_season_folder("Season 2"));
        assert!(is_season_folder("season 10"));
        assert!(!is_season_folder("Seasoning"));
        assert!(!is_season_folder("Season finale"));
    }
}
