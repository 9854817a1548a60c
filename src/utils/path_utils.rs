use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const PROJECT_MANIFEST: &str = "platformio.ini";

/// Expands `~` and `$VAR` references in a path string. Unset variables are
/// an error rather than an empty string.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    shellexpand::full(path_str)
        .map(|cow_str| PathBuf::from(cow_str.as_ref()))
        .map_err(|e| AppError::InvalidPath(format!("Failed to expand path '{}': {}", path_str, e)))
}

/// Makes `path_str` absolute against `root` and folds `.`/`..` lexically.
fn normalize_path(path_str: &str, root: &Path) -> Result<PathBuf, AppError> {
    let expanded = expand_tilde_path_buf(path_str)?;
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };

    let mut components: Vec<Component> = Vec::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            other => components.push(other),
        }
    }
    let folded: PathBuf = components.iter().collect();

    // dunce keeps Windows paths free of the \\?\ prefix
    Ok(dunce::canonicalize(&folded).unwrap_or(folded))
}

/// Resolves the project a job runs in. `None` selects `root`.
pub fn resolve_project_dir(
    requested: Option<&str>,
    root: &Path,
    require_manifest: bool,
) -> Result<PathBuf, AppError> {
    let dir = match requested {
        Some(raw) if !raw.trim().is_empty() => normalize_path(raw.trim(), root)?,
        _ => root.to_path_buf(),
    };
    debug!(project_dir = %dir.display(), "Resolved project directory");

    if !dir.is_dir() {
        return Err(AppError::InvalidPath(format!(
            "Project directory does not exist: {}",
            dir.display()
        )));
    }
    if require_manifest && !dir.join(PROJECT_MANIFEST).is_file() {
        return Err(AppError::InvalidPath(format!(
            "No {} found in {}",
            PROJECT_MANIFEST,
            dir.display()
        )));
    }
    Ok(dir)
}
