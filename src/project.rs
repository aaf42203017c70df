use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Project;

/// Project file format version.
const PROJECT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid project: {0}")]
    InvalidProject(String),
}

#[derive(Serialize)]
struct ProjectFileRef<'a> {
    version: u32,
    project: &'a Project,
}

#[derive(Deserialize)]
struct ProjectFile {
    version: u32,
    project: Project,
}

/// Per-file mutex map to serialize concurrent writes to the same path.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Atomically write bytes to a file: write a `.tmp` sibling, fsync, keep the
/// previous version as `.bak`, then rename into place. Writers to the same
/// path are serialized.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ProjectError> {
    let lock = FILE_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = lock.lock();

    let file_name = path.file_name().unwrap_or_default();

    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    // Backup is best-effort
    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }

    fs::rename(&tmp_path, path)?;

    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProjectError> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

// ── Save / Load ─────────────────────────────────────────────────────

/// Save a project as a single versioned JSON file.
pub fn save_project(project: &Project, path: &Path) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_json(
        path,
        &ProjectFileRef {
            version: PROJECT_VERSION,
            project,
        },
    )
}

/// Load a project file written by [`save_project`].
pub fn load_project(path: &Path) -> Result<Project, ProjectError> {
    let file: ProjectFile = read_json(path)?;
    if file.version > PROJECT_VERSION {
        return Err(ProjectError::InvalidProject(format!(
            "Project version {} is newer than supported version {}",
            file.version, PROJECT_VERSION
        )));
    }
    if !(file.project.frame_rate.is_finite() && file.project.frame_rate > 0.0) {
        return Err(ProjectError::InvalidProject(format!(
            "Frame rate must be positive, got {}",
            file.project.frame_rate
        )));
    }
    Ok(file.project)
}
