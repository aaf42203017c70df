//! The editing-application session the commands act on.
//!
//! `EditingSession` is the seam to the real application. `LocalSession`
//! implements it in memory, optionally backed by a project file, and can be
//! taken offline to exercise the "application unreachable" paths.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::AppError;
use crate::model::{Clip, ClipId, Project, Timeline};

/// Read and write access to the state of one open project. Every call may fail
/// with [`AppError::SessionUnavailable`] when the application cannot be reached.
pub trait EditingSession: Send + Sync {
    fn project(&self) -> Result<Project, AppError>;
    fn set_project(&self, project: Project) -> Result<(), AppError>;
    fn timeline(&self) -> Result<Timeline, AppError>;
    fn set_timeline(&self, timeline: Timeline) -> Result<(), AppError>;
    fn clip(&self, track: usize, id: ClipId) -> Result<Clip, AppError>;
    /// Replace the clip with the same id on `track`.
    fn set_clip(&self, track: usize, clip: Clip) -> Result<(), AppError>;
}

pub struct LocalSession {
    project: Mutex<Project>,
    online: AtomicBool,
    path: Option<PathBuf>,
}

impl LocalSession {
    pub fn new(project: Project) -> Self {
        Self {
            project: Mutex::new(project),
            online: AtomicBool::new(true),
            path: None,
        }
    }

    /// Open a project file. A missing file starts from the sample project and
    /// is created on the first [`save`](Self::save).
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let project = if path.exists() {
            crate::project::load_project(path)?
        } else {
            tracing::info!(path = %path.display(), "project file not found, starting from sample project");
            Project::sample()
        };
        Ok(Self {
            project: Mutex::new(project),
            online: AtomicBool::new(true),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the project back to its file. No-op for in-memory sessions.
    pub fn save(&self) -> Result<(), AppError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.project.lock().clone();
        crate::project::save_project(&snapshot, path)?;
        tracing::debug!(path = %path.display(), "project saved");
        Ok(())
    }

    /// Simulate the application going away (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn with_project<F, R>(&self, f: F) -> Result<R, AppError>
    where
        F: FnOnce(&mut Project) -> Result<R, AppError>,
    {
        if !self.online.load(Ordering::SeqCst) {
            return Err(AppError::SessionUnavailable {
                message: "editing application is not responding".into(),
            });
        }
        let mut guard = self.project.lock();
        f(&mut guard)
    }
}

impl EditingSession for LocalSession {
    fn project(&self) -> Result<Project, AppError> {
        self.with_project(|p| Ok(p.clone()))
    }

    fn set_project(&self, project: Project) -> Result<(), AppError> {
        self.with_project(|p| {
            *p = project;
            Ok(())
        })
    }

    fn timeline(&self) -> Result<Timeline, AppError> {
        self.with_project(|p| Ok(p.timeline.clone()))
    }

    fn set_timeline(&self, timeline: Timeline) -> Result<(), AppError> {
        self.with_project(|p| {
            p.timeline = timeline;
            Ok(())
        })
    }

    fn clip(&self, track: usize, id: ClipId) -> Result<Clip, AppError> {
        self.with_project(|p| {
            p.timeline
                .track(track)?
                .clips
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound {
                    what: format!("Clip {} on track {track}", id.0),
                })
        })
    }

    fn set_clip(&self, track: usize, clip: Clip) -> Result<(), AppError> {
        self.with_project(|p| {
            let slot = p
                .timeline
                .tracks
                .get_mut(track)
                .and_then(|t| t.clips.iter_mut().find(|c| c.id == clip.id))
                .ok_or_else(|| AppError::NotFound {
                    what: format!("Clip {} on track {track}", clip.id.0),
                })?;
            *slot = clip;
            Ok(())
        })
    }
}
