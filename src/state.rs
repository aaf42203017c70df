use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bridge::ProtocolBridge;
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::model::Project;
use crate::registry::Registry;
use crate::resolver::{FallbackInterpreter, KeywordInterpreter, LlmInterpreter, Resolver, TextInterpreter};
use crate::session::LocalSession;
use crate::settings::Settings;

// ── Application State ──────────────────────────────────────────────

/// Everything the human surface and the protocol bridge share: one registry,
/// one editing session and the single dispatcher in front of it.
pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<Registry>,
    pub session: Arc<LocalSession>,
    pub dispatcher: Arc<Dispatcher>,
    pub resolver: Resolver,
    pub config_dir: PathBuf,
}

impl AppState {
    /// Build the pipeline from settings. `project` names a project file to
    /// open; without one the sample project is edited in memory.
    pub fn new(settings: Settings, config_dir: PathBuf, project: Option<&Path>) -> Result<Self, AppError> {
        let session = Arc::new(match project {
            Some(path) => LocalSession::open(path)?,
            None => LocalSession::new(Project::sample()),
        });
        Self::with_session(settings, config_dir, session)
    }

    pub fn with_session(
        settings: Settings,
        config_dir: PathBuf,
        session: Arc<LocalSession>,
    ) -> Result<Self, AppError> {
        let registry = Arc::new(Registry::builtin()?);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            session.clone(),
            settings.feedback_enabled,
        ));
        let interpreter = build_interpreter(&settings)?;
        tracing::info!(
            interpreter = interpreter.name(),
            commands = registry.len(),
            "pipeline ready"
        );
        let resolver = Resolver::new(registry.clone(), interpreter, settings.ambiguity_tolerance);
        Ok(Self {
            settings,
            registry,
            session,
            dispatcher,
            resolver,
            config_dir,
        })
    }

    /// A protocol bridge over this state's dispatcher, auditing to the config
    /// directory.
    pub fn bridge(&self) -> Result<ProtocolBridge, AppError> {
        if !self.settings.protocol_enabled {
            return Err(AppError::Config {
                message: "the protocol bridge is disabled (protocol_enabled = false)".into(),
            });
        }
        Ok(ProtocolBridge::new(self.dispatcher.clone(), &self.settings)
            .with_audit_dir(self.config_dir.clone()))
    }

    /// Write the project back to its file, if it has one.
    pub fn save(&self) -> Result<(), AppError> {
        self.session.save()
    }
}

/// Keyword matching always; the LLM only as a fallback when one is configured.
fn build_interpreter(settings: &Settings) -> Result<Arc<dyn TextInterpreter>, AppError> {
    let keyword: Arc<dyn TextInterpreter> = Arc::new(KeywordInterpreter::new()?);
    let Some(llm) = &settings.llm else {
        return Ok(keyword);
    };
    match LlmInterpreter::new(llm, settings) {
        Ok(interpreter) => Ok(Arc::new(FallbackInterpreter::new(keyword, Arc::new(interpreter)))),
        Err(e) => {
            tracing::warn!(error = %e, "LLM interpreter unavailable, using keywords only");
            Ok(keyword)
        }
    }
}
