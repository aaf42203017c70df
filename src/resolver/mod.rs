//! Free text → ranked command intents.
//!
//! Semantic parsing is delegated to a [`TextInterpreter`]. The resolver only
//! normalizes what comes back: non-finite confidences are dropped, the rest
//! clamped to `0..=1`; candidates naming unregistered commands or carrying
//! slots that do not type-check are discarded; the survivors are ranked and
//! checked for ambiguity.

pub mod keyword;
pub mod llm;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::command::params::type_check;
use crate::command::CommandDef;
use crate::error::AppError;
use crate::registry::Registry;

pub use keyword::KeywordInterpreter;
pub use llm::LlmInterpreter;

/// Candidates returned with an ambiguity error.
const AMBIGUOUS_TOP_N: usize = 3;
/// Slack for float noise when comparing a confidence gap to the tolerance.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// A ranked guess at what the user meant. Parameters may be partial; the
/// dispatcher binds them against the full schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub command: String,
    pub params: Map<String, Value>,
    pub confidence: f64,
}

impl Intent {
    pub fn new(command: impl Into<String>, confidence: f64) -> Self {
        Self {
            command: command.into(),
            params: Map::new(),
            confidence,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }
}

/// Turns an utterance into candidate intents for the given commands.
/// Implementations are untrusted: output is validated by the [`Resolver`].
pub trait TextInterpreter: Send + Sync {
    fn name(&self) -> &'static str;

    fn interpret<'a>(
        &'a self,
        text: &'a str,
        commands: &'a [CommandDef],
    ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>>;
}

pub struct Resolver {
    registry: Arc<Registry>,
    interpreter: Arc<dyn TextInterpreter>,
    tolerance: f64,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>, interpreter: Arc<dyn TextInterpreter>, tolerance: f64) -> Self {
        Self {
            registry,
            interpreter,
            tolerance,
        }
    }

    /// Resolve `text` into intents, highest confidence first.
    pub async fn resolve(&self, text: &str) -> Result<Vec<Intent>, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::NoMatch { text: String::new() });
        }
        let commands: Vec<CommandDef> = self.registry.definitions().copied().collect();
        let raw = self.interpreter.interpret(text, &commands).await?;
        tracing::debug!(
            interpreter = self.interpreter.name(),
            candidates = raw.len(),
            "interpreted input"
        );
        self.rank(text, raw)
    }

    /// Normalize, filter and rank raw interpreter output.
    pub fn rank(&self, text: &str, candidates: Vec<Intent>) -> Result<Vec<Intent>, AppError> {
        let mut ranked: Vec<(usize, Intent)> = Vec::with_capacity(candidates.len());
        for mut intent in candidates {
            if !intent.confidence.is_finite() {
                tracing::debug!(command = %intent.command, "dropping candidate with non-finite confidence");
                continue;
            }
            intent.confidence = intent.confidence.clamp(0.0, 1.0);
            let Ok(def) = self.registry.lookup(&intent.command) else {
                tracing::debug!(command = %intent.command, "dropping candidate for unknown command");
                continue;
            };
            if let Err(e) = type_check(def.params, &intent.params) {
                tracing::debug!(command = %intent.command, error = %e, "dropping candidate with bad slots");
                continue;
            }
            let order = self.registry.position(&intent.command).unwrap_or(usize::MAX);
            ranked.push((order, intent));
        }

        ranked.sort_by(|(oa, a), (ob, b)| b.confidence.total_cmp(&a.confidence).then(oa.cmp(ob)));

        let mut intents: Vec<Intent> = Vec::with_capacity(ranked.len());
        for (_, intent) in ranked {
            if !intents.iter().any(|i| i.command == intent.command) {
                intents.push(intent);
            }
        }

        if intents.is_empty() {
            return Err(AppError::NoMatch {
                text: text.to_string(),
            });
        }
        let ambiguous = matches!(
            intents.as_slice(),
            [first, second, ..] if first.confidence - second.confidence <= self.tolerance + TOLERANCE_EPSILON
        );
        if ambiguous {
            intents.truncate(AMBIGUOUS_TOP_N);
            return Err(AppError::AmbiguousInput { candidates: intents });
        }
        Ok(intents)
    }
}

/// Asks `secondary` only when `primary` yields nothing or fails.
pub struct FallbackInterpreter {
    primary: Arc<dyn TextInterpreter>,
    secondary: Arc<dyn TextInterpreter>,
}

impl FallbackInterpreter {
    pub fn new(primary: Arc<dyn TextInterpreter>, secondary: Arc<dyn TextInterpreter>) -> Self {
        Self { primary, secondary }
    }
}

impl TextInterpreter for FallbackInterpreter {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn interpret<'a>(
        &'a self,
        text: &'a str,
        commands: &'a [CommandDef],
    ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>> {
        Box::pin(async move {
            match self.primary.interpret(text, commands).await {
                Ok(intents) if !intents.is_empty() => return Ok(intents),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(interpreter = self.primary.name(), error = %e, "primary interpreter failed");
                }
            }
            tracing::debug!(interpreter = self.secondary.name(), "falling back");
            self.secondary.interpret(text, commands).await
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Returns a fixed candidate list.
    struct Canned(Vec<Intent>);

    impl TextInterpreter for Canned {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn interpret<'a>(
            &'a self,
            _text: &'a str,
            _commands: &'a [CommandDef],
        ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>> {
            let out = self.0.clone();
            Box::pin(async move { Ok(out) })
        }
    }

    struct Failing;

    impl TextInterpreter for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn interpret<'a>(
            &'a self,
            _text: &'a str,
            _commands: &'a [CommandDef],
        ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>> {
            Box::pin(async {
                Err(AppError::Interpreter {
                    message: "offline".into(),
                })
            })
        }
    }

    fn resolver(candidates: Vec<Intent>) -> Resolver {
        Resolver::new(
            Arc::new(Registry::builtin().unwrap()),
            Arc::new(Canned(candidates)),
            0.05,
        )
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn close_confidences_are_ambiguous() {
        let r = resolver(vec![
            Intent::new("delete-clip", 0.81),
            Intent::new("add-marker", 0.79),
        ]);
        let err = r.resolve("get rid of that").await.unwrap_err();
        assert!(matches!(
            &err,
            AppError::AmbiguousInput { candidates }
                if candidates.len() == 2 && candidates[0].command == "delete-clip"
        ));
    }

    #[tokio::test]
    async fn clear_winner_comes_first() {
        let r = resolver(vec![
            Intent::new("add-marker", 0.40),
            Intent::new("cut-clip", 0.90),
        ]);
        let intents = r.resolve("cut here").await.unwrap();
        assert_eq!(intents[0].command, "cut-clip");
        assert_eq!(intents[1].command, "add-marker");
    }

    #[tokio::test]
    async fn ambiguity_keeps_top_three() {
        let r = resolver(vec![
            Intent::new("cut-clip", 0.7),
            Intent::new("delete-clip", 0.7),
            Intent::new("add-marker", 0.69),
            Intent::new("queue-render", 0.68),
        ]);
        let err = r.resolve("x").await.unwrap_err();
        let names: Vec<&str> = match &err {
            AppError::AmbiguousInput { candidates } => {
                candidates.iter().map(|c| c.command.as_str()).collect()
            }
            _ => Vec::new(),
        };
        // Exact tie broken by registration order.
        assert_eq!(names, ["cut-clip", "delete-clip", "add-marker"]);
    }

    #[tokio::test]
    async fn invalid_candidates_are_dropped() {
        let r = resolver(vec![
            Intent::new("launch-rocket", 0.99),
            Intent::new("add-transition", f64::NAN),
            Intent::new("move-playhead", 0.95).with_params(params(json!({ "position": "soon" }))),
            Intent::new("add-marker", 1.7).with_params(params(json!({ "color": "red" }))),
        ]);
        let intents = r.resolve("mark it red").await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, "add-marker");
        assert!((intents[0].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn nothing_bindable_is_no_match() {
        let r = resolver(vec![Intent::new("launch-rocket", 0.99)]);
        assert!(matches!(r.resolve("launch").await, Err(AppError::NoMatch { .. })));
        assert!(matches!(r.resolve("   ").await, Err(AppError::NoMatch { .. })));
    }

    #[tokio::test]
    async fn fallback_used_on_empty_or_error() {
        let winner = Arc::new(Canned(vec![Intent::new("cut-clip", 0.9)]));
        let registry = Registry::builtin().unwrap();
        let commands: Vec<CommandDef> = registry.definitions().copied().collect();

        let after_empty = FallbackInterpreter::new(Arc::new(Canned(Vec::new())), winner.clone());
        assert_eq!(after_empty.interpret("cut", &commands).await.unwrap().len(), 1);

        let after_error = FallbackInterpreter::new(Arc::new(Failing), winner.clone());
        assert_eq!(after_error.interpret("cut", &commands).await.unwrap().len(), 1);

        let primary_wins = FallbackInterpreter::new(
            Arc::new(Canned(vec![Intent::new("add-marker", 0.8)])),
            winner,
        );
        let out = primary_wins.interpret("mark", &commands).await.unwrap();
        assert_eq!(out[0].command, "add-marker");
    }
}
