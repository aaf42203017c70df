//! The human-facing line interface: free text in, feedback out.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::bridge::CapabilitySet;
use crate::describe::{describe_history, describe_project};
use crate::dispatcher::{Caller, CommandInvocation};
use crate::error::AppError;
use crate::registry::catalog::{help_text, tools_json};
use crate::resolver::Intent;
use crate::session::EditingSession;
use crate::state::AppState;

const PROMPT: &str = "edit> ";

/// Resolve free text and run the best candidate as the human caller.
pub async fn execute_text(state: &AppState, text: &str) -> Result<CommandInvocation, AppError> {
    let intents = state.resolver.resolve(text).await?;
    let Some(best) = intents.into_iter().next() else {
        return Err(AppError::NoMatch {
            text: text.to_string(),
        });
    };
    execute_intent(state, &best).await
}

async fn execute_intent(state: &AppState, intent: &Intent) -> Result<CommandInvocation, AppError> {
    let invocation = state
        .dispatcher
        .execute(&intent.command, &intent.params, Caller::Human, None)
        .await?;
    persist(state);
    Ok(invocation)
}

fn persist(state: &AppState) {
    if let Err(e) = state.save() {
        tracing::warn!(error = %e, "could not save project");
    }
}

/// One-line summary of an invocation for the terminal.
pub fn format_invocation(invocation: &CommandInvocation, json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(invocation).unwrap_or_default();
    }
    match &invocation.feedback {
        Some(feedback) => format!("#{} {}", invocation.sequence, feedback),
        None => format!("#{} {} {:?}", invocation.sequence, invocation.command, invocation.outcome).to_lowercase(),
    }
}

fn format_candidates(candidates: &[Intent]) -> String {
    let mut lines = vec!["That could mean several things:".to_string()];
    for (i, c) in candidates.iter().enumerate() {
        lines.push(format!("  {}) {} ({:.0}%)", i + 1, c.command, c.confidence * 100.0));
    }
    lines.push("Pick a number, or rephrase.".into());
    lines.join("\n")
}

pub struct Interactive<'a, W> {
    state: &'a AppState,
    out: W,
    json: bool,
    /// Candidates from the last ambiguous input, awaiting a numbered pick.
    pending: Vec<Intent>,
}

impl<'a, W: AsyncWrite + Unpin> Interactive<'a, W> {
    pub fn new(state: &'a AppState, out: W, json: bool) -> Self {
        Self {
            state,
            out,
            json,
            pending: Vec::new(),
        }
    }

    async fn say(&mut self, text: &str) -> Result<(), AppError> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }

    /// Read lines until EOF or `exit`.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<(), AppError> {
        let mut lines = input.lines();
        self.say(&help_text(&self.state.registry, None)).await?;
        loop {
            self.out.write_all(PROMPT.as_bytes()).await?;
            self.out.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !self.handle(line).await? {
                break;
            }
        }
        Ok(())
    }

    /// Handle one line. Returns `false` when the user asked to leave.
    async fn handle(&mut self, line: &str) -> Result<bool, AppError> {
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let reply = match word.to_lowercase().as_str() {
            "exit" | "quit" => return Ok(false),
            "help" => {
                let topic = Some(rest.trim()).filter(|t| !t.is_empty());
                Ok(help_text(&self.state.registry, topic))
            }
            "undo" if rest.is_empty() => self.state.dispatcher.undo().await.map(|inv| {
                persist(self.state);
                if self.json {
                    format_invocation(&inv, true)
                } else {
                    format!("Undid #{} {}", inv.sequence, inv.command)
                }
            }),
            "history" if rest.is_empty() => Ok(describe_history(&self.state.dispatcher.history())),
            "tools" if rest.is_empty() => Ok(serde_json::to_string_pretty(&tools_json(
                &self.state.registry,
                CapabilitySet::all(),
            ))
            .unwrap_or_default()),
            "show" if rest.is_empty() => self.state.session.project().map(|p| describe_project(&p)),
            _ => self.run_text(line).await,
        };

        match reply {
            Ok(text) => self.say(&text).await?,
            Err(AppError::AmbiguousInput { candidates }) => {
                self.say(&format_candidates(&candidates)).await?;
                self.pending = candidates;
            }
            Err(e) => {
                tracing::debug!(error = %e, class = ?e.class(), "command failed");
                self.say(&format!("Error: {e}")).await?;
            }
        }
        Ok(true)
    }

    async fn run_text(&mut self, line: &str) -> Result<String, AppError> {
        let pending = std::mem::take(&mut self.pending);
        let picked = line
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| pending.get(i));
        let invocation = match picked {
            Some(intent) => execute_intent(self.state, intent).await?,
            None => execute_text(self.state, line).await?,
        };
        Ok(format_invocation(&invocation, self.json))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn state() -> AppState {
        AppState::new(Settings::default(), std::env::temp_dir(), None).unwrap()
    }

    async fn session(state: &AppState, input: &str) -> String {
        let mut out = Vec::new();
        Interactive::new(state, &mut out, false)
            .run(input.as_bytes())
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn cut_then_undo() {
        let state = state();
        let before = state.session.project().unwrap().timeline;
        let out = session(&state, "Cut the clip at the current position\nundo\nhistory\nexit\n").await;
        assert!(out.contains("00:00:05:00"));
        assert!(out.contains("Undid #1 cut-clip"));
        assert!(out.contains("#1 [reverted] cut-clip by human"));
        assert_eq!(state.session.project().unwrap().timeline, before);
    }

    #[tokio::test]
    async fn ambiguity_prompts_for_a_pick() {
        let state = state();
        let out = session(&state, "cut or delete\n2\n").await;
        assert!(out.contains("1) cut-clip"));
        assert!(out.contains("2) delete-clip"));
        let history = state.dispatcher.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "delete-clip");
    }

    #[tokio::test]
    async fn errors_do_not_end_the_session() {
        let state = state();
        let out = session(&state, "undo\nwhat a lovely day\nhelp add-marker\n").await;
        assert!(out.contains("Error: Nothing to undo"));
        assert!(out.contains("Error: No command matches"));
        assert!(out.contains("add-marker: "));
    }

    #[tokio::test]
    async fn execute_text_reports_no_match() {
        let state = state();
        assert!(matches!(
            execute_text(&state, "   ").await,
            Err(AppError::NoMatch { .. })
        ));
    }
}
