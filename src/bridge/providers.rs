//! Collaborators behind `read-resource` and `get-prompt`.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::command::CommandDef;
use crate::describe::{describe_project, describe_timeline};
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::registry::Registry;
use crate::resolver::llm::system_prompt;

pub trait ResourceProvider: Send + Sync {
    /// Descriptors (`uri`, `name`, `mimeType`) of every readable resource.
    fn list(&self) -> Vec<Value>;
    fn read(&self, uri: &str) -> Result<Value, AppError>;
}

pub trait PromptProvider: Send + Sync {
    /// Descriptors (`name`, `description`) of every prompt.
    fn list(&self) -> Vec<Value>;
    fn get(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, AppError>;
}

pub const PROJECT_URI: &str = "project://info";
pub const TIMELINE_URI: &str = "timeline://current";
pub const HISTORY_URI: &str = "history://invocations";

/// Project, timeline and history views over the editing session.
pub struct EditorResources {
    dispatcher: Arc<Dispatcher>,
}

impl EditorResources {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl ResourceProvider for EditorResources {
    fn list(&self) -> Vec<Value> {
        vec![
            json!({ "uri": PROJECT_URI, "name": "Project summary", "mimeType": "text/plain" }),
            json!({ "uri": TIMELINE_URI, "name": "Current timeline", "mimeType": "application/json" }),
            json!({ "uri": HISTORY_URI, "name": "Command history", "mimeType": "application/json" }),
        ]
    }

    fn read(&self, uri: &str) -> Result<Value, AppError> {
        let session = self.dispatcher.session();
        let contents = match uri {
            PROJECT_URI => Value::String(describe_project(&session.project()?)),
            TIMELINE_URI => {
                let project = session.project()?;
                json!({
                    "summary": describe_timeline(&project.timeline, project.frame_rate),
                    "timeline": project.timeline,
                })
            }
            HISTORY_URI => serde_json::to_value(self.dispatcher.history())
                .map_err(|e| AppError::validation(e.to_string()))?,
            other => {
                return Err(AppError::NotFound {
                    what: format!("resource {other}"),
                })
            }
        };
        Ok(json!({ "uri": uri, "contents": contents }))
    }
}

pub const EDIT_ASSISTANT: &str = "edit-assistant";

/// Prompts an agent can fetch to drive the editor well.
pub struct AssistantPrompts {
    registry: Arc<Registry>,
}

impl AssistantPrompts {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl PromptProvider for AssistantPrompts {
    fn list(&self) -> Vec<Value> {
        vec![json!({
            "name": EDIT_ASSISTANT,
            "description": "System prompt describing the editing tools and how to call them",
            "arguments": [{ "name": "goal", "required": false }],
        })]
    }

    fn get(&self, name: &str, arguments: &Map<String, Value>) -> Result<Value, AppError> {
        if name != EDIT_ASSISTANT {
            return Err(AppError::NotFound {
                what: format!("prompt {name}"),
            });
        }
        let commands: Vec<CommandDef> = self.registry.definitions().copied().collect();
        let mut text = system_prompt(&commands);
        if let Some(goal) = arguments.get("goal").and_then(Value::as_str) {
            text.push_str(&format!("\n\nThe user's goal: {goal}"));
        }
        Ok(json!({
            "name": EDIT_ASSISTANT,
            "messages": [{ "role": "system", "content": text }],
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::model::Project;
    use crate::session::LocalSession;

    fn resources() -> EditorResources {
        let registry = Arc::new(Registry::builtin().unwrap());
        let session = Arc::new(LocalSession::new(Project::sample()));
        EditorResources::new(Arc::new(Dispatcher::new(registry, session, true)))
    }

    #[test]
    fn reads_each_resource() {
        let provider = resources();
        for descriptor in provider.list() {
            let uri = descriptor["uri"].as_str().unwrap();
            let value = provider.read(uri).unwrap();
            assert_eq!(value["uri"], uri);
        }
        let timeline = provider.read(TIMELINE_URI).unwrap();
        assert_eq!(timeline["contents"]["timeline"]["name"], "Main Edit");
        assert_eq!(provider.read(HISTORY_URI).unwrap()["contents"], json!([]));
    }

    #[test]
    fn unknown_resource_is_not_found() {
        assert!(matches!(
            resources().read("file:///etc/passwd"),
            Err(AppError::NotFound { .. })
        ));
    }

    #[test]
    fn prompt_includes_goal() {
        let prompts = AssistantPrompts::new(Arc::new(Registry::builtin().unwrap()));
        let mut args = Map::new();
        args.insert("goal".into(), json!("tighten the intro"));
        let prompt = prompts.get(EDIT_ASSISTANT, &args).unwrap();
        let content = prompt["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("cut-clip"));
        assert!(content.ends_with("tighten the intro"));
        assert!(prompts.get("other", &Map::new()).is_err());
    }
}
