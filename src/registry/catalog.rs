//! JSON tool descriptors and help text rendered from the registry.

use serde_json::{json, Map, Value};

use super::{CommandSummary, Registry};
use crate::bridge::CapabilitySet;
use crate::command::params::{Constraint, ParamSpec, ParamType};

/// JSON Schema for a parameter list.
pub fn param_schema(params: &[ParamSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for spec in params {
        let mut prop = Map::new();
        match spec.ty {
            ParamType::Text => {
                prop.insert("type".into(), json!("string"));
            }
            ParamType::Number => {
                prop.insert("type".into(), json!("number"));
            }
            ParamType::Integer => {
                prop.insert("type".into(), json!("integer"));
            }
            ParamType::Boolean => {
                prop.insert("type".into(), json!("boolean"));
            }
            ParamType::Timecode => {
                prop.insert("type".into(), json!(["number", "string"]));
            }
            ParamType::Choice(options) => {
                prop.insert("type".into(), json!("string"));
                prop.insert("enum".into(), json!(options));
            }
        }
        match spec.constraint {
            Constraint::Positive => {
                prop.insert("exclusiveMinimum".into(), json!(0));
            }
            Constraint::NonNegative => {
                prop.insert("minimum".into(), json!(0));
            }
            Constraint::None => {}
        }
        prop.insert("description".into(), json!(spec.description));
        if let Some(default) = spec.default {
            prop.insert("default".into(), default.to_json());
        }
        if spec.required {
            required.push(spec.name);
        }
        properties.insert(spec.name.to_string(), Value::Object(prop));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

pub fn tool_descriptor(summary: &CommandSummary) -> Value {
    json!({
        "name": summary.identifier,
        "description": summary.description,
        "inputSchema": param_schema(summary.params),
        "supportsRevert": summary.supports_revert,
    })
}

/// Tool descriptors for every command visible under `capabilities`.
pub fn tools_json(registry: &Registry, capabilities: CapabilitySet) -> Value {
    Value::Array(
        registry
            .list(capabilities)
            .map(|s| tool_descriptor(&s))
            .collect(),
    )
}

/// Two tiers: no topic lists every command, a command name shows its
/// parameters.
pub fn help_text(registry: &Registry, topic: Option<&str>) -> String {
    match topic {
        None => {
            let mut lines = vec!["Available commands:".to_string()];
            for summary in registry.list(CapabilitySet::all()) {
                lines.push(format!("  {:<16} {}", summary.identifier, summary.description));
            }
            lines.push(String::new());
            lines.push("Type `help <command>` for its parameters, or describe an edit in plain words.".into());
            lines.push("Built-ins: undo, history, tools, show, exit.".into());
            lines.join("\n")
        }
        Some(topic) => {
            let Ok(def) = registry.lookup(topic.trim()) else {
                return format!("Unknown topic: \"{topic}\". Type `help` to list commands.");
            };
            let mut lines = vec![
                format!("{}: {}", def.identifier, def.description),
                format!("Undoable: {}", if def.supports_revert { "yes" } else { "no" }),
            ];
            if def.params.is_empty() {
                lines.push("No parameters.".into());
            } else {
                lines.push("Parameters:".into());
                for spec in def.params {
                    let mut line = format!(
                        "  {} ({}{}): {}",
                        spec.name,
                        spec.ty.label(),
                        if spec.required { ", required" } else { "" },
                        spec.description
                    );
                    if let ParamType::Choice(options) = spec.ty {
                        line.push_str(&format!(" [{}]", options.join(", ")));
                    }
                    if let Some(default) = spec.default {
                        line.push_str(&format!(" (default {})", default.to_json()));
                    }
                    lines.push(line);
                }
            }
            lines.join("\n")
        }
    }
}
