//! The command registry: identifier → definition, plus filtered listings
//! used for help text and protocol tool advertisement.
//!
//! Built once at startup from the fixed built-in set and shared read-only
//! behind an `Arc` afterwards.

pub mod catalog;

use indexmap::IndexMap;
use serde::Serialize;

use crate::bridge::CapabilitySet;
use crate::command::params::ParamSpec;
use crate::command::{CommandDef, CommandKind};
use crate::error::AppError;

#[derive(Debug, Default)]
pub struct Registry {
    commands: IndexMap<&'static str, CommandDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in command, in declaration order.
    pub fn builtin() -> Result<Self, AppError> {
        let mut registry = Self::new();
        for kind in CommandKind::ALL {
            registry.register(kind.definition())?;
        }
        tracing::debug!(commands = registry.len(), "command registry built");
        Ok(registry)
    }

    pub fn register(&mut self, def: CommandDef) -> Result<(), AppError> {
        if self.commands.contains_key(def.identifier) {
            return Err(AppError::DuplicateCommand {
                identifier: def.identifier.to_string(),
            });
        }
        self.commands.insert(def.identifier, def);
        Ok(())
    }

    pub fn lookup(&self, identifier: &str) -> Result<&CommandDef, AppError> {
        self.commands
            .get(identifier)
            .ok_or_else(|| AppError::UnknownCommand {
                identifier: identifier.to_string(),
            })
    }

    /// Registration index, used to rank exact confidence ties.
    pub fn position(&self, identifier: &str) -> Option<usize> {
        self.commands.get_index_of(identifier)
    }

    /// Summaries of the commands whose requirements are covered by `filter`.
    /// The iterator is lazy and can be cloned to restart it.
    pub fn list(&self, filter: CapabilitySet) -> CommandList<'_> {
        CommandList {
            inner: self.commands.values(),
            filter,
        }
    }

    pub fn definitions(&self) -> impl Iterator<Item = &CommandDef> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// What a listing exposes about a command.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub identifier: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub params: &'static [ParamSpec],
    pub supports_revert: bool,
}

impl CommandSummary {
    fn of(def: &CommandDef) -> Self {
        Self {
            identifier: def.identifier,
            description: def.description,
            params: def.params,
            supports_revert: def.supports_revert,
        }
    }
}

#[derive(Clone)]
pub struct CommandList<'a> {
    inner: indexmap::map::Values<'a, &'static str, CommandDef>,
    filter: CapabilitySet,
}

impl Iterator for CommandList<'_> {
    type Item = CommandSummary;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.inner
            .by_ref()
            .find(|def| filter.contains(def.requires))
            .map(CommandSummary::of)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_matching_identifier() {
        let registry = Registry::builtin().unwrap();
        for def in registry.definitions() {
            assert_eq!(registry.lookup(def.identifier).unwrap().identifier, def.identifier);
        }
        assert!(matches!(
            registry.lookup("explode-timeline"),
            Err(AppError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = Registry::builtin().unwrap();
        let before = registry.len();
        let err = registry
            .register(CommandKind::CutClip.definition())
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateCommand { identifier } if identifier == "cut-clip"));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn listing_is_filtered_and_restartable() {
        let registry = Registry::builtin().unwrap();
        let all = registry.list(CapabilitySet::TOOLS);
        let restarted = all.clone();
        assert_eq!(all.count(), CommandKind::ALL.len());
        assert_eq!(restarted.map(|s| s.identifier).next(), Some("cut-clip"));

        assert_eq!(registry.list(CapabilitySet::RESOURCES).count(), 0);
        assert_eq!(registry.list(CapabilitySet::empty()).count(), 0);
    }

    #[test]
    fn position_follows_registration_order() {
        let registry = Registry::builtin().unwrap();
        assert_eq!(registry.position("cut-clip"), Some(0));
        assert!(registry.position("add-marker") > registry.position("add-transition"));
        assert_eq!(registry.position("nope"), None);
    }
}
