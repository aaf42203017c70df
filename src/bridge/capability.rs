//! Capability sets exchanged during session negotiation.

use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Features a protocol peer supports. A session may only use what both
    /// sides declared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilitySet: u8 {
        /// Read-only views of project state.
        const RESOURCES = 1 << 0;
        /// Command invocation.
        const TOOLS = 1 << 1;
        /// Canned prompt templates.
        const PROMPTS = 1 << 2;
        /// Peer-side model sampling. Declared for compatibility only.
        const SAMPLING = 1 << 3;
    }
}

const TOKENS: [(&str, CapabilitySet); 4] = [
    ("resources", CapabilitySet::RESOURCES),
    ("tools", CapabilitySet::TOOLS),
    ("prompts", CapabilitySet::PROMPTS),
    ("sampling", CapabilitySet::SAMPLING),
];

impl CapabilitySet {
    /// Build a set from wire tokens. Unknown tokens are ignored so newer peers
    /// can advertise features we do not know about.
    pub fn parse_tokens<'a, I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = Self::empty();
        for token in tokens {
            let token = token.trim().to_ascii_lowercase();
            match TOKENS.iter().find(|(name, _)| *name == token) {
                Some((_, flag)) => set |= *flag,
                None => tracing::debug!(token = %token, "ignoring unknown capability"),
            }
        }
        set
    }

    pub fn tokens(self) -> Vec<&'static str> {
        TOKENS
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Capabilities usable in a session: those both peers declared.
    pub fn negotiate(self, remote: Self) -> Self {
        self & remote
    }

    /// Wire name of a single flag, for error messages.
    pub fn label(self) -> String {
        self.tokens().join(",")
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tokens = self.tokens();
        let mut seq = serializer.serialize_seq(Some(tokens.len()))?;
        for token in tokens {
            seq.serialize_element(token)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tokens = Vec::<String>::deserialize(deserializer)?;
        Ok(Self::parse_tokens(tokens.iter().map(String::as_str)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tokens_are_ignored() {
        let set = CapabilitySet::parse_tokens(["tools", "Resources", "telepathy"]);
        assert_eq!(set, CapabilitySet::TOOLS | CapabilitySet::RESOURCES);
    }

    #[test]
    fn negotiation_is_intersection() {
        let local = CapabilitySet::RESOURCES | CapabilitySet::TOOLS | CapabilitySet::PROMPTS;
        let remote = CapabilitySet::TOOLS | CapabilitySet::SAMPLING;
        assert_eq!(local.negotiate(remote), CapabilitySet::TOOLS);
        assert!(local.negotiate(CapabilitySet::empty()).is_empty());
    }

    #[test]
    fn serializes_as_token_list() {
        let set = CapabilitySet::PROMPTS | CapabilitySet::TOOLS;
        assert_eq!(
            serde_json::to_value(set).unwrap(),
            serde_json::json!(["tools", "prompts"])
        );
        let back: CapabilitySet = serde_json::from_str(r#"["prompts","tools","x"]"#).unwrap();
        assert_eq!(back, set);
    }
}
