//! Offline interpreter: phrase matching per command plus regex slot
//! extraction for the common parameters.

use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value};

use super::{Intent, TextInterpreter};
use crate::command::{CommandDef, MARKER_COLORS};
use crate::error::AppError;

const BASE_CONFIDENCE: f64 = 0.55;
const PHRASE_WEIGHT: f64 = 0.4;
/// Matched phrase words at which the phrase score saturates.
const SATURATING_WORDS: f64 = 3.0;
const SLOT_BONUS: f64 = 0.05;

const PHRASES: &[(&str, &[&str])] = &[
    ("cut-clip", &["cut the clip", "cut", "split", "razor", "blade"]),
    (
        "add-transition",
        &["add a transition", "transition", "cross dissolve", "dissolve", "crossfade", "wipe"],
    ),
    ("add-marker", &["add a marker", "marker", "bookmark", "flag this"]),
    (
        "move-playhead",
        &["move the playhead", "playhead", "go to", "jump to", "seek to", "skip to"],
    ),
    ("delete-clip", &["delete the clip", "delete", "remove", "get rid of"]),
    ("rename-clip", &["rename the clip", "rename", "name it", "call it"]),
    ("queue-render", &["queue a render", "render", "export", "bounce"]),
    ("start-playback", &["start playback", "play", "start playing", "resume"]),
    ("stop-playback", &["stop playback", "stop", "pause", "halt"]),
    ("toggle-playback", &["toggle playback", "toggle"]),
    ("jump-frames", &["step", "nudge", "frames", "frame"]),
    (
        "set-playback-speed",
        &["playback speed", "speed", "play at", "fast forward"],
    ),
];

const TIME: &str = r"(\d{1,2}:\d{2}:\d{2}(?:[:;]\d{1,2})?|\d+(?:\.\d+)?\s*(?:s|secs?|seconds?)?)";

struct CommandMatcher {
    identifier: String,
    phrases: Vec<(Regex, usize)>,
}

pub struct KeywordInterpreter {
    matchers: Vec<CommandMatcher>,
    transition_type: Regex,
    duration_lead: Regex,
    duration_trail: Regex,
    at_position: Regex,
    to_position: Regex,
    track: Regex,
    color: Regex,
    marker_name: Regex,
    rename_to: Regex,
    preset: Regex,
    frames: Regex,
    speed: Regex,
}

fn compile(pattern: &str) -> Result<Regex, AppError> {
    Regex::new(pattern).map_err(|e| AppError::Config {
        message: format!("bad keyword pattern {pattern:?}: {e}"),
    })
}

fn phrase_regex(phrase: &str) -> Result<(Regex, usize), AppError> {
    let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
    let pattern = format!(r"(?i)\b{}\b", words.join(r"\s+"));
    Ok((compile(&pattern)?, words.len()))
}

impl KeywordInterpreter {
    pub fn new() -> Result<Self, AppError> {
        let mut matchers = Vec::with_capacity(PHRASES.len());
        for (identifier, phrases) in PHRASES {
            let phrases = phrases
                .iter()
                .map(|p| phrase_regex(p))
                .collect::<Result<Vec<_>, _>>()?;
            matchers.push(CommandMatcher {
                identifier: (*identifier).to_string(),
                phrases,
            });
        }
        Ok(Self {
            matchers,
            transition_type: compile(
                r"(?i)\b(cross[- ]?dissolve|dissolve|cross[- ]?fade|fade|wipe|push|slide)\b",
            )?,
            duration_lead: compile(r"(?i)\b(?:for|lasting|of|over)\s+(\d+(?:\.\d+)?)\s*(?:s|secs?|seconds?)\b")?,
            duration_trail: compile(
                r"(?i)\b(\d+(?:\.\d+)?)[\s-]*(?:s|secs?|seconds?)\s+(?:long\s+)?(?:cross[- ]?dissolve|dissolve|cross[- ]?fade|fade|wipe|push|slide|transition)\b",
            )?,
            at_position: compile(&format!(r"(?i)\bat\s+{TIME}(?:\b|$)"))?,
            to_position: compile(&format!(r"(?i)\b(?:to|until)\s+{TIME}(?:\b|$)"))?,
            track: compile(r"(?i)\b(?:track|v)\s*(\d+)\b")?,
            color: compile(&format!(r"(?i)\b({})\b", MARKER_COLORS.join("|")))?,
            marker_name: compile(r#"(?i)(?:\b(?:called|named|labell?ed)\s+(?:"([^"]+)"|([\w-]+))|"([^"]+)")"#)?,
            rename_to: compile(r#"(?i)\bto\s+(?:"([^"]+)"|(.+?))[.!]?\s*$"#)?,
            preset: compile(r#"(?i)(?:\bpreset\s+(?:"([^"]+)"|([\w.-]+))|\b(?:with|using)\s+"([^"]+)")"#)?,
            frames: compile(
                r"(?i)(?:\b(back(?:wards?)?|forwards?|ahead)\s+)?([+-]?\d+)\s+frames?\b(?:\s+(back(?:wards?)?|forwards?|ahead|earlier|later))?",
            )?,
            speed: compile(r"(?i)(?:\b(\d+(?:\.\d+)?)\s*(?:x|times)\b|\bspeed\s+(?:to\s+|of\s+)?(\d+(?:\.\d+)?)\b)")?,
        })
    }

    fn matcher_for<'a>(&'a self, def: &CommandDef) -> Option<&'a CommandMatcher> {
        self.matchers.iter().find(|m| m.identifier == def.identifier)
    }

    /// Sum of words over every phrase that matched.
    fn phrase_words(&self, def: &CommandDef, text: &str) -> usize {
        match self.matcher_for(def) {
            Some(m) => m
                .phrases
                .iter()
                .filter(|(re, _)| re.is_match(text))
                .map(|(_, words)| words)
                .sum(),
            None => {
                let words: Vec<&str> = def.identifier.split('-').collect();
                let joined = words.join(" ");
                if text.to_lowercase().contains(&joined) {
                    words.len()
                } else {
                    0
                }
            }
        }
    }

    fn first_group(re: &Regex, text: &str) -> Option<String> {
        re.captures(text).and_then(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().trim().to_string())
        })
    }

    /// Signed frame count; a trailing or leading "back" steps backwards.
    fn frame_count(&self, text: &str) -> Option<i64> {
        let caps = self.frames.captures(text)?;
        let count = caps.get(2)?.as_str().parse::<i64>().ok()?;
        let backwards = [caps.get(1), caps.get(3)].into_iter().flatten().any(|m| {
            let word = m.as_str().to_lowercase();
            word.starts_with("back") || word == "earlier"
        });
        Some(if backwards { -count.abs() } else { count })
    }

    fn time_value(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.contains(':') {
            return Value::String(trimmed.to_string());
        }
        let digits = trimmed.trim_end_matches(|c: char| c.is_ascii_alphabetic()).trim();
        digits
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or_else(|| Value::String(trimmed.to_string()), Value::Number)
    }

    /// Every slot this interpreter can pull out of `text`, before filtering
    /// to the slots a command declares.
    fn extract(&self, def: &CommandDef, text: &str) -> Map<String, Value> {
        let mut slots = Map::new();

        if let Some(kind) = Self::first_group(&self.transition_type, text) {
            let kind = kind.to_lowercase().replace(' ', "-");
            let kind = match kind.as_str() {
                "dissolve" | "crossdissolve" | "cross-fade" | "crossfade" => "cross-dissolve".to_string(),
                _ => kind,
            };
            slots.insert("type".into(), Value::String(kind));
        }

        let duration = Self::first_group(&self.duration_lead, text)
            .or_else(|| Self::first_group(&self.duration_trail, text))
            .and_then(|d| d.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64);
        if let Some(duration) = duration {
            slots.insert("durationSeconds".into(), Value::Number(duration));
        }

        let position = Self::first_group(&self.at_position, text).or_else(|| {
            (def.identifier == "move-playhead")
                .then(|| Self::first_group(&self.to_position, text))
                .flatten()
        });
        if let Some(position) = position {
            slots.insert("position".into(), Self::time_value(&position));
        }

        if let Some(track) = Self::first_group(&self.track, text).and_then(|t| t.parse::<u64>().ok()) {
            // Editors number tracks from one.
            slots.insert("track".into(), Value::from(track.saturating_sub(1)));
        }

        if let Some(color) = Self::first_group(&self.color, text) {
            slots.insert("color".into(), Value::String(color.to_lowercase()));
        }

        let name = if def.identifier == "rename-clip" {
            Self::first_group(&self.rename_to, text)
        } else {
            Self::first_group(&self.marker_name, text)
        };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            slots.insert("name".into(), Value::String(name));
        }

        if let Some(preset) = Self::first_group(&self.preset, text) {
            slots.insert("preset".into(), Value::String(preset));
        }

        if let Some(frames) = self.frame_count(text) {
            slots.insert("frames".into(), Value::from(frames));
        }

        let speed = Self::first_group(&self.speed, text)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64);
        if let Some(speed) = speed {
            slots.insert("speed".into(), Value::Number(speed));
        }

        slots.retain(|key, _| def.param(key).is_some());
        slots
    }

    fn interpret_sync(&self, text: &str, commands: &[CommandDef]) -> Vec<Intent> {
        commands
            .iter()
            .filter_map(|def| {
                let words = self.phrase_words(def, text);
                if words == 0 {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)]
                let phrase_score = (words as f64 / SATURATING_WORDS).min(1.0);
                let slots = self.extract(def, text);
                let bonus = if slots.is_empty() { 0.0 } else { SLOT_BONUS };
                let confidence = (BASE_CONFIDENCE + PHRASE_WEIGHT * phrase_score + bonus).min(1.0);
                Some(Intent::new(def.identifier, confidence).with_params(slots))
            })
            .collect()
    }
}

impl TextInterpreter for KeywordInterpreter {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn interpret<'a>(
        &'a self,
        text: &'a str,
        commands: &'a [CommandDef],
    ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>> {
        let intents = self.interpret_sync(text, commands);
        Box::pin(async move { Ok(intents) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::Registry;

    fn interpret(text: &str) -> Vec<Intent> {
        let registry = Registry::builtin().unwrap();
        let commands: Vec<CommandDef> = registry.definitions().copied().collect();
        KeywordInterpreter::new().unwrap().interpret_sync(text, &commands)
    }

    fn find<'a>(intents: &'a [Intent], command: &str) -> &'a Intent {
        intents.iter().find(|i| i.command == command).unwrap()
    }

    #[test]
    fn cut_at_current_position() {
        let intents = interpret("Cut the clip at the current position");
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, "cut-clip");
        assert!(intents[0].params.is_empty());
        assert!(intents[0].confidence > 0.9);
    }

    #[test]
    fn transition_slots() {
        let intents = interpret("Add a 1.5 second cross dissolve at 00:00:20:00 on track 1");
        let intent = find(&intents, "add-transition");
        assert_eq!(intent.params["type"], "cross-dissolve");
        assert_eq!(intent.params["durationSeconds"], 1.5);
        assert_eq!(intent.params["position"], "00:00:20:00");
        assert_eq!(intent.params["track"], 0);
    }

    #[test]
    fn marker_slots() {
        let intents = interpret("add a red marker called Intro at 12.5s");
        let intent = find(&intents, "add-marker");
        assert_eq!(intent.params["color"], "red");
        assert_eq!(intent.params["name"], "Intro");
        assert_eq!(intent.params["position"], json!(12.5));
    }

    #[test]
    fn playhead_accepts_to() {
        let intents = interpret("jump to 00:01:02:03");
        let intent = find(&intents, "move-playhead");
        assert_eq!(intent.params["position"], "00:01:02:03");
    }

    #[test]
    fn rename_takes_rest_of_sentence() {
        let intents = interpret("rename the clip to Opening Shot.");
        let intent = find(&intents, "rename-clip");
        assert_eq!(intent.params["name"], "Opening Shot");
    }

    #[test]
    fn render_preset() {
        let intents = interpret("export with \"ProRes 422\"");
        let intent = find(&intents, "queue-render");
        assert_eq!(intent.params["preset"], "ProRes 422");
    }

    #[test]
    fn frame_steps_carry_direction() {
        let intents = interpret("step back 5 frames");
        assert_eq!(find(&intents, "jump-frames").params["frames"], -5);
        let intents = interpret("nudge 3 frames later");
        assert_eq!(find(&intents, "jump-frames").params["frames"], 3);
    }

    #[test]
    fn playback_phrases() {
        let intents = interpret("set playback speed to 2x");
        assert_eq!(find(&intents, "set-playback-speed").params["speed"], 2.0);

        let intents = interpret("pause");
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, "stop-playback");

        let intents = interpret("toggle playback");
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, "toggle-playback");
    }

    #[test]
    fn competing_verbs_score_alike() {
        let intents = interpret("cut or delete");
        let cut = find(&intents, "cut-clip").confidence;
        let delete = find(&intents, "delete-clip").confidence;
        assert!((cut - delete).abs() < 1e-9);
    }

    #[test]
    fn unrelated_text_yields_nothing() {
        assert!(interpret("what a lovely day").is_empty());
    }
}
