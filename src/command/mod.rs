pub mod edit;
pub mod params;

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::bridge::CapabilitySet;
use crate::error::AppError;
use crate::model::{Clip, Playback, Timeline};
use crate::session::EditingSession;

use params::{BoundParams, DefaultValue, ParamSpec, ParamType};

pub const TRANSITION_TYPES: &[&str] = &["cross-dissolve", "fade", "wipe", "push", "slide"];
pub const MARKER_COLORS: &[&str] = &[
    "blue", "green", "red", "yellow", "purple", "cyan", "magenta", "white", "black",
];

// ── Parameter schemas ───────────────────────────────────────────

const POSITION: ParamSpec = ParamSpec::optional(
    "position",
    ParamType::Timecode,
    "Timeline position in seconds or HH:MM:SS:FF. Defaults to the playhead.",
);
const TRACK: ParamSpec = ParamSpec::optional("track", ParamType::Integer, "Zero-based video track index")
    .with_default(DefaultValue::Integer(0))
    .non_negative();

const CUT_CLIP_PARAMS: &[ParamSpec] = &[POSITION, TRACK];
const ADD_TRANSITION_PARAMS: &[ParamSpec] = &[
    ParamSpec::optional("type", ParamType::Choice(TRANSITION_TYPES), "Transition style")
        .with_default(DefaultValue::Text("cross-dissolve")),
    ParamSpec::optional("durationSeconds", ParamType::Number, "Transition length in seconds")
        .with_default(DefaultValue::Number(1.0))
        .positive(),
    ParamSpec::optional(
        "position",
        ParamType::Timecode,
        "Place the transition on the edit point nearest this position. Defaults to the playhead.",
    ),
    TRACK,
];
const ADD_MARKER_PARAMS: &[ParamSpec] = &[
    ParamSpec::optional("name", ParamType::Text, "Marker name").with_default(DefaultValue::Text("Marker")),
    ParamSpec::optional("color", ParamType::Choice(MARKER_COLORS), "Marker color")
        .with_default(DefaultValue::Text("blue")),
    ParamSpec::optional("note", ParamType::Text, "Free-form note attached to the marker"),
    POSITION,
];
const MOVE_PLAYHEAD_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "position",
    ParamType::Timecode,
    "Target position in seconds or HH:MM:SS:FF",
)];
const DELETE_CLIP_PARAMS: &[ParamSpec] = &[POSITION, TRACK];
const RENAME_CLIP_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("name", ParamType::Text, "New clip name"),
    POSITION,
    TRACK,
];
const QUEUE_RENDER_PARAMS: &[ParamSpec] = &[ParamSpec::optional(
    "preset",
    ParamType::Text,
    "Render preset name",
)
.with_default(DefaultValue::Text("H.264 Master"))];

const JUMP_FRAMES_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "frames",
    ParamType::Integer,
    "Frames to move the playhead; negative moves it back",
)];
const SET_PLAYBACK_SPEED_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "speed",
    ParamType::Number,
    "Playback speed as a multiple of real time, e.g. 0.5 or 2",
)
.positive()];

// ── Command metadata ────────────────────────────────────────────

/// Static description of a command: what it is called, what it takes and how
/// it describes itself.
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub kind: CommandKind,
    pub identifier: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    /// Template with `{key}` / `{key|fallback}` placeholders, filled from the
    /// parameters and, after execution, from the concrete effect.
    pub preview: &'static str,
    pub supports_revert: bool,
    /// Capabilities a remote session must have negotiated to see this command.
    pub requires: CapabilitySet,
}

impl CommandDef {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Preview text before execution. A bound `position` is shown as timecode.
    pub fn preview_text(&self, params: &BoundParams, frame_rate: f64) -> String {
        let mut values = params.to_json_map();
        if let Some(position) = params.time("position") {
            values.insert(
                "timecode".into(),
                Value::String(crate::model::format_timecode(
                    position.to_seconds(frame_rate),
                    frame_rate,
                )),
            );
        }
        render_template(self.preview, &values)
    }

    /// Feedback after execution. Effect values take precedence over parameters.
    pub fn feedback(&self, params: &BoundParams, effect: &Map<String, Value>) -> String {
        let mut values = params.to_json_map();
        values.extend(effect.iter().map(|(k, v)| (k.clone(), v.clone())));
        render_template(self.preview, &values)
    }
}

// ── define_commands! macro ──────────────────────────────────────

/// Single source of truth for the built-in commands. Generates the
/// `CommandKind` enum (in registration order), its `definition()` table and
/// the `apply()` dispatch.
macro_rules! define_commands {
    (
        $(
            $variant:ident => $id:literal {
                description: $desc:literal,
                params: $params:expr,
                preview: $preview:literal,
                revert: $revert:literal,
                apply: $apply:path $(,)?
            }
        )*
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum CommandKind {
            $( $variant, )*
        }

        impl CommandKind {
            pub const ALL: &'static [CommandKind] = &[ $( CommandKind::$variant, )* ];

            pub fn identifier(self) -> &'static str {
                match self {
                    $( CommandKind::$variant => $id, )*
                }
            }

            pub fn definition(self) -> CommandDef {
                match self {
                    $(
                        CommandKind::$variant => CommandDef {
                            kind: self,
                            identifier: $id,
                            description: $desc,
                            params: $params,
                            preview: $preview,
                            supports_revert: $revert,
                            requires: CapabilitySet::TOOLS,
                        },
                    )*
                }
            }

            /// Perform the command against the session.
            pub fn apply(self, ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
                match self {
                    $( CommandKind::$variant => $apply(ctx, params), )*
                }
            }
        }
    };
}

define_commands! {
    CutClip => "cut-clip" {
        description: "Cut (split) the clip under the playhead or a given position",
        params: CUT_CLIP_PARAMS,
        preview: "Cut {clip|the clip} on track {track|0} at {timecode|the playhead}",
        revert: true,
        apply: edit::cut_clip,
    }
    AddTransition => "add-transition" {
        description: "Add a transition on the edit point nearest the playhead",
        params: ADD_TRANSITION_PARAMS,
        preview: "Add {type|cross-dissolve} transition ({durationSeconds|1}s) on track {track|0} at {timecode|the nearest edit point}",
        revert: true,
        apply: edit::add_transition,
    }
    AddMarker => "add-marker" {
        description: "Add a marker at the playhead or a given position",
        params: ADD_MARKER_PARAMS,
        preview: "Add {color|blue} marker \"{name|Marker}\" at {timecode|the playhead}",
        revert: true,
        apply: edit::add_marker,
    }
    MovePlayhead => "move-playhead" {
        description: "Move the playhead to a position",
        params: MOVE_PLAYHEAD_PARAMS,
        preview: "Move playhead to {timecode|the requested position}",
        revert: true,
        apply: edit::move_playhead,
    }
    DeleteClip => "delete-clip" {
        description: "Delete the clip under the playhead or a given position",
        params: DELETE_CLIP_PARAMS,
        preview: "Delete {clip|the clip} on track {track|0} at {timecode|the playhead}",
        revert: true,
        apply: edit::delete_clip,
    }
    RenameClip => "rename-clip" {
        description: "Rename the clip under the playhead or a given position",
        params: RENAME_CLIP_PARAMS,
        preview: "Rename {clip|the clip} to \"{name}\"",
        revert: true,
        apply: edit::rename_clip,
    }
    QueueRender => "queue-render" {
        description: "Add the current timeline to the render queue",
        params: QUEUE_RENDER_PARAMS,
        preview: "Queue render of {timeline|the current timeline} with preset \"{preset|H.264 Master}\"",
        revert: false,
        apply: edit::queue_render,
    }
    StartPlayback => "start-playback" {
        description: "Start playback from the playhead",
        params: &[],
        preview: "Start playback at {timecode|the playhead}",
        revert: true,
        apply: edit::start_playback,
    }
    StopPlayback => "stop-playback" {
        description: "Stop playback, leaving the playhead where it is",
        params: &[],
        preview: "Stop playback at {timecode|the playhead}",
        revert: true,
        apply: edit::stop_playback,
    }
    TogglePlayback => "toggle-playback" {
        description: "Start playback if stopped, stop it if playing",
        params: &[],
        preview: "Playback {state|toggled} at {timecode|the playhead}",
        revert: true,
        apply: edit::toggle_playback,
    }
    JumpFrames => "jump-frames" {
        description: "Move the playhead forward or back by a number of frames",
        params: JUMP_FRAMES_PARAMS,
        preview: "Jump {frames} frames to {timecode|the new position}",
        revert: true,
        apply: edit::jump_frames,
    }
    SetPlaybackSpeed => "set-playback-speed" {
        description: "Change the playback speed",
        params: SET_PLAYBACK_SPEED_PARAMS,
        preview: "Set playback speed to {speed}x",
        revert: true,
        apply: edit::set_playback_speed,
    }
}

// ── Execution context ───────────────────────────────────────────

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared between a running apply and the caller waiting on it. Exactly one
/// side wins: either the apply finishes first or the waiter cancels first.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicU8);

impl CancelFlag {
    pub fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    /// Returns false when the apply already finished.
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns false when the waiter cancelled first.
    pub fn finish(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CANCELLED
    }
}

pub struct ApplyContext<'a> {
    pub session: &'a dyn EditingSession,
    cancel: &'a CancelFlag,
}

impl<'a> ApplyContext<'a> {
    pub fn new(session: &'a dyn EditingSession, cancel: &'a CancelFlag) -> Self {
        Self { session, cancel }
    }

    /// Call immediately before the first mutation.
    pub fn checkpoint(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What an apply did, and how to take it back.
#[derive(Debug, Clone)]
pub struct Applied {
    pub effect: Map<String, Value>,
    pub undo: Option<UndoRecord>,
}

/// Enough state to reverse one applied command.
#[derive(Debug, Clone)]
pub enum UndoRecord {
    Timeline(Box<Timeline>),
    Playhead(f64),
    Playback(Playback),
    Clip { track: usize, clip: Box<Clip> },
}

impl UndoRecord {
    pub fn revert(self, session: &dyn EditingSession) -> Result<(), AppError> {
        match self {
            UndoRecord::Timeline(before) => session.set_timeline(*before),
            UndoRecord::Playhead(position) => {
                let mut timeline = session.timeline()?;
                timeline.playhead = position;
                session.set_timeline(timeline)
            }
            UndoRecord::Playback(playback) => {
                let mut timeline = session.timeline()?;
                timeline.playback = playback;
                session.set_timeline(timeline)
            }
            UndoRecord::Clip { track, clip } => session.set_clip(track, *clip),
        }
    }
}

// ── Templates ───────────────────────────────────────────────────

/// Fill `{key}` and `{key|fallback}` placeholders. Unknown keys without a
/// fallback render as `?`.
pub fn render_template(template: &str, values: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (before, after_open) = rest.split_at(open);
        out.push_str(before);
        let Some(close) = after_open.find('}') else {
            out.push_str(after_open);
            return out;
        };
        let inner = after_open.get(1..close).unwrap_or_default();
        let (key, fallback) = match inner.split_once('|') {
            Some((k, f)) => (k, Some(f)),
            None => (inner, None),
        };
        match values.get(key).filter(|v| !v.is_null()) {
            Some(value) => out.push_str(&display_value(value)),
            None => out.push_str(fallback.unwrap_or("?")),
        }
        rest = after_open.get(close + 1..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_kebab_case_and_unique() {
        let ids: Vec<&str> = CommandKind::ALL.iter().map(|k| k.identifier()).collect();
        for id in &ids {
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c == '-'), "{id}");
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[test]
    fn definition_matches_identifier() {
        for kind in CommandKind::ALL {
            let def = kind.definition();
            assert_eq!(def.identifier, kind.identifier());
            assert_eq!(def.kind, *kind);
        }
        assert!(!CommandKind::QueueRender.definition().supports_revert);
    }

    #[test]
    fn template_uses_values_then_fallbacks() {
        let values = json!({ "clip": "Interview A", "track": 0, "skip": null });
        let values = values.as_object().unwrap();
        assert_eq!(
            render_template("Cut {clip|the clip} on track {track} at {timecode|the playhead}", values),
            "Cut Interview A on track 0 at the playhead"
        );
        assert_eq!(render_template("{skip|none} {missing}", values), "none ?");
        assert_eq!(render_template("unclosed {brace", values), "unclosed {brace");
    }

    #[test]
    fn cancel_and_finish_are_exclusive() {
        let flag = CancelFlag::new();
        assert!(flag.finish());
        assert!(!flag.cancel());
        assert!(!flag.is_cancelled());

        let flag = CancelFlag::new();
        assert!(flag.cancel());
        assert!(!flag.finish());
        assert!(flag.is_cancelled());
    }
}
