//! Apply functions for the built-in editing commands.
//!
//! Each function reads what it needs from the session, computes the new
//! state, calls [`ApplyContext::checkpoint`] and only then writes back. The
//! returned [`Applied`] carries the concrete effect (for feedback) and the
//! record needed to undo it.

use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::model::{format_timecode, Marker, Playback, Project, RenderJob, Timeline, Transition};

use super::params::BoundParams;
use super::{Applied, ApplyContext, UndoRecord};

fn effect(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn track_param(params: &BoundParams) -> Result<usize, AppError> {
    let track = params.integer("track").unwrap_or(0);
    usize::try_from(track).map_err(|_| AppError::invalid("track", "must not be negative"))
}

/// Fastest supported playback speed.
const MAX_PLAYBACK_SPEED: f64 = 16.0;

/// Explicit position, or the playhead.
fn position_param(params: &BoundParams, project: &Project) -> Result<f64, AppError> {
    Ok(params
        .seconds("position", project.frame_rate)?
        .unwrap_or(project.timeline.playhead))
}

fn check_playhead_target(position: f64, timeline: &Timeline, fps: f64) -> Result<(), AppError> {
    if position < 0.0 {
        return Err(AppError::validation(format!(
            "{:.3}s is before the start of the timeline",
            position
        )));
    }
    let end = timeline.duration();
    if end > 0.0 && position > end {
        return Err(AppError::validation(format!(
            "{} is past the end of the timeline ({})",
            format_timecode(position, fps),
            format_timecode(end, fps)
        )));
    }
    Ok(())
}

pub(super) fn cut_clip(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let track = track_param(params)?;
    let position = position_param(params, &project)?;
    let fps = project.frame_rate;

    let before = project.timeline.clone();
    let mut timeline = project.timeline;
    let clip_name = timeline.clip_at(track, position)?.name.clone();
    let (left, right) = timeline.split_clip(track, position)?;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "clip": clip_name,
            "track": track,
            "position": position,
            "timecode": format_timecode(position, fps),
            "leftClip": left.0,
            "rightClip": right.0,
        })),
        undo: Some(UndoRecord::Timeline(Box::new(before))),
    })
}

pub(super) fn add_transition(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let track = track_param(params)?;
    let position = position_param(params, &project)?;
    let fps = project.frame_rate;
    let kind = params.choice("type").unwrap_or("cross-dissolve").to_string();
    let duration = params.number("durationSeconds").unwrap_or(1.0);

    let before = project.timeline.clone();
    let mut timeline = project.timeline;
    let at = timeline
        .nearest_edit_point(track, position)?
        .ok_or_else(|| {
            AppError::validation(format!(
                "Track {track} has no edit point to place a transition on"
            ))
        })?;
    timeline.add_transition(Transition {
        kind: kind.clone(),
        track,
        at,
        duration,
    })?;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "type": kind,
            "durationSeconds": duration,
            "track": track,
            "position": at,
            "timecode": format_timecode(at, fps),
        })),
        undo: Some(UndoRecord::Timeline(Box::new(before))),
    })
}

pub(super) fn add_marker(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let position = position_param(params, &project)?;
    let fps = project.frame_rate;
    let marker = Marker {
        position,
        name: params.text("name").unwrap_or("Marker").to_string(),
        color: params.choice("color").unwrap_or("blue").to_string(),
        note: params.text("note").map(str::to_string),
    };

    let before = project.timeline.clone();
    let mut timeline = project.timeline;
    let summary = json!({
        "name": marker.name,
        "color": marker.color,
        "note": marker.note,
        "position": position,
        "timecode": format_timecode(position, fps),
    });
    timeline.add_marker(marker, fps)?;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(summary),
        undo: Some(UndoRecord::Timeline(Box::new(before))),
    })
}

pub(super) fn move_playhead(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let fps = project.frame_rate;
    let position = params
        .seconds("position", fps)?
        .ok_or_else(|| AppError::MissingParameter {
            name: "position".into(),
        })?;
    let mut timeline = project.timeline;
    check_playhead_target(position, &timeline, fps)?;
    let previous = timeline.playhead;
    timeline.playhead = position;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "position": position,
            "timecode": format_timecode(position, fps),
            "previous": format_timecode(previous, fps),
        })),
        undo: Some(UndoRecord::Playhead(previous)),
    })
}

pub(super) fn delete_clip(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let track = track_param(params)?;
    let position = position_param(params, &project)?;
    let fps = project.frame_rate;

    let before = project.timeline.clone();
    let mut timeline = project.timeline;
    let removed = timeline.remove_clip_at(track, position)?;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "clip": removed.name,
            "track": track,
            "position": position,
            "timecode": format_timecode(position, fps),
        })),
        undo: Some(UndoRecord::Timeline(Box::new(before))),
    })
}

pub(super) fn rename_clip(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let track = track_param(params)?;
    let position = position_param(params, &project)?;
    let new_name = params
        .text("name")
        .ok_or_else(|| AppError::MissingParameter { name: "name".into() })?
        .to_string();

    let id = project.timeline.clip_at(track, position)?.id;
    let original = ctx.session.clip(track, id)?;
    let mut renamed = original.clone();
    renamed.name.clone_from(&new_name);

    ctx.checkpoint()?;
    ctx.session.set_clip(track, renamed)?;

    Ok(Applied {
        effect: effect(json!({
            "clip": original.name,
            "name": new_name,
            "track": track,
            "timecode": format_timecode(position, project.frame_rate),
        })),
        undo: Some(UndoRecord::Clip {
            track,
            clip: Box::new(original),
        }),
    })
}

pub(super) fn queue_render(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let mut project = ctx.session.project()?;
    let preset = params.text("preset").unwrap_or("H.264 Master").to_string();
    let id = project.render_queue.iter().map(|j| j.id).max().unwrap_or(0) + 1;
    let job = RenderJob {
        id,
        preset: preset.clone(),
        timeline: project.timeline.name.clone(),
    };
    let timeline_name = job.timeline.clone();
    project.render_queue.push(job);

    ctx.checkpoint()?;
    ctx.session.set_project(project)?;

    Ok(Applied {
        effect: effect(json!({
            "jobId": id,
            "preset": preset,
            "timeline": timeline_name,
        })),
        undo: None,
    })
}

/// Read the transport state, change it and write it back.
fn change_playback(
    ctx: &ApplyContext<'_>,
    update: impl FnOnce(Playback) -> Result<Playback, AppError>,
) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let fps = project.frame_rate;
    let mut timeline = project.timeline;
    let previous = timeline.playback;
    let playback = update(previous)?;
    timeline.playback = playback;
    let playhead = timeline.playhead;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "state": playback.state_label(),
            "speed": playback.speed,
            "previousState": previous.state_label(),
            "previousSpeed": previous.speed,
            "timecode": format_timecode(playhead, fps),
        })),
        undo: Some(UndoRecord::Playback(previous)),
    })
}

pub(super) fn start_playback(ctx: &ApplyContext<'_>, _params: &BoundParams) -> Result<Applied, AppError> {
    change_playback(ctx, |p| Ok(Playback { playing: true, ..p }))
}

pub(super) fn stop_playback(ctx: &ApplyContext<'_>, _params: &BoundParams) -> Result<Applied, AppError> {
    change_playback(ctx, |p| Ok(Playback { playing: false, ..p }))
}

pub(super) fn toggle_playback(ctx: &ApplyContext<'_>, _params: &BoundParams) -> Result<Applied, AppError> {
    change_playback(ctx, |p| {
        Ok(Playback {
            playing: !p.playing,
            ..p
        })
    })
}

pub(super) fn set_playback_speed(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let speed = params
        .number("speed")
        .ok_or_else(|| AppError::MissingParameter { name: "speed".into() })?;
    if speed > MAX_PLAYBACK_SPEED {
        return Err(AppError::invalid(
            "speed",
            format!("must be at most {MAX_PLAYBACK_SPEED}x"),
        ));
    }
    change_playback(ctx, |p| Ok(Playback { speed, ..p }))
}

/// Step the playhead by whole frames, staying on the frame grid.
#[allow(clippy::cast_precision_loss)]
pub(super) fn jump_frames(ctx: &ApplyContext<'_>, params: &BoundParams) -> Result<Applied, AppError> {
    let project = ctx.session.project()?;
    let fps = project.frame_rate;
    let frames = params
        .integer("frames")
        .ok_or_else(|| AppError::MissingParameter { name: "frames".into() })?;
    let mut timeline = project.timeline;
    let previous = timeline.playhead;
    let position = ((previous * fps).round() + frames as f64) / fps;
    check_playhead_target(position, &timeline, fps)?;
    timeline.playhead = position;

    ctx.checkpoint()?;
    ctx.session.set_timeline(timeline)?;

    Ok(Applied {
        effect: effect(json!({
            "frames": frames,
            "position": position,
            "timecode": format_timecode(position, fps),
            "previous": format_timecode(previous, fps),
        })),
        undo: Some(UndoRecord::Playhead(previous)),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::super::params::validate;
    use super::super::{CancelFlag, CommandKind};
    use super::*;
    use crate::session::{EditingSession, LocalSession};

    fn run(session: &LocalSession, kind: CommandKind, args: Value) -> Result<Applied, AppError> {
        let def = kind.definition();
        let params = validate(def.params, args.as_object().unwrap()).unwrap();
        let cancel = CancelFlag::new();
        kind.apply(&ApplyContext::new(session, &cancel), &params)
    }

    #[test]
    fn cut_at_playhead_reports_timecode_and_undoes() {
        let session = LocalSession::new(Project::sample());
        let applied = run(&session, CommandKind::CutClip, json!({})).unwrap();
        assert_eq!(applied.effect["timecode"], "00:00:05:00");
        assert_eq!(applied.effect["clip"], "Interview A");
        assert_eq!(session.timeline().unwrap().tracks[0].clips.len(), 4);

        applied.undo.unwrap().revert(&session).unwrap();
        assert_eq!(session.timeline().unwrap(), Project::sample().timeline);
    }

    #[test]
    fn cancelled_apply_leaves_state_untouched() {
        let session = LocalSession::new(Project::sample());
        let def = CommandKind::CutClip.definition();
        let params = validate(def.params, &Map::new()).unwrap();
        let cancel = CancelFlag::new();
        assert!(cancel.cancel());
        let err = CommandKind::CutClip
            .apply(&ApplyContext::new(&session, &cancel), &params)
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(session.timeline().unwrap(), Project::sample().timeline);
    }

    #[test]
    fn transition_lands_on_nearest_edit_point() {
        let session = LocalSession::new(Project::sample());
        let applied = run(
            &session,
            CommandKind::AddTransition,
            json!({ "type": "Cross Dissolve", "durationSeconds": 1.5, "position": 18 }),
        )
        .unwrap();
        assert_eq!(applied.effect["timecode"], "00:00:20:00");
        let timeline = session.timeline().unwrap();
        assert_eq!(timeline.transitions.len(), 1);
        assert_eq!(timeline.transitions[0].kind, "cross-dissolve");
        assert!((timeline.transitions[0].duration - 1.5).abs() < 1e-9);
    }

    #[test]
    fn transition_without_edit_point_fails() {
        let session = LocalSession::new(Project::sample());
        let err = run(&session, CommandKind::AddTransition, json!({ "track": 1 })).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn marker_uses_defaults() {
        let session = LocalSession::new(Project::sample());
        run(&session, CommandKind::AddMarker, json!({})).unwrap();
        let marker = &session.timeline().unwrap().markers[0];
        assert_eq!(marker.name, "Marker");
        assert_eq!(marker.color, "blue");
        assert!((marker.position - 5.0).abs() < 1e-9);
    }

    #[test]
    fn playhead_move_is_bounded_and_revertible() {
        let session = LocalSession::new(Project::sample());
        assert!(run(&session, CommandKind::MovePlayhead, json!({ "position": 99 })).is_err());
        let applied = run(
            &session,
            CommandKind::MovePlayhead,
            json!({ "position": "00:00:10:12" }),
        )
        .unwrap();
        assert!((session.timeline().unwrap().playhead - 10.5).abs() < 1e-9);
        applied.undo.unwrap().revert(&session).unwrap();
        assert!((session.timeline().unwrap().playhead - 5.0).abs() < 1e-9);
    }

    #[test]
    fn rename_goes_through_clip_access() {
        let session = LocalSession::new(Project::sample());
        let applied = run(
            &session,
            CommandKind::RenameClip,
            json!({ "name": "Opening", "position": 1 }),
        )
        .unwrap();
        assert_eq!(applied.effect["clip"], "Interview A");
        assert_eq!(session.timeline().unwrap().tracks[0].clips[0].name, "Opening");
        applied.undo.unwrap().revert(&session).unwrap();
        assert_eq!(session.timeline().unwrap().tracks[0].clips[0].name, "Interview A");
    }

    #[test]
    fn delete_then_undo_restores_clip() {
        let session = LocalSession::new(Project::sample());
        let applied = run(&session, CommandKind::DeleteClip, json!({ "position": 14 })).unwrap();
        assert_eq!(applied.effect["clip"], "B-Roll City");
        assert_eq!(session.timeline().unwrap().tracks[0].clips.len(), 2);
        applied.undo.unwrap().revert(&session).unwrap();
        assert_eq!(session.timeline().unwrap(), Project::sample().timeline);
    }

    #[test]
    fn render_has_no_undo_record() {
        let session = LocalSession::new(Project::sample());
        let applied = run(&session, CommandKind::QueueRender, json!({})).unwrap();
        assert!(applied.undo.is_none());
        assert_eq!(applied.effect["jobId"], 1);
        assert_eq!(session.project().unwrap().render_queue.len(), 1);
    }

    #[test]
    fn playback_transport_changes_and_reverts() {
        let session = LocalSession::new(Project::sample());
        let started = run(&session, CommandKind::StartPlayback, json!({})).unwrap();
        assert_eq!(started.effect["state"], "playing");
        assert_eq!(started.effect["timecode"], "00:00:05:00");
        assert!(session.timeline().unwrap().playback.playing);

        let toggled = run(&session, CommandKind::TogglePlayback, json!({})).unwrap();
        assert_eq!(toggled.effect["state"], "stopped");
        assert!(!session.timeline().unwrap().playback.playing);
        toggled.undo.unwrap().revert(&session).unwrap();
        assert!(session.timeline().unwrap().playback.playing);

        let stopped = run(&session, CommandKind::StopPlayback, json!({})).unwrap();
        assert_eq!(stopped.effect["previousState"], "playing");
        stopped.undo.unwrap().revert(&session).unwrap();
        started.undo.unwrap().revert(&session).unwrap();
        assert_eq!(session.timeline().unwrap(), Project::sample().timeline);
    }

    #[test]
    fn playback_speed_is_bounded_and_revertible() {
        let session = LocalSession::new(Project::sample());
        let err = run(&session, CommandKind::SetPlaybackSpeed, json!({ "speed": 40 })).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter { ref name, .. } if name == "speed"));

        let applied = run(&session, CommandKind::SetPlaybackSpeed, json!({ "speed": 2 })).unwrap();
        assert!((session.timeline().unwrap().playback.speed - 2.0).abs() < 1e-9);
        assert_eq!(applied.effect["previousSpeed"], 1.0);
        applied.undo.unwrap().revert(&session).unwrap();
        assert!((session.timeline().unwrap().playback.speed - 1.0).abs() < 1e-9);
    }

    #[test]
    fn frame_jumps_stay_on_the_timeline() {
        let session = LocalSession::new(Project::sample());
        let applied = run(&session, CommandKind::JumpFrames, json!({ "frames": 12 })).unwrap();
        assert_eq!(applied.effect["timecode"], "00:00:05:12");
        assert!((session.timeline().unwrap().playhead - 5.5).abs() < 1e-9);

        run(&session, CommandKind::JumpFrames, json!({ "frames": -36 })).unwrap();
        assert!((session.timeline().unwrap().playhead - 4.0).abs() < 1e-9);

        assert!(run(&session, CommandKind::JumpFrames, json!({ "frames": -200 })).is_err());
        assert!(run(&session, CommandKind::JumpFrames, json!({ "frames": 24 * 60 })).is_err());

        applied.undo.unwrap().revert(&session).unwrap();
        assert!((session.timeline().unwrap().playhead - 5.0).abs() < 1e-9);
    }

    #[test]
    fn impossible_frame_count_is_rejected() {
        let session = LocalSession::new(Project::sample());
        let err = run(
            &session,
            CommandKind::MovePlayhead,
            json!({ "position": "00:00:01:99" }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter { ref name, .. } if name == "position"));
        let err = run(&session, CommandKind::CutClip, json!({ "position": "00:00:02:24" })).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter { .. }));
        assert_eq!(session.timeline().unwrap(), Project::sample().timeline);
    }

    #[test]
    fn offline_session_surfaces_unavailable() {
        let session = LocalSession::new(Project::sample());
        session.set_online(false);
        let err = run(&session, CommandKind::CutClip, json!({})).unwrap_err();
        assert!(matches!(err, AppError::SessionUnavailable { .. }));
    }
}
