use crate::dispatcher::{CommandInvocation, Outcome};
use crate::model::{format_timecode, Project, Timeline};

/// Human-readable summary of the project: name, frame rate, timeline and render queue.
pub fn describe_project(project: &Project) -> String {
    let mut lines = Vec::new();

    lines.push(format!(
        "Project: {} ({}fps)",
        if project.name.is_empty() {
            "(untitled)"
        } else {
            &project.name
        },
        project.frame_rate
    ));
    lines.push(String::new());
    lines.push(describe_timeline(&project.timeline, project.frame_rate));

    if !project.render_queue.is_empty() {
        lines.push(format!("\nRender queue ({})", project.render_queue.len()));
        for job in &project.render_queue {
            lines.push(format!("  #{} {} ({})", job.id, job.preset, job.timeline));
        }
    }

    lines.join("\n")
}

/// Tracks with their clips, then markers and transitions, all in timecode.
pub fn describe_timeline(timeline: &Timeline, frame_rate: f64) -> String {
    let tc = |seconds: f64| format_timecode(seconds, frame_rate);
    let mut lines = Vec::new();

    lines.push(format!(
        "Timeline: {} ({} long, playhead at {})",
        timeline.name,
        tc(timeline.duration()),
        tc(timeline.playhead)
    ));

    for (i, track) in timeline.tracks.iter().enumerate() {
        lines.push(format!(
            "  Track {}: \"{}\" ({} clips)",
            i,
            track.name,
            track.clips.len()
        ));
        for clip in &track.clips {
            lines.push(format!(
                "    [{}] {} {} - {}",
                clip.id.0,
                clip.name,
                tc(clip.range.start()),
                tc(clip.range.end())
            ));
        }
    }

    if !timeline.markers.is_empty() {
        lines.push(format!("  Markers ({})", timeline.markers.len()));
        for marker in &timeline.markers {
            let note = marker
                .note
                .as_deref()
                .map(|n| format!(": {n}"))
                .unwrap_or_default();
            lines.push(format!(
                "    {} {} ({}){note}",
                tc(marker.position),
                marker.name,
                marker.color
            ));
        }
    }

    if !timeline.transitions.is_empty() {
        lines.push(format!("  Transitions ({})", timeline.transitions.len()));
        for t in &timeline.transitions {
            lines.push(format!(
                "    {} on track {} at {} ({:.2}s)",
                t.kind,
                t.track,
                tc(t.at),
                t.duration
            ));
        }
    }

    lines.join("\n")
}

/// One line per invocation, oldest first.
pub fn describe_history(history: &[CommandInvocation]) -> String {
    if history.is_empty() {
        return "No commands yet.".to_string();
    }
    history
        .iter()
        .map(|inv| {
            let outcome = match inv.outcome {
                Outcome::Pending => "pending",
                Outcome::Applied => "applied",
                Outcome::Reverted => "reverted",
                Outcome::Failed => "failed",
            };
            let detail = match (&inv.feedback, &inv.error) {
                (_, Some(err)) => format!(" ({err})"),
                (Some(feedback), None) => format!(": {feedback}"),
                (None, None) => String::new(),
            };
            format!("#{} [{}] {} by {}{detail}", inv.sequence, outcome, inv.command, inv.caller)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
