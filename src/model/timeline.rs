use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Tolerance for comparing edit points, in seconds.
const EPSILON: f64 = 1e-6;

/// A time range in seconds. Invariant: 0 <= start < end.
/// Constructed via `TimeRange::new` which enforces this invariant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TimeRangeRaw")]
pub struct TimeRange {
    start: f64,
    end: f64,
}

#[derive(Deserialize)]
struct TimeRangeRaw {
    start: f64,
    end: f64,
}

impl TryFrom<TimeRangeRaw> for TimeRange {
    type Error = String;
    fn try_from(raw: TimeRangeRaw) -> Result<Self, String> {
        TimeRange::new(raw.start, raw.end)
            .ok_or_else(|| format!("Invalid TimeRange: start={}, end={}", raw.start, raw.end))
    }
}

impl TimeRange {
    /// Create a time range. Returns None if start >= end, start is negative,
    /// or either bound is not finite.
    pub fn new(start: f64, end: f64) -> Option<Self> {
        if start.is_finite() && end.is_finite() && start >= 0.0 && end > start {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Returns true if the given time falls within this range (inclusive start, exclusive end).
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }

    /// True when `t` lies strictly inside the range, away from both edges.
    fn splits_at(&self, t: f64) -> bool {
        t > self.start + EPSILON && t < self.end - EPSILON
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipId(pub u32);

/// A clip placed on a track. `source_in` is the offset into the source media
/// at which the clip starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,
    pub name: String,
    pub source: String,
    pub range: TimeRange,
    #[serde(default)]
    pub source_in: f64,
}

/// Clips are kept sorted by start time and never overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub clips: Vec<Clip>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub position: f64,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A transition centred on the edit point `at` between two adjacent clips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: String,
    pub track: usize,
    pub at: f64,
    pub duration: f64,
}

/// Transport state of the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Playback {
    pub playing: bool,
    /// Multiple of real time.
    pub speed: f64,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            playing: false,
            speed: 1.0,
        }
    }
}

impl Playback {
    pub fn state_label(self) -> &'static str {
        if self.playing {
            "playing"
        } else {
            "stopped"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub name: String,
    /// Playhead position in seconds.
    #[serde(default)]
    pub playhead: f64,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub markers: Vec<Marker>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub playback: Playback,
}

impl Timeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            playhead: 0.0,
            tracks: vec![Track {
                name: "V1".into(),
                clips: Vec::new(),
            }],
            markers: Vec::new(),
            transitions: Vec::new(),
            playback: Playback::default(),
        }
    }

    /// End of the last clip on any track.
    pub fn duration(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|t| t.clips.iter())
            .map(|c| c.range.end())
            .fold(0.0, f64::max)
    }

    pub fn track(&self, index: usize) -> Result<&Track, AppError> {
        self.tracks.get(index).ok_or_else(|| AppError::NotFound {
            what: format!("Track {index}"),
        })
    }

    fn track_mut(&mut self, index: usize) -> Result<&mut Track, AppError> {
        self.tracks.get_mut(index).ok_or_else(|| AppError::NotFound {
            what: format!("Track {index}"),
        })
    }

    /// The clip under `position` on `track`.
    pub fn clip_at(&self, track: usize, position: f64) -> Result<&Clip, AppError> {
        self.track(track)?
            .clips
            .iter()
            .find(|c| c.range.contains(position))
            .ok_or_else(|| AppError::NotFound {
                what: format!("Clip on track {track} at {position:.3}s"),
            })
    }

    pub fn next_clip_id(&self) -> ClipId {
        let max = self
            .tracks
            .iter()
            .flat_map(|t| t.clips.iter())
            .map(|c| c.id.0)
            .max()
            .unwrap_or(0);
        ClipId(max + 1)
    }

    /// Split the clip under `position` into two. Returns the ids of the left
    /// and right halves; the left half keeps the original id.
    pub fn split_clip(&mut self, track: usize, position: f64) -> Result<(ClipId, ClipId), AppError> {
        let new_id = self.next_clip_id();
        let clips = &mut self.track_mut(track)?.clips;
        let index = clips
            .iter()
            .position(|c| c.range.contains(position))
            .ok_or_else(|| AppError::NotFound {
                what: format!("Clip on track {track} at {position:.3}s"),
            })?;
        let Some(original) = clips.get(index).cloned() else {
            return Err(AppError::NotFound {
                what: format!("Clip {index} on track {track}"),
            });
        };
        if !original.range.splits_at(position) {
            return Err(AppError::validation(format!(
                "{position:.3}s is already an edit point of \"{}\"",
                original.name
            )));
        }

        let left_range = TimeRange::new(original.range.start(), position);
        let right_range = TimeRange::new(position, original.range.end());
        let (Some(left_range), Some(right_range)) = (left_range, right_range) else {
            return Err(AppError::validation(format!(
                "Cannot split \"{}\" at {position:.3}s",
                original.name
            )));
        };

        let right = Clip {
            id: new_id,
            name: original.name.clone(),
            source: original.source.clone(),
            range: right_range,
            source_in: original.source_in + (position - original.range.start()),
        };
        if let Some(left) = clips.get_mut(index) {
            left.range = left_range;
        }
        clips.insert(index + 1, right);
        Ok((original.id, new_id))
    }

    /// Remove the clip under `position`, together with any transitions that
    /// sat on its edges.
    pub fn remove_clip_at(&mut self, track: usize, position: f64) -> Result<Clip, AppError> {
        let clips = &mut self.track_mut(track)?.clips;
        let index = clips
            .iter()
            .position(|c| c.range.contains(position))
            .ok_or_else(|| AppError::NotFound {
                what: format!("Clip on track {track} at {position:.3}s"),
            })?;
        let removed = clips.remove(index);
        self.transitions.retain(|t| {
            t.track != track
                || ((t.at - removed.range.start()).abs() > EPSILON
                    && (t.at - removed.range.end()).abs() > EPSILON)
        });
        Ok(removed)
    }

    /// Edit points are places where one clip ends and the next begins.
    pub fn edit_points(&self, track: usize) -> Result<Vec<f64>, AppError> {
        let clips = &self.track(track)?.clips;
        Ok(clips
            .windows(2)
            .filter_map(|pair| match pair {
                [a, b] if (a.range.end() - b.range.start()).abs() <= EPSILON => {
                    Some(b.range.start())
                }
                _ => None,
            })
            .collect())
    }

    /// The edit point on `track` closest to `position`.
    pub fn nearest_edit_point(&self, track: usize, position: f64) -> Result<Option<f64>, AppError> {
        Ok(self
            .edit_points(track)?
            .into_iter()
            .min_by(|a, b| (a - position).abs().total_cmp(&(b - position).abs())))
    }

    pub fn add_transition(&mut self, transition: Transition) -> Result<(), AppError> {
        let clips = &self.track(transition.track)?.clips;
        let shortest_neighbour = clips
            .iter()
            .filter(|c| {
                (c.range.end() - transition.at).abs() <= EPSILON
                    || (c.range.start() - transition.at).abs() <= EPSILON
            })
            .map(|c| c.range.duration())
            .fold(f64::INFINITY, f64::min);
        if transition.duration > shortest_neighbour {
            return Err(AppError::validation(format!(
                "A {:.2}s transition does not fit between clips this short ({shortest_neighbour:.2}s)",
                transition.duration
            )));
        }
        if self
            .transitions
            .iter()
            .any(|t| t.track == transition.track && (t.at - transition.at).abs() <= EPSILON)
        {
            return Err(AppError::validation(format!(
                "Track {} already has a transition at {:.3}s",
                transition.track, transition.at
            )));
        }
        self.transitions.push(transition);
        self.transitions.sort_by(|a, b| a.at.total_cmp(&b.at));
        Ok(())
    }

    /// Markers are unique per frame.
    pub fn add_marker(&mut self, marker: Marker, frame_rate: f64) -> Result<(), AppError> {
        let frame = 1.0 / frame_rate;
        if let Some(existing) = self
            .markers
            .iter()
            .find(|m| (m.position - marker.position).abs() < frame / 2.0)
        {
            return Err(AppError::validation(format!(
                "Marker \"{}\" already exists at {:.3}s",
                existing.name, existing.position
            )));
        }
        let index = self
            .markers
            .partition_point(|m| m.position < marker.position);
        self.markers.insert(index, marker);
        Ok(())
    }
}

/// An entry in the render queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: u32,
    pub preset: String,
    pub timeline: String,
}

/// An editing project: one active timeline plus its render queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub frame_rate: f64,
    pub timeline: Timeline,
    #[serde(default)]
    pub render_queue: Vec<RenderJob>,
}

impl Project {
    pub fn new(name: impl Into<String>, frame_rate: f64) -> Self {
        Self {
            name: name.into(),
            frame_rate,
            timeline: Timeline::new("Timeline 1"),
            render_queue: Vec::new(),
        }
    }

    /// A small two-track edit used when no project file is given.
    pub fn sample() -> Self {
        fn clip(id: u32, name: &str, source: &str, start: f64, end: f64) -> Option<Clip> {
            Some(Clip {
                id: ClipId(id),
                name: name.into(),
                source: source.into(),
                range: TimeRange::new(start, end)?,
                source_in: 0.0,
            })
        }

        let v1 = [
            clip(1, "Interview A", "media/interview_a.mov", 0.0, 12.0),
            clip(2, "B-Roll City", "media/broll_city.mov", 12.0, 20.0),
            clip(3, "Interview B", "media/interview_b.mov", 20.0, 35.0),
        ];
        let v2 = [clip(4, "Title Card", "media/title_card.png", 2.0, 6.0)];

        Self {
            name: "Demo Project".into(),
            frame_rate: 24.0,
            timeline: Timeline {
                name: "Main Edit".into(),
                playhead: 5.0,
                tracks: vec![
                    Track {
                        name: "V1".into(),
                        clips: v1.into_iter().flatten().collect(),
                    },
                    Track {
                        name: "V2".into(),
                        clips: v2.into_iter().flatten().collect(),
                    },
                ],
                markers: Vec::new(),
                transitions: Vec::new(),
                playback: Playback::default(),
            },
            render_queue: Vec::new(),
        }
    }
}
