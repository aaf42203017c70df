pub mod timecode;
pub mod timeline;

// Re-export commonly used types at the model level.
pub use timecode::{format_timecode, TimePoint};
pub use timeline::{
    Clip, ClipId, Marker, Playback, Project, RenderJob, TimeRange, Timeline, Track, Transition,
};
