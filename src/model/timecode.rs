//! Timecode parsing and formatting.
//!
//! Positions travel through the pipeline either as plain seconds or as
//! `HH:MM:SS:FF` timecode. The frame part can only be resolved once the
//! project frame rate is known, so parsing keeps the two forms apart.

use std::fmt;

use serde::{Serialize, Serializer};

/// A position on the timeline as the caller wrote it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimePoint {
    Seconds(f64),
    Timecode {
        hours: u32,
        minutes: u32,
        seconds: u32,
        frames: u32,
    },
}

impl TimePoint {
    pub fn from_seconds(seconds: f64) -> Option<Self> {
        (seconds.is_finite() && seconds >= 0.0).then_some(TimePoint::Seconds(seconds))
    }

    /// Accepts `"12.5"`, `"12.5s"`, `"12 sec"`, `"01:02:03:04"` (`;` also
    /// separates frames) and `"01:02:03"`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.contains(':') || text.contains(';') {
            let parts: Vec<&str> = text.split([':', ';']).collect();
            let numbers: Vec<u32> = parts
                .iter()
                .map(|p| p.parse::<u32>())
                .collect::<Result<_, _>>()
                .ok()?;
            let (hours, minutes, seconds, frames) = match numbers.as_slice() {
                [h, m, s, f] => (*h, *m, *s, *f),
                [h, m, s] => (*h, *m, *s, 0),
                _ => return None,
            };
            if minutes >= 60 || seconds >= 60 {
                return None;
            }
            return Some(TimePoint::Timecode {
                hours,
                minutes,
                seconds,
                frames,
            });
        }

        let number = ["seconds", "second", "secs", "sec", "s"]
            .iter()
            .find_map(|suffix| text.strip_suffix(suffix))
            .unwrap_or(text)
            .trim();
        number.parse::<f64>().ok().and_then(TimePoint::from_seconds)
    }

    /// Seconds at `frame_rate`, rejecting a frame count that does not
    /// exist at that rate (`00:00:01:24` at 24fps).
    pub fn resolve(self, frame_rate: f64) -> Result<f64, String> {
        if let TimePoint::Timecode { frames, .. } = self {
            let nominal = frame_rate.round().max(1.0);
            if f64::from(frames) >= nominal {
                return Err(format!(
                    "frame {frames} does not exist at {frame_rate}fps (frames run 0-{})",
                    nominal - 1.0
                ));
            }
        }
        Ok(self.to_seconds(frame_rate))
    }

    pub fn to_seconds(self, frame_rate: f64) -> f64 {
        match self {
            TimePoint::Seconds(s) => s,
            TimePoint::Timecode {
                hours,
                minutes,
                seconds,
                frames,
            } => {
                f64::from(hours) * 3600.0
                    + f64::from(minutes) * 60.0
                    + f64::from(seconds)
                    + f64::from(frames) / frame_rate
            }
        }
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimePoint::Seconds(s) => write!(f, "{s}s"),
            TimePoint::Timecode {
                hours,
                minutes,
                seconds,
                frames,
            } => write!(f, "{hours:02}:{minutes:02}:{seconds:02}:{frames:02}"),
        }
    }
}

impl Serialize for TimePoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TimePoint::Seconds(s) => serializer.serialize_f64(*s),
            TimePoint::Timecode { .. } => serializer.collect_str(self),
        }
    }
}

/// Format seconds as `HH:MM:SS:FF` at the given frame rate. Fractional rates
/// count frames against the nominal (rounded) rate.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn format_timecode(seconds: f64, frame_rate: f64) -> String {
    let nominal = (frame_rate.round() as u64).max(1);
    let total_frames = (seconds.max(0.0) * frame_rate).round() as u64;
    let frames = total_frames % nominal;
    let total_seconds = total_frames / nominal;
    let s = total_seconds % 60;
    let m = (total_seconds / 60) % 60;
    let h = total_seconds / 3600;
    format!("{h:02}:{m:02}:{s:02}:{frames:02}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_and_fractional_seconds() {
        assert_eq!(format_timecode(0.0, 24.0), "00:00:00:00");
        assert_eq!(format_timecode(5.0, 24.0), "00:00:05:00");
        assert_eq!(format_timecode(12.5, 24.0), "00:00:12:12");
        assert_eq!(format_timecode(3725.0, 25.0), "01:02:05:00");
    }

    #[test]
    fn parses_seconds_forms() {
        assert_eq!(TimePoint::parse("12.5"), Some(TimePoint::Seconds(12.5)));
        assert_eq!(TimePoint::parse("12.5s"), Some(TimePoint::Seconds(12.5)));
        assert_eq!(TimePoint::parse("3 seconds"), Some(TimePoint::Seconds(3.0)));
        assert_eq!(TimePoint::parse("-1"), None);
        assert_eq!(TimePoint::parse("soon"), None);
    }

    #[test]
    fn parses_timecode_and_resolves_frames() {
        let tc = TimePoint::parse("00:01:02:12").unwrap();
        assert!((tc.to_seconds(24.0) - 62.5).abs() < 1e-9);
        assert_eq!(tc.to_string(), "00:01:02:12");
        assert!(TimePoint::parse("00:61:00:00").is_none());
        assert!(TimePoint::parse("00:00:05;10").is_some());
    }

    #[test]
    fn frames_must_fit_the_rate() {
        let late = TimePoint::parse("00:00:01:99").unwrap();
        assert!(late.resolve(24.0).is_err());
        assert!(TimePoint::parse("00:00:01:24").unwrap().resolve(24.0).is_err());
        assert!((TimePoint::parse("00:00:01:23").unwrap().resolve(24.0).unwrap() - (1.0 + 23.0 / 24.0)).abs() < 1e-9);
        assert!(TimePoint::parse("00:00:01:29").unwrap().resolve(29.97).is_ok());
        assert_eq!(TimePoint::Seconds(99.0).resolve(24.0), Ok(99.0));
    }

    #[test]
    fn serializes_as_number_or_string() {
        assert_eq!(
            serde_json::to_value(TimePoint::Seconds(1.5)).unwrap(),
            serde_json::json!(1.5)
        );
        assert_eq!(
            serde_json::to_value(TimePoint::parse("00:00:01:00").unwrap()).unwrap(),
            serde_json::json!("00:00:01:00")
        );
    }
}
