// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Core data model: [`Event`], [`Camera`], [`DetectionType`], eligibility.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A detection category reported by the NVR.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DetectionType {
    Motion,
    Person,
    Vehicle,
    Ring,
    /// Any event type the NVR reports that isn't one of the above. Never
    /// eligible unless the configured detection-type list names it exactly.
    Other(String),
}

impl DetectionType {
    pub fn as_str(&self) -> &str {
        match self {
            DetectionType::Motion => "motion",
            DetectionType::Person => "person",
            DetectionType::Vehicle => "vehicle",
            DetectionType::Ring => "ring",
            DetectionType::Other(s) => s,
        }
    }
}

impl std::str::FromStr for DetectionType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "motion" => DetectionType::Motion,
            "person" => DetectionType::Person,
            "vehicle" => DetectionType::Vehicle,
            "ring" => DetectionType::Ring,
            other => DetectionType::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for DetectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event observed on the NVR.
///
/// `end_ts` is `None` until the NVR reports the event has finished; an
/// event without an `end_ts` is never eligible.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: String,
    pub camera_id: String,
    pub event_type: DetectionType,
    pub smart_detect_types: BTreeSet<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl Event {
    /// `end_ts - start_ts`, or `None` if the event hasn't ended.
    pub fn duration(&self) -> Option<Duration> {
        let end = self.end_ts?;
        (end - self.start_ts).to_std().ok()
    }

    /// Whether this event passes the configured detection-type and
    /// ignored-camera filters and is bounded in duration: eligible iff its
    /// type is configured, its camera isn't ignored, it has ended, and its
    /// duration doesn't exceed the max.
    pub fn is_eligible(
        &self,
        detection_types: &BTreeSet<DetectionType>,
        ignored_cameras: &BTreeSet<String>,
        max_duration: Duration,
    ) -> bool {
        if !detection_types.contains(&self.event_type) {
            return false;
        }
        if ignored_cameras.contains(&self.camera_id) {
            return false;
        }
        let Some(duration) = self.duration() else {
            return false;
        };
        duration <= max_duration
    }
}

/// Camera metadata, looked up lazily and cached with a short TTL.
#[derive(Debug, Clone)]
pub struct Camera {
    pub camera_id: String,
    pub name: String,
    /// Offset from UTC, in seconds, used for path-template date formatting.
    pub tz_offset_seconds: i32,
}
