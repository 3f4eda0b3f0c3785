// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Remote path template engine.
//!
//! Limited to six symbols:
//! `{event.start}`, `{event.end}`, `{event.id}`, `{camera_name}`,
//! `{detection_type}`, `{duration_seconds}`, each optionally followed by a
//! `:FORMAT` clause (only meaningful on the two timestamp fields, applied
//! via `chrono`'s strftime). Any other symbol is rejected at startup as a
//! configuration error — this is not a general-purpose format string engine.

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::{BackupError, Result};
use crate::model::{Camera, DetectionType, Event};

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    EventStart(Option<String>),
    EventEnd(Option<String>),
    EventId,
    CameraName,
    DetectionType,
    DurationSeconds,
}

/// A parsed, validated path template, ready to render per event.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    parts: Vec<Part>,
}

impl PathTemplate {
    /// Parse and validate `raw`. Unknown symbols are a configuration error.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 1..];
            let close = after_open.find('}').ok_or_else(|| {
                BackupError::Config(format!("unterminated '{{' in path template '{raw}'"))
            })?;
            let symbol = &after_open[..close];
            let (name, format) = match symbol.split_once(':') {
                Some((n, f)) => (n, Some(f.to_string())),
                None => (symbol, None),
            };
            let part = match name {
                "event.start" => Part::EventStart(format),
                "event.end" => Part::EventEnd(format),
                "event.id" => Part::EventId,
                "camera_name" => Part::CameraName,
                "detection_type" => Part::DetectionType,
                "duration_seconds" => Part::DurationSeconds,
                other => {
                    return Err(BackupError::Config(format!(
                        "unknown path template symbol '{{{other}}}' in '{raw}'"
                    )))
                }
            };
            parts.push(part);
            rest = &after_open[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(PathTemplate { parts })
    }

    /// Render the template for `event` observed on `camera`, with an
    /// `end_ts` that has already been checked present (eligibility is
    /// enforced upstream; rendering a template for an unfinished event is a
    /// programmer error, not a runtime condition to recover from).
    pub fn render(&self, event: &Event, camera: &Camera) -> String {
        let tz = FixedOffset::east_opt(camera.tz_offset_seconds).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        let end_ts = event.end_ts.unwrap_or(event.start_ts);
        let duration_secs = (end_ts - event.start_ts).num_seconds().max(0);

        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::EventStart(fmt) => out.push_str(&format_ts(event.start_ts, &tz, fmt)),
                Part::EventEnd(fmt) => out.push_str(&format_ts(end_ts, &tz, fmt)),
                Part::EventId => out.push_str(&event.event_id),
                Part::CameraName => out.push_str(&sanitize(&camera.name)),
                Part::DetectionType => out.push_str(event.event_type.as_str()),
                Part::DurationSeconds => out.push_str(&duration_secs.to_string()),
            }
        }
        out
    }
}

fn format_ts(ts: DateTime<Utc>, tz: &FixedOffset, fmt: &Option<String>) -> String {
    let local = ts.with_timezone(tz);
    match fmt {
        Some(fmt) => local.format(fmt).to_string(),
        None => local.to_rfc3339(),
    }
}

/// Strip path separators out of free-form names so they can't escape the
/// directory structure the template intends to build.
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
