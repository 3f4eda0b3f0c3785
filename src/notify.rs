// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Notification dispatch: `--apprise-notifier LEVELS=url`,
//! repeatable, filtered by level tag. Best-effort only — a notifier that
//! can't be reached is logged and otherwise ignored; it must never become a
//! pipeline hazard.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::warn;

use crate::error::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
    ExtraDebug,
    WebsocketData,
}

impl std::str::FromStr for Level {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ERROR" => Level::Error,
            "WARNING" => Level::Warning,
            "INFO" => Level::Info,
            "DEBUG" => Level::Debug,
            "EXTRA_DEBUG" => Level::ExtraDebug,
            "WEBSOCKET_DATA" => Level::WebsocketData,
            other => {
                return Err(BackupError::Config(format!(
                    "unknown notifier level '{other}' (expected one of ERROR,WARNING,INFO,DEBUG,EXTRA_DEBUG,WEBSOCKET_DATA)"
                )))
            }
        })
    }
}

/// One parsed `LEVELS=url` route.
#[derive(Debug, Clone)]
pub struct NotifierRoute {
    pub levels: BTreeSet<Level>,
    pub url: String,
}

impl NotifierRoute {
    pub fn parse(raw: &str) -> Result<Self> {
        let (levels_str, url) = raw.split_once('=').ok_or_else(|| {
            BackupError::Config(format!("notifier route '{raw}' must be LEVELS=url"))
        })?;
        let levels: BTreeSet<Level> = if levels_str.trim().is_empty() {
            [Level::Error].into_iter().collect()
        } else {
            levels_str
                .split(',')
                .map(|s| s.trim().parse())
                .collect::<Result<_>>()?
        };
        if url.trim().is_empty() {
            return Err(BackupError::Config(format!("notifier route '{raw}' has an empty URL")));
        }
        Ok(NotifierRoute { levels, url: url.to_string() })
    }
}

#[derive(Serialize)]
struct NotifyBody<'a> {
    title: &'a str,
    body: &'a str,
    level: Level,
}

/// Dispatches log-worthy events to configured webhook URLs. A no-op
/// dispatcher with zero routes is valid and costs nothing per call.
pub struct Notifier {
    routes: Vec<NotifierRoute>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(routes: Vec<NotifierRoute>) -> Self {
        Notifier { routes, http: reqwest::Client::new() }
    }

    /// Dispatch to every route whose level set contains `level`. Failures
    /// are logged at `WARNING` and never propagated.
    pub async fn notify(&self, level: Level, title: &str, body: &str) {
        for route in &self.routes {
            if !route.levels.contains(&level) {
                continue;
            }
            let payload = NotifyBody { title, body, level };
            if let Err(e) = self.http.post(&route.url).json(&payload).send().await {
                warn!(url = %route.url, error = %e, "notifier dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_level_route() {
        let route = NotifierRoute::parse("ERROR=https://example.com/hook").unwrap();
        assert_eq!(route.levels, [Level::Error].into_iter().collect());
        assert_eq!(route.url, "https://example.com/hook");
    }

    #[test]
    fn parses_multi_level_route() {
        let route = NotifierRoute::parse("ERROR,WARNING=https://example.com/hook").unwrap();
        assert!(route.levels.contains(&Level::Error));
        assert!(route.levels.contains(&Level::Warning));
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(NotifierRoute::parse("https://example.com/hook").is_err());
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(NotifierRoute::parse("BOGUS=https://example.com/hook").is_err());
    }

    #[tokio::test]
    async fn notify_with_no_routes_is_a_no_op() {
        let notifier = Notifier::new(vec![]);
        notifier.notify(Level::Error, "title", "body").await;
    }
}
