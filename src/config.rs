// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Configuration: CLI flags with environment-variable fallbacks, precedence
//! CLI > env > default. `clap`'s `env` attribute gives that precedence
//! natively, the same way `main.rs` reaches for `clap::Parser` — generalized
//! here from a TOML file to a flag/env surface.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{BackupError, Result};
use crate::model::DetectionType;
use crate::notify::NotifierRoute;
use crate::template::PathTemplate;
use crate::units::{parse_byte_size, parse_duration};

fn default_file_structure_format() -> &'static str {
    "{camera_name}/{event.start:%Y-%m-%d}/{event.end:%Y-%m-%dT%H-%M-%S} {detection_type}.mp4"
}

/// Raw CLI/env arguments, parsed by `clap` before validation.
#[derive(Parser, Debug, Clone)]
#[command(name = "protect-backup", about = "Back up UniFi Protect event clips to a remote store", version)]
pub struct Cli {
    #[arg(long, env = "UFP_ADDRESS")]
    pub address: String,

    #[arg(long, env = "UFP_PORT", default_value_t = 443)]
    pub port: u16,

    #[arg(long, env = "UFP_USERNAME")]
    pub username: String,

    #[arg(long, env = "UFP_PASSWORD")]
    pub password: String,

    #[arg(long, env = "UFP_SSL_VERIFY", default_value_t = true)]
    pub verify_ssl: bool,

    #[arg(long, env = "RCLONE_DESTINATION")]
    pub rclone_destination: String,

    #[arg(long, env = "RCLONE_RETENTION", default_value = "7d")]
    pub retention: String,

    #[arg(long, default_value = "")]
    pub rclone_args: String,

    #[arg(long, default_value = "")]
    pub rclone_purge_args: String,

    #[arg(long, env = "DETECTION_TYPES", default_value = "motion,person,vehicle,ring")]
    pub detection_types: String,

    #[arg(long = "ignore-camera", env = "IGNORE_CAMERAS")]
    pub ignore_camera: Vec<String>,

    #[arg(long, env = "FILE_STRUCTURE_FORMAT", default_value = default_file_structure_format())]
    pub file_structure_format: String,

    #[arg(long, env = "SQLITE_PATH", default_value = "./events.sqlite")]
    pub sqlite_path: PathBuf,

    #[arg(long, default_value = "512MiB")]
    pub download_buffer_size: String,

    #[arg(long, default_value = "1d")]
    pub purge_interval: String,

    #[arg(long, default_value = "2h")]
    pub max_event_length: String,

    #[arg(long, default_value_t = false)]
    pub skip_missing: bool,

    #[arg(long = "apprise-notifier")]
    pub apprise_notifier: Vec<String>,

    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// Validated, typed configuration derived from [`Cli`]. Everything in the
/// pipeline downstream depends on this, never on raw strings.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
    pub rclone_destination: String,
    pub retention: Duration,
    pub rclone_args: Vec<String>,
    pub rclone_purge_args: Vec<String>,
    pub detection_types: BTreeSet<DetectionType>,
    pub ignored_cameras: BTreeSet<String>,
    pub file_structure_format: PathTemplate,
    pub sqlite_path: PathBuf,
    pub download_buffer_size: u64,
    pub purge_interval: Duration,
    pub max_event_length: Duration,
    pub skip_missing: bool,
    pub notifiers: Vec<NotifierRoute>,
    pub verbosity: u8,
}

impl Config {
    /// Parse CLI/env (via `clap`, giving CLI > env > default precedence
    /// automatically) and validate into a [`Config`]. Any failure here is a
    /// configuration error (exit code 200).
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.address.trim().is_empty() {
            return Err(BackupError::Config("--address is required".into()));
        }
        if cli.username.trim().is_empty() || cli.password.is_empty() {
            return Err(BackupError::Config("--username and --password are required".into()));
        }
        if cli.rclone_destination.trim().is_empty() {
            return Err(BackupError::Config("--rclone-destination is required".into()));
        }

        let retention = parse_duration(&cli.retention)?;
        let purge_interval = parse_duration(&cli.purge_interval)?;
        let max_event_length = parse_duration(&cli.max_event_length)?;
        let download_buffer_size = parse_byte_size(&cli.download_buffer_size)?;

        let detection_types: BTreeSet<DetectionType> = cli
            .detection_types
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap())
            .collect();
        if detection_types.is_empty() {
            return Err(BackupError::Config("--detection-types must name at least one type".into()));
        }

        let ignored_cameras: BTreeSet<String> = cli
            .ignore_camera
            .iter()
            .flat_map(|s| s.split_whitespace())
            .map(str::to_string)
            .collect();

        let file_structure_format = PathTemplate::parse(&cli.file_structure_format)?;

        let rclone_args = split_args(&cli.rclone_args);
        let rclone_purge_args = split_args(&cli.rclone_purge_args);

        let notifiers = cli
            .apprise_notifier
            .iter()
            .map(|s| NotifierRoute::parse(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            address: cli.address,
            port: cli.port,
            username: cli.username,
            password: cli.password,
            verify_ssl: cli.verify_ssl,
            rclone_destination: cli.rclone_destination,
            retention,
            rclone_args,
            rclone_purge_args,
            detection_types,
            ignored_cameras,
            file_structure_format,
            sqlite_path: cli.sqlite_path,
            download_buffer_size,
            purge_interval,
            max_event_length,
            skip_missing: cli.skip_missing,
            notifiers,
            verbosity: cli.verbosity,
        })
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
