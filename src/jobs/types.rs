use crate::error::{MappingError, MappingErrorKind};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub name: String,
    #[serde(rename = "clientHostname")]
    pub client_hostname: String,
    pub enabled: bool,
    #[serde(rename = "modeDefault", default)]
    pub mode_default: MappingMode,
    pub schedule: Schedule,
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    /// Versioned backup: every run creates a new dated directory under the
    /// destination, subject to retention rotation.
    #[default]
    Copy,
    /// Mirror the source into the destination in place.
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub label: String,
    #[serde(rename = "sourcePath")]
    pub source_path: String,
    #[serde(rename = "destinationPath")]
    pub destination_path: String,
    pub mode: MappingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Retention {
    #[serde(rename = "maxBackups")]
    pub max_backups: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// When a job must run. An unrecognized kind deserializes as Unknown so a
/// newer job file does not break loading; Unknown never computes a next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    Once {
        #[serde(rename = "startDate", default, skip_serializing_if = "Option::is_none")]
        start_date: Option<NaiveDate>,
        #[serde(rename = "startTime")]
        start_time: String,
    },
    Daily {
        /// Weekdays 0..=6 with 0 = Sunday; absent means Mon..Fri.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days: Option<Vec<u8>>,
        /// "HH:MM" entries; invalid ones are ignored.
        times: Vec<String>,
    },
    Weekly {
        /// ISO weekdays 1..=7 with 1 = Monday.
        #[serde(rename = "daysOfWeek")]
        days_of_week: Vec<u8>,
        #[serde(rename = "everyNWeeks", default = "default_every_n_weeks")]
        every_n_weeks: u32,
        #[serde(rename = "startTime", default = "default_start_time")]
        start_time: String,
    },
    Monthly {
        #[serde(rename = "daysOfMonth")]
        days_of_month: Vec<u32>,
        #[serde(rename = "startTime", default = "default_start_time")]
        start_time: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_every_n_weeks() -> u32 {
    1
}

fn default_start_time() -> String {
    "00:00".to_string()
}

fn unc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // \\server\share with at least one path component after the host.
    RE.get_or_init(|| Regex::new(r#"^\\\\[^\\/:*?"<>|]+\\[^\\/:*?"<>|]+"#).unwrap())
}

/// Checks done before any agent call: UNC shape, credential consistency,
/// source/destination identity and overlap.
pub fn validate_mapping(mapping: &Mapping) -> Result<(), MappingError> {
    for path in [&mapping.source_path, &mapping.destination_path] {
        if path.starts_with("\\\\") && !unc_re().is_match(path) {
            return Err(MappingError::new(
                MappingErrorKind::UncInvalidFormat,
                format!("not a valid UNC path: {path}"),
            ));
        }
    }

    if let Some(creds) = &mapping.credentials {
        if creds.username.trim().is_empty() {
            return Err(MappingError::new(
                MappingErrorKind::InvalidCredentials,
                "credentials present but username is empty",
            ));
        }
        // The domain goes in its own field; DOMAIN\user in username as well
        // would make the agent guess which one wins.
        if creds.domain.is_some() && creds.username.contains('\\') {
            return Err(MappingError::new(
                MappingErrorKind::InvalidCredentials,
                "domain set both in its own field and inside the username",
            ));
        }
    }

    let source = normalize_path(&mapping.source_path);
    let destination = normalize_path(&mapping.destination_path);
    if source == destination {
        return Err(MappingError::new(
            MappingErrorKind::SourceEqualsDestination,
            format!("source and destination are both {}", mapping.source_path),
        ));
    }
    if is_path_prefix(&source, &destination) || is_path_prefix(&destination, &source) {
        return Err(MappingError::new(
            MappingErrorKind::PathOverlap,
            format!(
                "paths overlap: {} and {}",
                mapping.source_path, mapping.destination_path
            ),
        ));
    }

    Ok(())
}

fn normalize_path(path: &str) -> String {
    path.trim()
        .trim_end_matches(['\\', '/'])
        .replace('\\', "/")
        .to_ascii_lowercase()
}

fn is_path_prefix(base: &str, candidate: &str) -> bool {
    candidate.starts_with(base)
        && candidate[base.len()..].starts_with('/')
}
