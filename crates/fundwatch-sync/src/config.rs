//! YAML application configuration, validated into typed settings.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use fundwatch_core::SourceSettings;
use fundwatch_storage::{HttpClientConfig, DEFAULT_USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::filter::FilterSettings;

pub const DEFAULT_WEBHOOK_ENV_VAR: &str = "SLACK_WEBHOOK_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("Unsupported storage type: {0}")]
    UnsupportedStorage(String),
    #[error("Missing Slack webhook URL in environment variable {0}")]
    MissingWebhook(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackSettings {
    pub webhook_env_var: String,
    pub timeout_seconds: u64,
}

impl SlackSettings {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingSettings {
    pub max_posts_per_run: usize,
    pub dry_run: bool,
    pub record_non_matches_as_seen: bool,
}

impl Default for PostingSettings {
    fn default() -> Self {
        Self {
            max_posts_per_run: 10,
            dry_run: false,
            record_non_matches_as_seen: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_seconds: u64,
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: std::time::Duration::from_secs(self.timeout_seconds),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sources: Vec<SourceSettings>,
    pub filters: FilterSettings,
    pub slack: SlackSettings,
    pub posting: PostingSettings,
    pub storage: StorageSettings,
    pub http: HttpSettings,
    pub log_level: String,
}

/// Scalars as YAML authors write them: `yes`, `"10"`, `on`, `1`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    sources: Vec<serde_yaml::Value>,
    #[serde(default)]
    filters: Option<RawFilters>,
    #[serde(default)]
    slack: Option<RawSlack>,
    #[serde(default)]
    posting: Option<RawPosting>,
    #[serde(default)]
    storage: Option<RawStorage>,
    #[serde(default)]
    http: Option<RawHttp>,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFilters {
    #[serde(default)]
    include_keywords: Option<Vec<Scalar>>,
    #[serde(default)]
    exclude_keywords: Option<Vec<Scalar>>,
    #[serde(default)]
    include_councils: Option<Vec<Scalar>>,
    #[serde(default)]
    include_funding_types: Option<Vec<Scalar>>,
    #[serde(default)]
    min_days_until_deadline: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSlack {
    #[serde(default)]
    webhook_env_var: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPosting {
    #[serde(default)]
    max_posts_per_run: Option<Scalar>,
    #[serde(default)]
    dry_run: Option<Scalar>,
    #[serde(default)]
    record_non_matches_as_seen: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorage {
    #[serde(default, rename = "type")]
    storage_type: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttp {
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<Scalar>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml_str(&text, &base_dir)
    }

    /// Parse and validate YAML; relative paths resolve against `base_dir`.
    pub fn from_yaml_str(yaml: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let raw: RawConfig = match value {
            serde_yaml::Value::Null => RawConfig::default(),
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)?,
            _ => return Err(invalid("Config root must be a mapping")),
        };

        let http = parse_http(raw.http.unwrap_or_default())?;
        let sources = parse_sources(&raw.sources, &http)?;
        let filters = parse_filters(raw.filters.unwrap_or_default())?;
        let posting = parse_posting(raw.posting.unwrap_or_default())?;
        let storage = parse_storage(raw.storage.unwrap_or_default(), base_dir)?;

        let slack = parse_slack(raw.slack.unwrap_or_default())?;

        let log_level = raw
            .log_level
            .map(|v| v.trim().to_uppercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "INFO".to_string());

        Ok(Self {
            sources,
            filters,
            slack,
            posting,
            storage,
            http,
            log_level,
        })
    }

    /// Webhook URL from the configured environment variable.
    pub fn webhook_url(&self) -> Result<String, ConfigError> {
        std::env::var(&self.slack.webhook_env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingWebhook(self.slack.webhook_env_var.clone()))
    }
}

fn parse_sources(raw: &[serde_yaml::Value], http: &HttpSettings) -> Result<Vec<SourceSettings>, ConfigError> {
    if raw.is_empty() {
        return Err(invalid("Config must define at least one source"));
    }

    let mut seen = BTreeSet::new();
    let mut sources = Vec::with_capacity(raw.len());
    for (index, entry) in raw.iter().enumerate() {
        let number = index + 1;
        if !entry.is_mapping() {
            return Err(invalid(format!("Source entry #{number} must be a mapping")));
        }
        let json = serde_json::to_value(entry)
            .map_err(|err| invalid(format!("Source entry #{number} is not representable: {err}")))?;
        let JsonValue::Object(mut fields) = json else {
            return Err(invalid(format!("Source entry #{number} must be a mapping")));
        };

        let id = take_text(&mut fields, "id");
        let source_type = take_text(&mut fields, "type");
        let url = take_text(&mut fields, "url");
        if id.is_empty() || source_type.is_empty() || url.is_empty() {
            return Err(invalid(format!("Source entry #{number} missing one of: id, type, url")));
        }
        if !seen.insert(id.clone()) {
            return Err(invalid(format!("Duplicate source id: {id}")));
        }

        fields
            .entry("timeout_seconds".to_string())
            .or_insert_with(|| JsonValue::from(http.timeout_seconds));

        sources.push(SourceSettings {
            id,
            source_type,
            url,
            options: fields,
        });
    }
    Ok(sources)
}

fn take_text(fields: &mut Map<String, JsonValue>, key: &str) -> String {
    match fields.remove(key) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

fn parse_filters(raw: RawFilters) -> Result<FilterSettings, ConfigError> {
    let min_days_until_deadline = raw
        .min_days_until_deadline
        .map(|v| as_int(v, "filters.min_days_until_deadline", Some(0)))
        .transpose()?;
    Ok(FilterSettings {
        include_keywords: string_list(raw.include_keywords),
        exclude_keywords: string_list(raw.exclude_keywords),
        include_councils: string_list(raw.include_councils),
        include_funding_types: string_list(raw.include_funding_types),
        min_days_until_deadline,
    })
}

fn parse_posting(raw: RawPosting) -> Result<PostingSettings, ConfigError> {
    let defaults = PostingSettings::default();
    let max_posts_per_run = match raw.max_posts_per_run {
        Some(v) => as_int(v, "posting.max_posts_per_run", Some(1))? as usize,
        None => defaults.max_posts_per_run,
    };
    let dry_run = match raw.dry_run {
        Some(v) => as_bool(v, "posting.dry_run")?,
        None => defaults.dry_run,
    };
    let record_non_matches_as_seen = match raw.record_non_matches_as_seen {
        Some(v) => as_bool(v, "posting.record_non_matches_as_seen")?,
        None => defaults.record_non_matches_as_seen,
    };
    Ok(PostingSettings {
        max_posts_per_run,
        dry_run,
        record_non_matches_as_seen,
    })
}

fn parse_storage(raw: RawStorage, base_dir: &Path) -> Result<StorageSettings, ConfigError> {
    let storage_type = raw
        .storage_type
        .map(|t| t.trim().to_lowercase())
        .unwrap_or_else(|| "sqlite".to_string());
    if storage_type != "sqlite" {
        return Err(ConfigError::UnsupportedStorage(storage_type));
    }

    let raw_path = raw
        .path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "data/state.sqlite".to_string());
    let candidate = PathBuf::from(raw_path);
    let path = if candidate.is_absolute() {
        candidate
    } else {
        lexical_join(base_dir, &candidate)
    };
    Ok(StorageSettings { path })
}

/// Join and drop `.`/`..` components without touching the filesystem.
fn lexical_join(base: &Path, relative: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in base.join(relative).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn parse_slack(raw: RawSlack) -> Result<SlackSettings, ConfigError> {
    let webhook_env_var = raw
        .webhook_env_var
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_WEBHOOK_ENV_VAR.to_string());
    let timeout_seconds = match raw.timeout_seconds {
        Some(v) => as_int(v, "slack.timeout_seconds", Some(1))? as u64,
        None => 15,
    };
    Ok(SlackSettings {
        webhook_env_var,
        timeout_seconds,
    })
}

fn parse_http(raw: RawHttp) -> Result<HttpSettings, ConfigError> {
    let timeout_seconds = match raw.timeout_seconds {
        Some(v) => as_int(v, "http.timeout_seconds", Some(1))? as u64,
        None => 30,
    };
    let user_agent = raw
        .user_agent
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
    Ok(HttpSettings {
        user_agent,
        timeout_seconds,
    })
}

fn string_list(values: Option<Vec<Scalar>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|v| match v {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn as_bool(value: Scalar, field: &str) -> Result<bool, ConfigError> {
    match value {
        Scalar::Bool(b) => Ok(b),
        Scalar::Int(0) => Ok(false),
        Scalar::Int(1) => Ok(true),
        Scalar::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid(format!("{field} must be a boolean"))),
        },
        Scalar::Int(_) | Scalar::Float(_) => Err(invalid(format!("{field} must be a boolean"))),
    }
}

fn as_int(value: Scalar, field: &str, minimum: Option<i64>) -> Result<i64, ConfigError> {
    let parsed = match value {
        Scalar::Int(i) => i,
        Scalar::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("{field} must be an integer")))?,
        Scalar::Bool(_) | Scalar::Float(_) => return Err(invalid(format!("{field} must be an integer"))),
    };
    if let Some(min) = minimum {
        if parsed < min {
            return Err(invalid(format!("{field} must be >= {min}")));
        }
    }
    Ok(parsed)
}
