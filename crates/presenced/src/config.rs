use anyhow::{bail, Context, Result};
use presence_core::{CheckoutPolicy, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus to register the control interface on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbusBus {
    Off,
    #[default]
    Session,
    System,
}

/// What the frame source does when the engine queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Discard the incoming frame. Never stalls a live capture.
    #[default]
    DropNewest,
    /// Wait for queue space. For replaying recorded frames.
    Block,
}

/// Daemon configuration.
///
/// Loaded from the TOML file named by `PRESENCE_CONFIG` (if set), then
/// overridden field by field from `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Inactivity in seconds after which an open session is closed.
    pub exit_timeout_secs: u64,
    pub checkout_policy: CheckoutPolicy,
    /// EMA weight applied to a matched identity's reference embedding.
    pub reference_update_weight: f32,
    /// Expected embedding length; 0 accepts any length.
    pub embedding_dim: usize,
    /// Minimum face bbox side in pixels; 0 disables the filter.
    pub min_face_size: f32,
    /// Capacity of the frame queue between the source and the engine.
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    /// Seconds between timeout sweeps when no frames arrive.
    pub sweep_interval_secs: u64,
    /// JSON-lines frame file. Reads stdin when unset.
    pub source: Option<PathBuf>,
    /// File whose contents derive the embedding encryption key.
    pub key_file: Option<PathBuf>,
    pub dbus: DbusBus,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: presence_store::default_db_path(),
            similarity_threshold: 0.65,
            exit_timeout_secs: 300,
            checkout_policy: CheckoutPolicy::TimeoutExpiry,
            reference_update_weight: 0.1,
            embedding_dim: 512,
            min_face_size: 0.0,
            queue_capacity: 8,
            backpressure: Backpressure::DropNewest,
            sweep_interval_secs: 1,
            source: None,
            key_file: None,
            dbus: DbusBus::Session,
        }
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` and the environment, then validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `PRESENCE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.similarity_threshold =
            parse_or(&var, "PRESENCE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.exit_timeout_secs =
            parse_or(&var, "PRESENCE_EXIT_TIMEOUT_SECS", self.exit_timeout_secs);
        self.checkout_policy = parse_or(&var, "PRESENCE_CHECKOUT_POLICY", self.checkout_policy);
        self.reference_update_weight = parse_or(
            &var,
            "PRESENCE_REFERENCE_UPDATE_WEIGHT",
            self.reference_update_weight,
        );
        self.embedding_dim = parse_or(&var, "PRESENCE_EMBEDDING_DIM", self.embedding_dim);
        self.min_face_size = parse_or(&var, "PRESENCE_MIN_FACE_SIZE", self.min_face_size);
        self.queue_capacity = parse_or(&var, "PRESENCE_QUEUE_CAPACITY", self.queue_capacity);
        self.sweep_interval_secs =
            parse_or(&var, "PRESENCE_SWEEP_INTERVAL_SECS", self.sweep_interval_secs);
        if let Some(v) = var("PRESENCE_BACKPRESSURE") {
            match v.as_str() {
                "drop_newest" => self.backpressure = Backpressure::DropNewest,
                "block" => self.backpressure = Backpressure::Block,
                other => tracing::warn!(value = other, "ignoring unknown PRESENCE_BACKPRESSURE"),
            }
        }
        if let Some(v) = var("PRESENCE_SOURCE") {
            self.source = (!v.is_empty() && v != "-").then(|| PathBuf::from(v));
        }
        if let Some(v) = var("PRESENCE_KEY_FILE") {
            self.key_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("PRESENCE_DBUS") {
            match v.as_str() {
                "off" | "0" => self.dbus = DbusBus::Off,
                "session" => self.dbus = DbusBus::Session,
                "system" => self.dbus = DbusBus::System,
                other => tracing::warn!(value = other, "ignoring unknown PRESENCE_DBUS"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exit_timeout_secs == 0 {
            bail!("exit_timeout_secs must be positive");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            );
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Core pipeline settings derived from this configuration.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            similarity_threshold: self.similarity_threshold,
            exit_timeout: chrono::Duration::seconds(
                i64::try_from(self.exit_timeout_secs).unwrap_or(i64::MAX / 1000),
            ),
            checkout_policy: self.checkout_policy,
            reference_update_weight: self.reference_update_weight,
            embedding_dim: (self.embedding_dim > 0).then_some(self.embedding_dim),
            min_face_size: self.min_face_size,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match var(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparseable override");
            default
        }),
        None => default,
    }
}
