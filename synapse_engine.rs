//! # Synapse Engine - Agent Pipeline Telemetry
//!
//! A bounded-memory metric aggregation and execution-tree navigation engine
//! for agent pipelines. This is the observability backbone that watches every
//! stage of an agent run without ever holding the full event log in memory.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SYNAPSE RUST ENGINE                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  STAGE EVENTS → EVENT BUS → COLLECTOR → WINDOW STRATEGIES → EXPORTERS   │
//! │                     └─────→ ALARMS      └─→ EXECUTION TREE → NAVIGATOR  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded Memory**: Ring buffer, tumbling and sliding retention windows
//! - **Percentile Aggregation**: Nearest-rank p50/p95/p99 under mutation
//! - **Multi-Backend Export**: CloudWatch, Prometheus, Datadog, in-memory
//! - **Two-Tier Navigation**: Cheap summaries, paid drill-down per stage
//! - **Threshold Alarms**: Fire-and-resolve rules over live stage events
//!
//! ## Author
//!
//! AIOps Team - Built with 🔥 and Rust

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality. The engine is pure,
// synchronous, in-memory computation; there is no async runtime here.
// ============================================================================

// The same file backs both the library and the `synapse` binary target, so
// each build sees entry points the other one uses.
#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing & Identity
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::Context as AnyhowContext;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "synapse-engine";
pub const ENGINE_FULL_NAME: &str = "Synapse Pipeline Telemetry Engine";

// ----------------------------------------------------------------------------
// Window Defaults & Limits
// ----------------------------------------------------------------------------

/// Default capacity for ring-buffer retention (entries)
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 4096;

/// Default width of time-based windows (milliseconds)
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Default number of prior buckets a tumbling window keeps alongside the
/// current one
pub const DEFAULT_RETAINED_BUCKETS: usize = 1;

/// Upper bound on configurable tumbling-window retention
pub const MAX_RETAINED_BUCKETS: usize = 16;

// ----------------------------------------------------------------------------
// Entry Validation Limits
// ----------------------------------------------------------------------------

/// Maximum stage name length accepted at ingest
pub const MAX_STAGE_NAME_LENGTH: usize = 256;

/// Maximum metadata entries carried by a single metric entry
pub const MAX_METADATA_ENTRIES: usize = 32;

// ----------------------------------------------------------------------------
// Export Backends
// ----------------------------------------------------------------------------

/// Default CloudWatch-style namespace
pub const DEFAULT_CLOUDWATCH_NAMESPACE: &str = "Synapse/Pipeline";

/// Default Prometheus-style metric name prefix
pub const DEFAULT_PROMETHEUS_PREFIX: &str = "synapse";

/// Default Datadog-style metric prefix
pub const DEFAULT_DATADOG_PREFIX: &str = "synapse.pipeline";

/// CloudWatch dimension values are capped at this many characters
pub const CLOUDWATCH_DIMENSION_VALUE_LIMIT: usize = 255;

/// Datadog tags are capped at this many characters
pub const DATADOG_TAG_LENGTH_LIMIT: usize = 200;

// ----------------------------------------------------------------------------
// Alarms
// ----------------------------------------------------------------------------

/// Maximum fire/resolve events kept in the alarm history
pub const ALARM_HISTORY_LIMIT: usize = 1024;

/// Default stage-duration threshold used by the demo alarm rules (ms)
pub const DEFAULT_SLOW_STAGE_THRESHOLD_MS: f64 = 2000.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types flowing through the engine: millisecond
// timestamps, the metric entry (the atomic ingested fact), and the computed
// aggregate shapes handed to exporters and consumers.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Millisecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in milliseconds since Unix epoch.
///
/// Stage events arrive with millisecond resolution; everything downstream
/// (bucket indexes, trailing-window cutoffs, export points) works in the same
/// unit so there is never a conversion at an eviction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000)
    }

    /// Current wall-clock timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Milliseconds since Unix epoch
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Whole seconds since Unix epoch
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000
    }

    /// Saturating subtraction of a millisecond span
    #[inline]
    pub const fn sub_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Saturating addition of a millisecond span
    #[inline]
    pub const fn add_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Index of the fixed-width bucket this timestamp falls into
    #[inline]
    pub const fn bucket_index(&self, width_ms: u64) -> i64 {
        self.0.div_euclid(width_ms as i64)
    }

    /// Convert to chrono for human-readable rendering
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl From<Timestamp> for i64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ----------------------------------------------------------------------------
// 3.2 Time Sources - Injectable Clocks
// ----------------------------------------------------------------------------

/// Source of "now" for components whose behavior depends on wall-clock time.
///
/// The sliding window re-reads the clock on every push and every result
/// computation, so the clock has to be swappable for deterministic tests.
pub trait TimeSource: Send + Sync {
    /// Current time according to this source
    fn now(&self) -> Timestamp;
}

/// Production time source backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven time source for tests and replays.
///
/// Holds the current instant in an atomic so clones of the handle observe
/// every `set`/`advance` immediately.
#[derive(Debug)]
pub struct ManualTimeSource {
    now_ms: AtomicI64,
}

impl ManualTimeSource {
    /// Create a manual source pinned at the given instant
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_ms: AtomicI64::new(start.as_millis()),
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, ts: Timestamp) {
        self.now_ms.store(ts.as_millis(), AtomicOrdering::Release);
    }

    /// Move the clock forward by `millis`
    pub fn advance(&self, millis: i64) {
        self.now_ms.fetch_add(millis, AtomicOrdering::AcqRel);
    }
}

impl TimeSource for ManualTimeSource {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_ms.load(AtomicOrdering::Acquire))
    }
}

/// Shared handle to a time source
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// System clock wrapped for sharing
pub fn system_time_source() -> SharedTimeSource {
    Arc::new(SystemTimeSource)
}

// ----------------------------------------------------------------------------
// 3.3 Stage Metrics - What Kind of Fact Was Observed
// ----------------------------------------------------------------------------

/// The kind of measurement carried by a metric entry.
///
/// Wire names are camelCase to stay compatible with the pipeline's existing
/// recorder payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageMetric {
    /// Stage wall time in milliseconds
    Latency,
    /// One completed invocation of a stage
    StageInvocation,
    /// Scope reads performed by a stage
    ReadCount,
    /// Scope writes performed by a stage
    WriteCount,
    /// One error raised by a stage
    ErrorCount,
}

impl StageMetric {
    /// Wire name for this metric kind
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageMetric::Latency => "latency",
            StageMetric::StageInvocation => "stageInvocation",
            StageMetric::ReadCount => "readCount",
            StageMetric::WriteCount => "writeCount",
            StageMetric::ErrorCount => "errorCount",
        }
    }
}

impl Display for StageMetric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 MetricEntry - THE ATOMIC UNIT
// ----------------------------------------------------------------------------

/// Metadata map carried by an entry (error details, operation tags)
pub type EntryMetadata = BTreeMap<CompactString, CompactString>;

/// The atomic fact ingested by the pipeline: one measurement for one stage
/// at one instant. Immutable once created; identified only by its position
/// in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    /// Stage this measurement belongs to (e.g., "Call LLM")
    pub stage_name: CompactString,
    /// Kind of measurement
    pub metric: StageMetric,
    /// The measured value
    pub value: f64,
    /// Instant the measurement was taken
    pub timestamp: Timestamp,
    /// Optional metadata (error detail, operation tag)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl MetricEntry {
    /// Create an entry stamped with the current wall-clock time
    pub fn new<N>(stage_name: N, metric: StageMetric, value: f64) -> Self
    where
        N: Into<CompactString>,
    {
        Self {
            stage_name: stage_name.into(),
            metric,
            value,
            timestamp: Timestamp::now(),
            metadata: None,
        }
    }

    /// Builder: set the timestamp explicitly
    #[inline]
    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = ts;
        self
    }

    /// Builder: attach a metadata key/value pair
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.metadata
            .get_or_insert_with(EntryMetadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Check the entry against the ingest rules.
    ///
    /// Rejection never mutates anything; callers surface the error and the
    /// entry is simply not retained.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stage_name.is_empty() {
            return Err(ValidationError::MissingStageName);
        }
        if self.stage_name.len() > MAX_STAGE_NAME_LENGTH {
            return Err(ValidationError::StageNameTooLong {
                length: self.stage_name.len(),
            });
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                stage_name: self.stage_name.to_string(),
                metric: self.metric,
            });
        }
        if let Some(metadata) = &self.metadata {
            if metadata.len() > MAX_METADATA_ENTRIES {
                return Err(ValidationError::TooManyMetadataEntries {
                    count: metadata.len(),
                });
            }
        }
        Ok(())
    }
}

impl Display for MetricEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{stage=\"{}\"}} {} @ {}",
            self.metric, self.stage_name, self.value, self.timestamp
        )
    }
}

// ----------------------------------------------------------------------------
// 3.5 Window Descriptors
// ----------------------------------------------------------------------------

/// Retention policy family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowKind {
    /// Count-bounded FIFO buffer
    RingBuffer,
    /// Fixed, non-overlapping, boundary-aligned time buckets
    Tumbling,
    /// Trailing time interval relative to "now"
    Sliding,
}

impl WindowKind {
    /// Wire name for this window kind
    pub const fn as_str(&self) -> &'static str {
        match self {
            WindowKind::RingBuffer => "ringBuffer",
            WindowKind::Tumbling => "tumbling",
            WindowKind::Sliding => "sliding",
        }
    }
}

impl Display for WindowKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor of the active retention policy, embedded in every result so a
/// consumer can see what subset of the stream the numbers describe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    /// Which retention family produced the result
    pub kind: WindowKind,
    /// Capacity, for count-bounded windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    /// Bucket or interval width, for time-based windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Prior buckets retained, for tumbling windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_buckets: Option<usize>,
    /// Entries retained at computation time
    pub sample_count: usize,
}

// ----------------------------------------------------------------------------
// 3.6 Percentile Sets & Metric Results
// ----------------------------------------------------------------------------

/// Percentile summary over one set of latency samples.
///
/// All fields are zero when `count` is zero; downstream code never sees NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileSet {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
}

impl PercentileSet {
    /// The empty summary
    pub const ZERO: PercentileSet = PercentileSet {
        p50: 0.0,
        p95: 0.0,
        p99: 0.0,
        min: 0.0,
        max: 0.0,
        mean: 0.0,
        count: 0,
    };

    /// True when no samples contributed
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of the contributing samples
    #[inline]
    pub fn sum(&self) -> f64 {
        self.mean * self.count as f64
    }
}

impl Default for PercentileSet {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Aggregate computed on demand from the entries a window currently retains.
///
/// `stage_percentiles` keys are exactly the distinct stage names among
/// retained latency entries; `stage_errors` likewise for error entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricResult {
    /// Latency summary across all stages
    pub latency_percentiles: PercentileSet,
    /// Per-stage latency summaries, ordered by stage name
    pub stage_percentiles: BTreeMap<String, PercentileSet>,
    /// Error entries retained, total
    pub total_errors: u64,
    /// Error entries retained, per stage
    pub stage_errors: BTreeMap<String, u64>,
    /// Invocation entries retained
    pub total_invocations: u64,
    /// Descriptor of the window that produced this result
    pub window_info: WindowInfo,
    /// When the result was computed
    pub computed_at: Timestamp,
}

impl MetricResult {
    /// True when the window held no entries at all
    pub fn is_empty(&self) -> bool {
        self.window_info.sample_count == 0
    }

    /// Stage names that currently carry latency samples
    pub fn latency_bearing_stages(&self) -> impl Iterator<Item = (&String, &PercentileSet)> {
        self.stage_percentiles.iter().filter(|(_, set)| !set.is_empty())
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the engine. Nothing here is fatal to a
// host process: every failure is local to one entry, one adapter, or one
// lookup, and the caller can retry or skip.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Synapse engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum SynapseError {
    // ---- Ingest Errors ----
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // ---- Export Errors ----
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    // ---- Execution Tree Errors ----
    #[error("Execution tree error: {0}")]
    Tree(#[from] TreeError),

    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynapseError {
    /// Check if this error is recoverable by retrying or skipping
    pub fn is_recoverable(&self) -> bool {
        match self {
            SynapseError::Validation(_) => true,
            SynapseError::Export(_) => true,
            SynapseError::Tree(e) => e.is_recoverable(),
            SynapseError::Config(_) => false,
            SynapseError::Io(_) => true,
            SynapseError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            SynapseError::Validation(_) => "validation",
            SynapseError::Export(_) => "export",
            SynapseError::Tree(_) => "tree",
            SynapseError::Config(_) => "config",
            SynapseError::Io(_) => "io",
            SynapseError::Internal(_) => "internal",
        }
    }
}

/// Convenience result alias for engine operations
pub type SynapseResult<T> = Result<T, SynapseError>;

// ----------------------------------------------------------------------------
// 4.2 Validation Errors
// ----------------------------------------------------------------------------

/// A malformed metric entry was rejected at ingest.
///
/// Strategy state is never touched by a rejected entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Metric entry has an empty stage name")]
    MissingStageName,

    #[error("Stage name exceeds {MAX_STAGE_NAME_LENGTH} characters (got {length})")]
    StageNameTooLong { length: usize },

    #[error("Metric '{metric}' for stage '{stage_name}' has a non-finite value")]
    NonFiniteValue {
        stage_name: String,
        metric: StageMetric,
    },

    #[error("Metric entry carries {count} metadata entries (limit {MAX_METADATA_ENTRIES})")]
    TooManyMetadataEntries { count: usize },
}

// ----------------------------------------------------------------------------
// 4.3 Export Errors
// ----------------------------------------------------------------------------

/// A backend-specific rendering failure.
///
/// Local to one adapter: other adapters fed from the same entry stream and
/// the underlying window strategy are unaffected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    #[error("{backend}: invalid metric name or prefix '{name}'")]
    InvalidMetricName { backend: &'static str, name: String },

    #[error("{backend}: unsupported metric shape: {message}")]
    UnsupportedShape {
        backend: &'static str,
        message: String,
    },

    #[error("{backend}: payload serialization failed: {message}")]
    Serialization {
        backend: &'static str,
        message: String,
    },
}

impl ExportError {
    /// Which backend rejected the render
    pub fn backend(&self) -> &'static str {
        match self {
            ExportError::InvalidMetricName { backend, .. } => backend,
            ExportError::UnsupportedShape { backend, .. } => backend,
            ExportError::Serialization { backend, .. } => backend,
        }
    }

    pub fn unsupported_shape(backend: &'static str, message: impl Into<String>) -> Self {
        ExportError::UnsupportedShape {
            backend,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Execution Tree Errors
// ----------------------------------------------------------------------------

/// Errors from the execution tree and its navigator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("Stage id '{id}' already present in the execution tree")]
    DuplicateStageId { id: String },

    #[error("Stage id '{id}' not found in the execution tree")]
    StageNotFound { id: String },

    #[error("Parent '{parent_id}' for stage '{id}' does not exist")]
    ParentNotFound { id: String, parent_id: String },

    #[error("Parent '{parent_id}' for stage '{id}' is not a subflow node")]
    ParentNotSubflow { id: String, parent_id: String },
}

impl TreeError {
    /// Duplicate ids are programming errors; lookups are routine misses
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TreeError::StageNotFound { .. })
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        TreeError::StageNotFound { id: id.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with TOML file parsing, environment variable
// overrides (SYNAPSE_ prefix), validation, and sensible defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the entire Synapse engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Retention window used by the collector's default strategy
    #[serde(default)]
    pub window: WindowConfig,

    /// Export backend configurations
    #[serde(default)]
    pub exporters: ExportersConfig,

    /// Alarm rules evaluated against live stage events
    #[serde(default)]
    pub alarms: AlarmsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SYNAPSE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate("window")?;

        if self.exporters.cloudwatch.enabled && self.exporters.cloudwatch.namespace.is_empty() {
            return Err(ConfigError::invalid_value(
                "exporters.cloudwatch.namespace",
                "Namespace cannot be empty",
            ));
        }
        if self.exporters.prometheus.enabled && self.exporters.prometheus.buffer_size == 0 {
            return Err(ConfigError::invalid_value(
                "exporters.prometheus.buffer_size",
                "Ring buffer capacity must be at least 1",
            ));
        }
        if self.exporters.datadog.enabled && self.exporters.datadog.window_ms == 0 {
            return Err(ConfigError::invalid_value(
                "exporters.datadog.window_ms",
                "Sliding window width must be at least 1ms",
            ));
        }

        for (i, rule) in self.alarms.rules.iter().enumerate() {
            if rule.name.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("alarms.rules[{i}].name"),
                    "Alarm rule name cannot be empty",
                ));
            }
            if !rule.threshold.is_finite() {
                return Err(ConfigError::invalid_value(
                    format!("alarms.rules[{i}].threshold"),
                    "Alarm threshold must be finite",
                ));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            environment: default_environment(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Window Configuration
// ----------------------------------------------------------------------------

/// Declarative description of a retention window; `build` turns it into a
/// live strategy (strategy selection happens here, at construction, never
/// inside shared code).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Retention family
    #[serde(default = "default_window_kind")]
    pub kind: WindowKind,

    /// Capacity for ring-buffer windows
    #[serde(default = "default_ring_capacity")]
    pub max_size: usize,

    /// Width for time-based windows (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Prior buckets retained by tumbling windows
    #[serde(default = "default_retained_buckets")]
    pub retained_buckets: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            kind: default_window_kind(),
            max_size: default_ring_capacity(),
            window_ms: default_window_ms(),
            retained_buckets: default_retained_buckets(),
        }
    }
}

impl WindowConfig {
    /// Validate against engine limits
    pub fn validate(&self, field_prefix: &str) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid_value(
                format!("{field_prefix}.max_size"),
                "Ring buffer capacity must be at least 1",
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid_value(
                format!("{field_prefix}.window_ms"),
                "Window width must be at least 1ms",
            ));
        }
        if self.retained_buckets > MAX_RETAINED_BUCKETS {
            return Err(ConfigError::invalid_value(
                format!("{field_prefix}.retained_buckets"),
                format!("Cannot retain more than {MAX_RETAINED_BUCKETS} prior buckets"),
            ));
        }
        Ok(())
    }

    /// Build the configured strategy
    pub fn build(&self, time_source: SharedTimeSource) -> Box<dyn WindowStrategy> {
        match self.kind {
            WindowKind::RingBuffer => Box::new(RingBufferStrategy::new(self.max_size)),
            WindowKind::Tumbling => Box::new(TumblingWindowStrategy::with_retention(
                self.window_ms,
                self.retained_buckets,
            )),
            WindowKind::Sliding => Box::new(SlidingWindowStrategy::with_time_source(
                self.window_ms,
                time_source,
            )),
        }
    }
}

fn default_window_kind() -> WindowKind {
    WindowKind::RingBuffer
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_BUFFER_CAPACITY
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_retained_buckets() -> usize {
    DEFAULT_RETAINED_BUCKETS
}

// ----------------------------------------------------------------------------
// 5.4 Exporter Configuration
// ----------------------------------------------------------------------------

/// Configuration for all export backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportersConfig {
    /// In-memory exporter (test harnesses)
    #[serde(default)]
    pub in_memory: InMemoryExporterConfig,

    /// CloudWatch-style exporter
    #[serde(default)]
    pub cloudwatch: CloudWatchExporterConfig,

    /// Prometheus-style exporter
    #[serde(default)]
    pub prometheus: PrometheusExporterConfig,

    /// Datadog-style exporter
    #[serde(default)]
    pub datadog: DatadogExporterConfig,
}

/// In-memory exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryExporterConfig {
    /// Enable this exporter
    #[serde(default)]
    pub enabled: bool,

    /// Ring buffer capacity for the owned strategy
    #[serde(default = "default_ring_capacity")]
    pub buffer_size: usize,
}

impl Default for InMemoryExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: default_ring_capacity(),
        }
    }
}

/// CloudWatch-style exporter configuration.
///
/// Pairs with a tumbling window by default to match periodic billing-style
/// reporting semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudWatchExporterConfig {
    /// Enable this exporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Namespace grouping all emitted metric data
    #[serde(default = "default_cloudwatch_namespace")]
    pub namespace: String,

    /// Tumbling bucket width (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Prior buckets retained
    #[serde(default = "default_retained_buckets")]
    pub retained_buckets: usize,
}

impl Default for CloudWatchExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_cloudwatch_namespace(),
            window_ms: default_window_ms(),
            retained_buckets: default_retained_buckets(),
        }
    }
}

fn default_cloudwatch_namespace() -> String {
    DEFAULT_CLOUDWATCH_NAMESPACE.into()
}

/// Prometheus-style exporter configuration.
///
/// Pairs with a ring buffer by default: pull-based scraping wants a cheap,
/// time-independent retention with a predictable footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusExporterConfig {
    /// Enable this exporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metric name prefix for all exposition lines
    #[serde(default = "default_prometheus_prefix")]
    pub prefix: String,

    /// Ring buffer capacity for the owned strategy
    #[serde(default = "default_ring_capacity")]
    pub buffer_size: usize,
}

impl Default for PrometheusExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_prometheus_prefix(),
            buffer_size: default_ring_capacity(),
        }
    }
}

fn default_prometheus_prefix() -> String {
    DEFAULT_PROMETHEUS_PREFIX.into()
}

/// Datadog-style exporter configuration.
///
/// Pairs with a sliding window by default to mirror rolling dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatadogExporterConfig {
    /// Enable this exporter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metric name prefix for all series
    #[serde(default = "default_datadog_prefix")]
    pub prefix: String,

    /// Trailing window width (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Extra tags attached to every series
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for DatadogExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_datadog_prefix(),
            window_ms: default_window_ms(),
            tags: Vec::new(),
        }
    }
}

fn default_datadog_prefix() -> String {
    DEFAULT_DATADOG_PREFIX.into()
}

// ----------------------------------------------------------------------------
// 5.5 Alarm Configuration
// ----------------------------------------------------------------------------

/// Alarm rules evaluated against live stage events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmsConfig {
    /// Rules to evaluate; empty disables alarming entirely
    #[serde(default)]
    pub rules: Vec<AlarmRule>,
}

impl AlarmsConfig {
    /// The rule set the demo pipeline runs with
    pub fn demo_rules() -> Self {
        Self {
            rules: vec![
                AlarmRule::new("high-error-rate", AlarmMetricKind::ErrorCount, 3.0, AlarmComparison::Gte),
                AlarmRule::new(
                    "slow-stage",
                    AlarmMetricKind::StageDuration,
                    DEFAULT_SLOW_STAGE_THRESHOLD_MS,
                    AlarmComparison::Gt,
                )
                .for_stage("Call LLM"),
                AlarmRule::new(
                    "cascade-failure",
                    AlarmMetricKind::ConsecutiveErrors,
                    2.0,
                    AlarmComparison::Gte,
                ),
            ],
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> SynapseResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SynapseError::Internal(format!("Failed to set logger: {e}")))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SynapseError::Internal(format!("Failed to set logger: {e}")))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true),
                );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| SynapseError::Internal(format!("Failed to set logger: {e}")))?;
        }
    }

    info!(
        target: "synapse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: PERCENTILE COMPUTATION
// ============================================================================
// Pure statistics over the entries a window currently retains. Nearest-rank
// percentiles: sort ascending, p_k = value at rank ceil(k/100 * count) - 1,
// clamped to the valid index range. count == 0 yields all-zero summaries,
// never NaN or a division failure.
// ============================================================================

/// Percentile and count computation shared by every window strategy.
#[derive(Debug)]
pub struct PercentileComputer;

impl PercentileComputer {
    /// Nearest-rank percentile over an ascending-sorted slice.
    ///
    /// `k` is the percentile level in percent (50.0, 95.0, 99.0).
    pub fn nearest_rank(sorted: &[f64], k: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (k / 100.0 * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Summarize one set of latency samples. Sorts in place.
    pub fn summarize(values: &mut Vec<f64>) -> PercentileSet {
        if values.is_empty() {
            return PercentileSet::ZERO;
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let count = values.len();
        let sum: f64 = values.iter().sum();

        PercentileSet {
            p50: Self::nearest_rank(values, 50.0),
            p95: Self::nearest_rank(values, 95.0),
            p99: Self::nearest_rank(values, 99.0),
            min: values[0],
            max: values[count - 1],
            mean: sum / count as f64,
            count: count as u64,
        }
    }

    /// Compute a full result from the entries a window currently retains.
    ///
    /// `stage_percentiles` keys end up being exactly the distinct stage names
    /// among the latency entries; `stage_errors` likewise for error entries.
    pub fn compute(
        entries: &[MetricEntry],
        window_info: WindowInfo,
        computed_at: Timestamp,
    ) -> MetricResult {
        let mut overall_latencies: Vec<f64> = Vec::new();
        let mut stage_latencies: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut stage_errors: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_errors: u64 = 0;
        let mut total_invocations: u64 = 0;

        for entry in entries {
            match entry.metric {
                StageMetric::Latency => {
                    overall_latencies.push(entry.value);
                    stage_latencies
                        .entry(entry.stage_name.to_string())
                        .or_default()
                        .push(entry.value);
                }
                StageMetric::StageInvocation => total_invocations += 1,
                StageMetric::ErrorCount => {
                    total_errors += 1;
                    *stage_errors.entry(entry.stage_name.to_string()).or_default() += 1;
                }
                StageMetric::ReadCount | StageMetric::WriteCount => {}
            }
        }

        let latency_percentiles = PercentileComputer::summarize(&mut overall_latencies);
        let stage_percentiles = stage_latencies
            .into_iter()
            .map(|(stage, mut samples)| (stage, PercentileComputer::summarize(&mut samples)))
            .collect();

        MetricResult {
            latency_percentiles,
            stage_percentiles,
            total_errors,
            stage_errors,
            total_invocations,
            window_info,
            computed_at,
        }
    }
}

// ============================================================================
// SECTION 8: WINDOW STRATEGIES
// ============================================================================
// Stateful containers implementing one retention policy each over a stream
// of metric entries. The public contract is identical across variants:
// push validates-or-rejects without corrupting state, metric_result computes
// an aggregate over whatever is currently retained. Memory is bounded by
// construction in all three variants - that bound is the reason this
// subsystem exists.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 The Strategy Contract
// ----------------------------------------------------------------------------

/// One retention policy over a stream of metric entries.
///
/// Single writer per strategy: one collector (or one pipeline run) owns an
/// instance and calls `push` synchronously. Sharing an instance between a
/// collector and an exporter goes through [`SharedStrategy`], which
/// serializes every operation under one lock.
pub trait WindowStrategy: Send {
    /// Ingest one entry. Malformed entries are rejected with a
    /// [`ValidationError`] and existing state is untouched.
    fn push(&mut self, entry: MetricEntry) -> Result<(), ValidationError>;

    /// Compute the aggregate over the currently retained entries.
    ///
    /// Takes `&mut self` because time-based variants evict lazily on access;
    /// the computation itself is deterministic in the retained entries.
    fn metric_result(&mut self) -> MetricResult;

    /// Descriptor of this window's policy and current occupancy
    fn window_info(&self) -> WindowInfo;

    /// Retention family
    fn kind(&self) -> WindowKind;

    /// Entries currently retained
    fn sample_count(&self) -> usize;
}

/// Shared handle to a strategy owned by an exporter and fed by a collector.
///
/// All mutation and reads serialize under the one mutex, which is the
/// concurrency discipline the engine assumes (no lock-free structures).
pub type SharedStrategy = Arc<Mutex<Box<dyn WindowStrategy>>>;

/// Wrap a strategy for sharing between an exporter and a collector
pub fn shared_strategy<S: WindowStrategy + 'static>(strategy: S) -> SharedStrategy {
    Arc::new(Mutex::new(Box::new(strategy)))
}

// ----------------------------------------------------------------------------
// 8.2 Ring Buffer Strategy
// ----------------------------------------------------------------------------

/// Count-bounded FIFO retention: the most recent `capacity` entries.
///
/// Deterministic and time-independent; the only state is the buffer itself.
/// The cheapest window when total volume is predictable.
#[derive(Debug)]
pub struct RingBufferStrategy {
    capacity: usize,
    entries: VecDeque<MetricEntry>,
    total_pushed: u64,
    total_evicted: u64,
}

impl RingBufferStrategy {
    /// Create a ring buffer retaining at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            total_pushed: 0,
            total_evicted: 0,
        }
    }

    /// Configured capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted so far
    #[inline]
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    /// Iterate the retained entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &MetricEntry> {
        self.entries.iter()
    }
}

impl WindowStrategy for RingBufferStrategy {
    fn push(&mut self, entry: MetricEntry) -> Result<(), ValidationError> {
        entry.validate()?;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.total_evicted += 1;
        }
        self.entries.push_back(entry);
        self.total_pushed += 1;
        Ok(())
    }

    fn metric_result(&mut self) -> MetricResult {
        let info = self.window_info();
        PercentileComputer::compute(self.entries.make_contiguous(), info, Timestamp::now())
    }

    fn window_info(&self) -> WindowInfo {
        WindowInfo {
            kind: WindowKind::RingBuffer,
            max_size: Some(self.capacity),
            window_ms: None,
            retained_buckets: None,
            sample_count: self.entries.len(),
        }
    }

    fn kind(&self) -> WindowKind {
        WindowKind::RingBuffer
    }

    fn sample_count(&self) -> usize {
        self.entries.len()
    }
}

// ----------------------------------------------------------------------------
// 8.3 Tumbling Window Strategy
// ----------------------------------------------------------------------------

/// One time bucket of a tumbling window
#[derive(Debug)]
struct TumblingBucket {
    index: i64,
    entries: Vec<MetricEntry>,
}

/// Fixed, non-overlapping time buckets aligned to
/// `floor(timestamp / window_ms)`.
///
/// Retains the current bucket plus a bounded number of immediately preceding
/// buckets; older buckets are dropped wholesale - entries and all - the
/// moment a newer bucket first opens. Aggregation spans all retained buckets.
#[derive(Debug)]
pub struct TumblingWindowStrategy {
    window_ms: u64,
    retained_buckets: usize,
    /// Retained buckets ordered by ascending index
    buckets: VecDeque<TumblingBucket>,
    dropped_buckets: u64,
}

impl TumblingWindowStrategy {
    /// Create a tumbling window with the default retention
    /// (current + [`DEFAULT_RETAINED_BUCKETS`] prior buckets)
    pub fn new(window_ms: u64) -> Self {
        Self::with_retention(window_ms, DEFAULT_RETAINED_BUCKETS)
    }

    /// Create a tumbling window retaining `retained_buckets` prior buckets
    /// alongside the current one
    pub fn with_retention(window_ms: u64, retained_buckets: usize) -> Self {
        Self {
            window_ms: window_ms.max(1),
            retained_buckets: retained_buckets.min(MAX_RETAINED_BUCKETS),
            buckets: VecDeque::new(),
            dropped_buckets: 0,
        }
    }

    /// Bucket width in milliseconds
    #[inline]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Buckets dropped so far
    #[inline]
    pub fn dropped_buckets(&self) -> u64 {
        self.dropped_buckets
    }

    /// Drop buckets that fell out of retention after `newest` opened
    fn evict_before(&mut self, newest: i64) {
        let oldest_kept = newest - self.retained_buckets as i64;
        while self.buckets.front().is_some_and(|b| b.index < oldest_kept) {
            if let Some(dropped) = self.buckets.pop_front() {
                self.dropped_buckets += 1;
                trace!(
                    target: "synapse::window",
                    bucket = dropped.index,
                    entries = dropped.entries.len(),
                    "Tumbling bucket dropped"
                );
            }
        }
    }
}

impl WindowStrategy for TumblingWindowStrategy {
    fn push(&mut self, entry: MetricEntry) -> Result<(), ValidationError> {
        entry.validate()?;
        let index = entry.timestamp.bucket_index(self.window_ms);
        let newest_index = self.buckets.back().map(|b| b.index);

        match newest_index {
            None => {
                self.buckets.push_back(TumblingBucket {
                    index,
                    entries: vec![entry],
                });
            }
            Some(newest) if index > newest => {
                self.buckets.push_back(TumblingBucket {
                    index,
                    entries: vec![entry],
                });
                self.evict_before(index);
            }
            Some(_) => {
                // Entry for a current or prior bucket: append if that bucket
                // is still retained, otherwise it is already out of scope.
                match self.buckets.iter_mut().find(|b| b.index == index) {
                    Some(bucket) => bucket.entries.push(entry),
                    None => {
                        trace!(
                            target: "synapse::window",
                            bucket = index,
                            "Entry for an expired tumbling bucket discarded"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    fn metric_result(&mut self) -> MetricResult {
        let info = self.window_info();
        let entries: Vec<MetricEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        PercentileComputer::compute(&entries, info, Timestamp::now())
    }

    fn window_info(&self) -> WindowInfo {
        WindowInfo {
            kind: WindowKind::Tumbling,
            max_size: None,
            window_ms: Some(self.window_ms),
            retained_buckets: Some(self.retained_buckets),
            sample_count: self.sample_count(),
        }
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Tumbling
    }

    fn sample_count(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }
}

// ----------------------------------------------------------------------------
// 8.4 Sliding Window Strategy
// ----------------------------------------------------------------------------

/// Trailing time interval: retains entries with
/// `timestamp >= now - window_ms`, where `now` is re-read from the time
/// source at every push and every result computation.
///
/// Eviction is lazy, on each access, which keeps memory bounded to the
/// entries genuinely inside the trailing window under sustained input.
/// Entries are expected in nondecreasing timestamp order (the collector
/// stamps them that way), so eviction pops from the front.
pub struct SlidingWindowStrategy {
    window_ms: u64,
    entries: VecDeque<MetricEntry>,
    time_source: SharedTimeSource,
    total_evicted: u64,
}

impl fmt::Debug for SlidingWindowStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowStrategy")
            .field("window_ms", &self.window_ms)
            .field("sample_count", &self.entries.len())
            .field("total_evicted", &self.total_evicted)
            .finish()
    }
}

impl SlidingWindowStrategy {
    /// Create a sliding window on the system clock
    pub fn new(window_ms: u64) -> Self {
        Self::with_time_source(window_ms, system_time_source())
    }

    /// Create a sliding window on an injected clock (tests, replays)
    pub fn with_time_source(window_ms: u64, time_source: SharedTimeSource) -> Self {
        Self {
            window_ms: window_ms.max(1),
            entries: VecDeque::new(),
            time_source,
            total_evicted: 0,
        }
    }

    /// Window width in milliseconds
    #[inline]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Entries evicted so far
    #[inline]
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    /// Inclusive cutoff: entries at or after this instant are retained
    fn cutoff(&self) -> Timestamp {
        self.time_source.now().sub_millis(self.window_ms as i64)
    }

    /// Evict entries that left the trailing window
    fn evict_expired(&mut self) {
        let cutoff = self.cutoff();
        while let Some(front) = self.entries.front() {
            if front.timestamp < cutoff {
                self.entries.pop_front();
                self.total_evicted += 1;
            } else {
                break;
            }
        }
    }
}

impl WindowStrategy for SlidingWindowStrategy {
    fn push(&mut self, entry: MetricEntry) -> Result<(), ValidationError> {
        entry.validate()?;
        self.evict_expired();
        // An entry already outside the trailing window would be evicted on
        // the next access; don't retain it at all.
        if entry.timestamp >= self.cutoff() {
            self.entries.push_back(entry);
        }
        Ok(())
    }

    fn metric_result(&mut self) -> MetricResult {
        self.evict_expired();
        let info = self.window_info();
        PercentileComputer::compute(self.entries.make_contiguous(), info, self.time_source.now())
    }

    fn window_info(&self) -> WindowInfo {
        WindowInfo {
            kind: WindowKind::Sliding,
            max_size: None,
            window_ms: Some(self.window_ms),
            retained_buckets: None,
            sample_count: self.entries.len(),
        }
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Sliding
    }

    fn sample_count(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// SECTION 9: PHASE 1 TESTS
// ============================================================================


// ============================================================================
// SECTION 10: STAGE EVENT BUS & METRIC COLLECTOR
// ============================================================================
// The seam between the agent pipeline and this subsystem. The pipeline holds
// one event bus; the bus holds an ordered list of observers and notifies them
// synchronously, in registration order, as stage events occur. No global
// registry anywhere - observers are registered explicitly on the bus that
// needs them.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Pipeline Observer Trait
// ----------------------------------------------------------------------------

/// Receiver of stage lifecycle notifications from a pipeline run.
///
/// Stages that never complete (aborted mid-run) produce no notification at
/// all; that gap is part of the contract.
pub trait PipelineObserver: Send {
    /// Observer name for logging and diagnostics
    fn name(&self) -> &str;

    /// A stage finished successfully after `duration_ms`, having performed
    /// `read_count` scope reads and `write_count` scope writes.
    fn on_stage_end(&mut self, stage_name: &str, duration_ms: f64, read_count: u64, write_count: u64);

    /// A stage raised an error described by `detail`.
    fn on_stage_error(&mut self, stage_name: &str, detail: &str);
}

// ----------------------------------------------------------------------------
// 10.2 Stage Event Bus
// ----------------------------------------------------------------------------

/// Ordered, synchronous fan-out of stage events to registered observers.
#[derive(Default)]
pub struct StageEventBus {
    observers: Vec<Box<dyn PipelineObserver>>,
}

impl fmt::Debug for StageEventBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl StageEventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; notification order follows registration order
    pub fn register<O: PipelineObserver + 'static>(&mut self, observer: O) {
        debug!(
            target: "synapse::bus",
            observer = observer.name(),
            position = self.observers.len(),
            "Observer registered"
        );
        self.observers.push(Box::new(observer));
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Notify every observer of a completed stage
    pub fn notify_stage_end(
        &mut self,
        stage_name: &str,
        duration_ms: f64,
        read_count: u64,
        write_count: u64,
    ) {
        for observer in &mut self.observers {
            observer.on_stage_end(stage_name, duration_ms, read_count, write_count);
        }
    }

    /// Notify every observer of a stage error
    pub fn notify_stage_error(&mut self, stage_name: &str, detail: &str) {
        for observer in &mut self.observers {
            observer.on_stage_error(stage_name, detail);
        }
    }
}

// ----------------------------------------------------------------------------
// 10.3 Metric Collector
// ----------------------------------------------------------------------------

/// Adapts stage lifecycle events into metric entries and feeds every
/// attached window strategy.
///
/// One completed stage becomes four entries (latency, invocation, reads,
/// writes); one error becomes a single error entry carrying the detail in
/// its metadata. All entries are stamped from the collector's time source
/// at emission.
pub struct MetricCollector {
    id: CompactString,
    strategies: Vec<SharedStrategy>,
    time_source: SharedTimeSource,
    entries_emitted: u64,
    entries_rejected: u64,
}

impl fmt::Debug for MetricCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricCollector")
            .field("id", &self.id)
            .field("strategies", &self.strategies.len())
            .field("entries_emitted", &self.entries_emitted)
            .field("entries_rejected", &self.entries_rejected)
            .finish()
    }
}

impl MetricCollector {
    /// Create a collector stamping entries from the system clock
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self::with_time_source(id, system_time_source())
    }

    /// Create a collector on an injected clock (tests, replays)
    pub fn with_time_source(id: impl Into<CompactString>, time_source: SharedTimeSource) -> Self {
        Self {
            id: id.into(),
            strategies: Vec::new(),
            time_source,
            entries_emitted: 0,
            entries_rejected: 0,
        }
    }

    /// Attach a strategy handle; every emitted entry is fed to all attached
    /// strategies
    pub fn attach(&mut self, strategy: SharedStrategy) -> &mut Self {
        self.strategies.push(strategy);
        self
    }

    /// Attach the strategy owned by an export adapter
    pub fn attach_adapter(&mut self, adapter: &dyn ExportAdapter) -> &mut Self {
        self.attach(adapter.strategy())
    }

    /// Number of attached strategies
    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Entries accepted and fanned out so far
    pub fn entries_emitted(&self) -> u64 {
        self.entries_emitted
    }

    /// Entries rejected by validation so far
    pub fn entries_rejected(&self) -> u64 {
        self.entries_rejected
    }

    /// Validate once, then fan the entry out to every attached strategy.
    fn emit(&mut self, entry: MetricEntry) {
        // One upfront validation: every strategy applies the same ingest
        // rules, so a malformed entry is counted and dropped exactly once.
        if let Err(e) = entry.validate() {
            self.entries_rejected += 1;
            warn!(
                target: "synapse::collector",
                collector = %self.id,
                error = %e,
                "Metric entry rejected"
            );
            return;
        }

        for strategy in &self.strategies {
            // Validation already passed; a strategy-side rejection here would
            // mean the ingest rules diverged, which is a bug worth logging.
            if let Err(e) = strategy.lock().push(entry.clone()) {
                warn!(
                    target: "synapse::collector",
                    collector = %self.id,
                    error = %e,
                    "Strategy rejected a validated entry"
                );
            }
        }
        self.entries_emitted += 1;
    }
}

impl PipelineObserver for MetricCollector {
    fn name(&self) -> &str {
        &self.id
    }

    fn on_stage_end(&mut self, stage_name: &str, duration_ms: f64, read_count: u64, write_count: u64) {
        let now = self.time_source.now();
        trace!(
            target: "synapse::collector",
            collector = %self.id,
            stage = stage_name,
            duration_ms,
            "Stage completed"
        );

        self.emit(
            MetricEntry::new(stage_name, StageMetric::Latency, duration_ms).with_timestamp(now),
        );
        self.emit(
            MetricEntry::new(stage_name, StageMetric::StageInvocation, 1.0).with_timestamp(now),
        );
        self.emit(
            MetricEntry::new(stage_name, StageMetric::ReadCount, read_count as f64)
                .with_timestamp(now),
        );
        self.emit(
            MetricEntry::new(stage_name, StageMetric::WriteCount, write_count as f64)
                .with_timestamp(now),
        );
    }

    fn on_stage_error(&mut self, stage_name: &str, detail: &str) {
        let now = self.time_source.now();
        debug!(
            target: "synapse::collector",
            collector = %self.id,
            stage = stage_name,
            detail,
            "Stage error observed"
        );

        self.emit(
            MetricEntry::new(stage_name, StageMetric::ErrorCount, 1.0)
                .with_timestamp(now)
                .with_metadata("error", detail)
                .with_metadata("operation", "stage_execution"),
        );
    }
}

// ============================================================================
// SECTION 11: EXPORT ADAPTERS
// ============================================================================
// Polymorphic sinks rendering a metric result into a backend-native payload.
// Four variants behind one trait: in-memory (test harnesses), CloudWatch
// style (statistic sets under a namespace), Prometheus style (exposition
// text), Datadog style (tagged series). Each adapter owns exactly one window
// strategy, chosen at construction; rendering is pure and a failure in one
// adapter can never block or corrupt another.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Capabilities & the Adapter Trait
// ----------------------------------------------------------------------------

/// What a backend can natively represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCapabilities {
    /// Backend has a native histogram/summary representation
    pub supports_histograms: bool,
    /// Backend carries dimensional labels or tags
    pub supports_labels: bool,
    /// Backend is push-based (vs pull/scrape)
    pub supports_push: bool,
}

/// One export backend. Owns a window strategy (exposed through `strategy` so
/// a collector can feed it) and renders results into the backend's native
/// shape.
pub trait ExportAdapter: Send {
    /// Backend name for logging and error attribution
    fn name(&self) -> &'static str;

    /// What this backend can natively represent
    fn capabilities(&self) -> ExportCapabilities;

    /// Handle to the owned strategy, for collectors to feed
    fn strategy(&self) -> SharedStrategy;

    /// Pure rendering of a result into the backend-native payload.
    /// Never mutates the owned strategy.
    fn render(&self, result: &MetricResult) -> Result<ExportPayload, ExportError>;

    /// Compute the current result from the owned strategy and render it.
    fn export(&self) -> Result<ExportPayload, ExportError> {
        let result = self.strategy().lock().metric_result();
        self.render(&result)
    }
}

/// A rendered, backend-native export payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExportPayload {
    /// The raw result, unchanged, for assertions
    InMemory(MetricResult),
    /// CloudWatch-style statistic sets under a namespace
    CloudWatch(CloudWatchPayload),
    /// Prometheus-style exposition text
    Prometheus(String),
    /// Datadog-style tagged series
    Datadog(DatadogPayload),
}

impl ExportPayload {
    /// The raw result, if this is an in-memory payload
    pub fn as_metric_result(&self) -> Option<&MetricResult> {
        match self {
            ExportPayload::InMemory(result) => Some(result),
            _ => None,
        }
    }

    /// The exposition text, if this is a Prometheus payload
    pub fn as_exposition_text(&self) -> Option<&str> {
        match self {
            ExportPayload::Prometheus(text) => Some(text),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 In-Memory Exporter
// ----------------------------------------------------------------------------

/// Pass-through exporter for test harnesses: the payload is the result.
pub struct InMemoryExporter {
    strategy: SharedStrategy,
}

impl fmt::Debug for InMemoryExporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryExporter").finish()
    }
}

impl InMemoryExporter {
    /// Create with an explicit strategy
    pub fn new(strategy: SharedStrategy) -> Self {
        Self { strategy }
    }

    /// Create with a ring buffer of the given capacity
    pub fn with_ring_buffer(capacity: usize) -> Self {
        Self::new(shared_strategy(RingBufferStrategy::new(capacity)))
    }
}

impl ExportAdapter for InMemoryExporter {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            supports_histograms: true,
            supports_labels: true,
            supports_push: false,
        }
    }

    fn strategy(&self) -> SharedStrategy {
        Arc::clone(&self.strategy)
    }

    fn render(&self, result: &MetricResult) -> Result<ExportPayload, ExportError> {
        Ok(ExportPayload::InMemory(result.clone()))
    }
}

// ----------------------------------------------------------------------------
// 11.3 CloudWatch-Style Exporter
// ----------------------------------------------------------------------------

/// A single CloudWatch-style dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudWatchDimension {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// CloudWatch-style statistic set: the backend ingests pre-aggregated
/// sample statistics rather than raw samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudWatchStatisticValues {
    #[serde(rename = "SampleCount")]
    pub sample_count: f64,
    #[serde(rename = "Sum")]
    pub sum: f64,
    #[serde(rename = "Minimum")]
    pub minimum: f64,
    #[serde(rename = "Maximum")]
    pub maximum: f64,
}

/// One CloudWatch-style metric datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudWatchDatum {
    #[serde(rename = "MetricName")]
    pub metric_name: String,
    #[serde(rename = "Dimensions")]
    pub dimensions: SmallVec<[CloudWatchDimension; 2]>,
    #[serde(rename = "StatisticValues")]
    pub statistic_values: CloudWatchStatisticValues,
    #[serde(rename = "Unit")]
    pub unit: String,
}

/// Full CloudWatch-style payload: metric data grouped under a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudWatchPayload {
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "MetricData")]
    pub metric_data: Vec<CloudWatchDatum>,
}

/// Renders latency statistic sets under a configured namespace: one datum
/// per latency-bearing stage plus one overall datum.
///
/// Pairs with a tumbling window by default - periodic, boundary-aligned
/// reporting is how this backend's billing-style ingestion thinks.
pub struct CloudWatchExporter {
    namespace: String,
    strategy: SharedStrategy,
}

impl fmt::Debug for CloudWatchExporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudWatchExporter")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl CloudWatchExporter {
    /// Create with an explicit strategy
    pub fn new(namespace: impl Into<String>, strategy: SharedStrategy) -> Self {
        Self {
            namespace: namespace.into(),
            strategy,
        }
    }

    /// Create with the default pairing: a tumbling window
    pub fn with_tumbling(
        namespace: impl Into<String>,
        window_ms: u64,
        retained_buckets: usize,
    ) -> Self {
        Self::new(
            namespace,
            shared_strategy(TumblingWindowStrategy::with_retention(
                window_ms,
                retained_buckets,
            )),
        )
    }

    /// Build from configuration
    pub fn from_config(config: &CloudWatchExporterConfig) -> Self {
        Self::with_tumbling(&config.namespace, config.window_ms, config.retained_buckets)
    }

    fn datum(
        metric_name: &str,
        dimension_name: &str,
        dimension_value: &str,
        set: &PercentileSet,
    ) -> Result<CloudWatchDatum, ExportError> {
        if dimension_value.len() > CLOUDWATCH_DIMENSION_VALUE_LIMIT {
            return Err(ExportError::unsupported_shape(
                "cloudwatch",
                format!(
                    "dimension value exceeds {CLOUDWATCH_DIMENSION_VALUE_LIMIT} characters: '{dimension_value}'"
                ),
            ));
        }

        let mut dimensions = SmallVec::new();
        dimensions.push(CloudWatchDimension {
            name: dimension_name.to_string(),
            value: dimension_value.to_string(),
        });

        Ok(CloudWatchDatum {
            metric_name: metric_name.to_string(),
            dimensions,
            statistic_values: CloudWatchStatisticValues {
                sample_count: set.count as f64,
                sum: set.sum(),
                minimum: set.min,
                maximum: set.max,
            },
            unit: "Milliseconds".to_string(),
        })
    }
}

impl ExportAdapter for CloudWatchExporter {
    fn name(&self) -> &'static str {
        "cloudwatch"
    }

    fn capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            supports_histograms: false,
            supports_labels: true,
            supports_push: true,
        }
    }

    fn strategy(&self) -> SharedStrategy {
        Arc::clone(&self.strategy)
    }

    fn render(&self, result: &MetricResult) -> Result<ExportPayload, ExportError> {
        if self.namespace.is_empty() {
            return Err(ExportError::InvalidMetricName {
                backend: "cloudwatch",
                name: String::new(),
            });
        }

        let mut metric_data = Vec::new();

        if !result.latency_percentiles.is_empty() {
            metric_data.push(Self::datum(
                "PipelineLatency",
                "Scope",
                "overall",
                &result.latency_percentiles,
            )?);
        }

        for (stage, set) in result.latency_bearing_stages() {
            metric_data.push(Self::datum("StageLatency", "StageName", stage, set)?);
        }

        Ok(ExportPayload::CloudWatch(CloudWatchPayload {
            namespace: self.namespace.clone(),
            metric_data,
        }))
    }
}

// ----------------------------------------------------------------------------
// 11.4 Prometheus-Style Exporter
// ----------------------------------------------------------------------------

/// Renders exposition-format text: HELP/TYPE headers, summary quantile lines
/// for overall and per-stage latency, `_total` counters for errors and
/// invocations.
///
/// Pairs with a ring buffer by default - pull-based scraping wants cheap,
/// time-independent retention.
pub struct PrometheusExporter {
    prefix: String,
    strategy: SharedStrategy,
}

impl fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusExporter")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl PrometheusExporter {
    /// Create with an explicit strategy
    pub fn new(prefix: impl Into<String>, strategy: SharedStrategy) -> Self {
        Self {
            prefix: prefix.into(),
            strategy,
        }
    }

    /// Create with the default pairing: a ring buffer
    pub fn with_ring_buffer(prefix: impl Into<String>, capacity: usize) -> Self {
        Self::new(prefix, shared_strategy(RingBufferStrategy::new(capacity)))
    }

    /// Build from configuration
    pub fn from_config(config: &PrometheusExporterConfig) -> Self {
        Self::with_ring_buffer(&config.prefix, config.buffer_size)
    }

    /// Exposition metric names: `[a-zA-Z_:][a-zA-Z0-9_:]*`
    fn is_valid_metric_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    }

    /// Escape a label value per the exposition format rules
    fn escape_label(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\\' => escaped.push_str("\\\\"),
                '"' => escaped.push_str("\\\""),
                '\n' => escaped.push_str("\\n"),
                _ => escaped.push(c),
            }
        }
        escaped
    }

    fn write_summary(
        lines: &mut Vec<String>,
        family: &str,
        help: &str,
        stage_label: Option<&str>,
        set: &PercentileSet,
        with_headers: bool,
    ) {
        if with_headers {
            lines.push(format!("# HELP {family} {help}"));
            lines.push(format!("# TYPE {family} summary"));
        }
        if set.is_empty() {
            return;
        }

        let label_prefix = match stage_label {
            Some(stage) => format!("stage=\"{}\",", Self::escape_label(stage)),
            None => String::new(),
        };
        for (quantile, value) in [("0.5", set.p50), ("0.95", set.p95), ("0.99", set.p99)] {
            lines.push(format!(
                "{family}{{{label_prefix}quantile=\"{quantile}\"}} {value}"
            ));
        }
        let suffix_labels = match stage_label {
            Some(stage) => format!("{{stage=\"{}\"}}", Self::escape_label(stage)),
            None => String::new(),
        };
        lines.push(format!("{family}_sum{suffix_labels} {}", set.sum()));
        lines.push(format!("{family}_count{suffix_labels} {}", set.count));
    }
}

impl ExportAdapter for PrometheusExporter {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            supports_histograms: true,
            supports_labels: true,
            supports_push: false,
        }
    }

    fn strategy(&self) -> SharedStrategy {
        Arc::clone(&self.strategy)
    }

    fn render(&self, result: &MetricResult) -> Result<ExportPayload, ExportError> {
        if !Self::is_valid_metric_name(&self.prefix) {
            return Err(ExportError::InvalidMetricName {
                backend: "prometheus",
                name: self.prefix.clone(),
            });
        }

        let mut lines: Vec<String> = Vec::new();

        // Overall latency summary.
        let overall = format!("{}_latency_ms", self.prefix);
        Self::write_summary(
            &mut lines,
            &overall,
            "Pipeline latency in milliseconds",
            None,
            &result.latency_percentiles,
            true,
        );

        // Per-stage latency summaries: one family, stage as a label. Stages
        // with zero latency samples emit no quantile lines at all.
        let per_stage = format!("{}_stage_latency_ms", self.prefix);
        lines.push(format!("# HELP {per_stage} Per-stage latency in milliseconds"));
        lines.push(format!("# TYPE {per_stage} summary"));
        for (stage, set) in result.latency_bearing_stages() {
            Self::write_summary(&mut lines, &per_stage, "", Some(stage), set, false);
        }

        // Counters.
        let errors = format!("{}_errors_total", self.prefix);
        lines.push(format!("# HELP {errors} Total stage errors in the window"));
        lines.push(format!("# TYPE {errors} counter"));
        lines.push(format!("{errors} {}", result.total_errors));

        let stage_errors = format!("{}_stage_errors_total", self.prefix);
        lines.push(format!("# HELP {stage_errors} Per-stage errors in the window"));
        lines.push(format!("# TYPE {stage_errors} counter"));
        for (stage, count) in &result.stage_errors {
            lines.push(format!(
                "{stage_errors}{{stage=\"{}\"}} {count}",
                Self::escape_label(stage)
            ));
        }

        let invocations = format!("{}_invocations_total", self.prefix);
        lines.push(format!(
            "# HELP {invocations} Total stage invocations in the window"
        ));
        lines.push(format!("# TYPE {invocations} counter"));
        lines.push(format!("{invocations} {}", result.total_invocations));

        let mut text = lines.join("\n");
        text.push('\n');
        Ok(ExportPayload::Prometheus(text))
    }
}

// ----------------------------------------------------------------------------
// 11.5 Datadog-Style Exporter
// ----------------------------------------------------------------------------

/// Datadog-style series type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatadogMetricType {
    Distribution,
    Gauge,
    Count,
}

/// One point in a Datadog-style series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatadogPoint {
    /// Epoch seconds
    pub timestamp: i64,
    pub value: f64,
}

/// One Datadog-style series; stage identity rides in the tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatadogSeries {
    pub metric: String,
    #[serde(rename = "type")]
    pub series_type: DatadogMetricType,
    pub points: Vec<DatadogPoint>,
    pub tags: SmallVec<[String; 4]>,
}

/// Full Datadog-style payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatadogPayload {
    pub series: Vec<DatadogSeries>,
    /// Stand-in for the API key a real submitter would attach
    #[serde(rename = "apiKeyPlaceholder")]
    pub api_key_placeholder: String,
}

/// Renders tagged gauge/count series with stage identity as a `stage:` tag.
///
/// Pairs with a sliding window by default to mirror rolling dashboards.
pub struct DatadogExporter {
    prefix: String,
    extra_tags: Vec<String>,
    strategy: SharedStrategy,
}

impl fmt::Debug for DatadogExporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatadogExporter")
            .field("prefix", &self.prefix)
            .field("extra_tags", &self.extra_tags)
            .finish()
    }
}

impl DatadogExporter {
    /// Create with an explicit strategy
    pub fn new(prefix: impl Into<String>, strategy: SharedStrategy) -> Self {
        Self {
            prefix: prefix.into(),
            extra_tags: Vec::new(),
            strategy,
        }
    }

    /// Create with the default pairing: a sliding window on the system clock
    pub fn with_sliding(prefix: impl Into<String>, window_ms: u64) -> Self {
        Self::new(prefix, shared_strategy(SlidingWindowStrategy::new(window_ms)))
    }

    /// Build from configuration
    pub fn from_config(config: &DatadogExporterConfig) -> Self {
        let mut exporter = Self::with_sliding(&config.prefix, config.window_ms);
        exporter.extra_tags = config.tags.clone();
        exporter
    }

    /// Builder: attach tags carried by every series
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.extra_tags = tags;
        self
    }

    fn stage_tag(stage: &str) -> Result<String, ExportError> {
        let tag = format!("stage:{stage}");
        if tag.len() > DATADOG_TAG_LENGTH_LIMIT {
            return Err(ExportError::unsupported_shape(
                "datadog",
                format!("tag exceeds {DATADOG_TAG_LENGTH_LIMIT} characters: '{tag}'"),
            ));
        }
        Ok(tag)
    }

    fn series(
        &self,
        metric: String,
        series_type: DatadogMetricType,
        value: f64,
        timestamp: Timestamp,
        stage: Option<&str>,
    ) -> Result<DatadogSeries, ExportError> {
        let mut tags: SmallVec<[String; 4]> = SmallVec::new();
        if let Some(stage) = stage {
            tags.push(Self::stage_tag(stage)?);
        }
        tags.extend(self.extra_tags.iter().cloned());

        Ok(DatadogSeries {
            metric,
            series_type,
            points: vec![DatadogPoint {
                timestamp: timestamp.as_secs(),
                value,
            }],
            tags,
        })
    }
}

impl ExportAdapter for DatadogExporter {
    fn name(&self) -> &'static str {
        "datadog"
    }

    fn capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            supports_histograms: true,
            supports_labels: true,
            supports_push: true,
        }
    }

    fn strategy(&self) -> SharedStrategy {
        Arc::clone(&self.strategy)
    }

    fn render(&self, result: &MetricResult) -> Result<ExportPayload, ExportError> {
        if self.prefix.is_empty() {
            return Err(ExportError::InvalidMetricName {
                backend: "datadog",
                name: String::new(),
            });
        }

        let ts = result.computed_at;
        let mut series = Vec::new();

        let gauges = |set: &PercentileSet| {
            [
                ("latency.p50", set.p50),
                ("latency.p95", set.p95),
                ("latency.p99", set.p99),
                ("latency.avg", set.mean),
            ]
        };

        if !result.latency_percentiles.is_empty() {
            for (suffix, value) in gauges(&result.latency_percentiles) {
                series.push(self.series(
                    format!("{}.{suffix}", self.prefix),
                    DatadogMetricType::Gauge,
                    value,
                    ts,
                    None,
                )?);
            }
        }

        for (stage, set) in result.latency_bearing_stages() {
            for (suffix, value) in gauges(set) {
                series.push(self.series(
                    format!("{}.stage.{suffix}", self.prefix),
                    DatadogMetricType::Gauge,
                    value,
                    ts,
                    Some(stage),
                )?);
            }
        }

        series.push(self.series(
            format!("{}.errors", self.prefix),
            DatadogMetricType::Count,
            result.total_errors as f64,
            ts,
            None,
        )?);
        for (stage, count) in &result.stage_errors {
            series.push(self.series(
                format!("{}.stage.errors", self.prefix),
                DatadogMetricType::Count,
                *count as f64,
                ts,
                Some(stage),
            )?);
        }
        series.push(self.series(
            format!("{}.invocations", self.prefix),
            DatadogMetricType::Count,
            result.total_invocations as f64,
            ts,
            None,
        )?);

        Ok(ExportPayload::Datadog(DatadogPayload {
            series,
            api_key_placeholder: "DD_API_KEY".to_string(),
        }))
    }
}

// ============================================================================
// SECTION 12: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;

    fn manual_clock(start_ms: i64) -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource::new(Timestamp::from_millis(start_ms)))
    }

    #[test]
    fn test_collector_emits_four_entries_per_stage_end() {
        let strategy = shared_strategy(RingBufferStrategy::new(64));
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(50_000));
        collector.attach(Arc::clone(&strategy));

        collector.on_stage_end("Call LLM", 120.0, 3, 2);

        let mut guard = strategy.lock();
        assert_eq!(guard.sample_count(), 4);

        let result = guard.metric_result();
        assert_eq!(result.latency_percentiles.count, 1);
        assert_eq!(result.latency_percentiles.max, 120.0);
        assert_eq!(result.total_invocations, 1);
        assert_eq!(result.total_errors, 0);
    }

    /// Records every validated entry it sees so tests can inspect raw
    /// entries fed through the shared-strategy seam.
    struct ProbeStrategy {
        seen: Arc<Mutex<Vec<MetricEntry>>>,
    }

    impl WindowStrategy for ProbeStrategy {
        fn push(&mut self, entry: MetricEntry) -> Result<(), ValidationError> {
            entry.validate()?;
            self.seen.lock().push(entry);
            Ok(())
        }

        fn metric_result(&mut self) -> MetricResult {
            let info = self.window_info();
            PercentileComputer::compute(&self.seen.lock(), info, Timestamp::now())
        }

        fn window_info(&self) -> WindowInfo {
            WindowInfo {
                kind: WindowKind::RingBuffer,
                max_size: None,
                window_ms: None,
                retained_buckets: None,
                sample_count: self.seen.lock().len(),
            }
        }

        fn kind(&self) -> WindowKind {
            WindowKind::RingBuffer
        }

        fn sample_count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[test]
    fn test_collector_error_entry_carries_detail_and_operation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(50_000));
        collector.attach(shared_strategy(ProbeStrategy {
            seen: Arc::clone(&seen),
        }));

        collector.on_stage_error("Execute Tools", "tool handler threw");

        let entries = seen.lock();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.metric, StageMetric::ErrorCount);
        assert_eq!(entry.value, 1.0);
        assert_eq!(entry.timestamp.as_millis(), 50_000);

        let metadata = entry.metadata.as_ref().unwrap();
        assert_eq!(metadata.get("error").unwrap().as_str(), "tool handler threw");
        assert_eq!(metadata.get("operation").unwrap().as_str(), "stage_execution");
    }

    #[test]
    fn test_collector_fans_out_to_all_attached_strategies() {
        let a = shared_strategy(RingBufferStrategy::new(16));
        let b = shared_strategy(SlidingWindowStrategy::with_time_source(
            60_000,
            manual_clock(10_000),
        ));
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(10_000));
        collector.attach(Arc::clone(&a)).attach(Arc::clone(&b));
        assert_eq!(collector.strategy_count(), 2);

        collector.on_stage_end("Assemble Prompt", 4.0, 2, 1);

        assert_eq!(a.lock().sample_count(), 4);
        assert_eq!(b.lock().sample_count(), 4);
    }

    #[test]
    fn test_collector_counts_rejected_entries_once() {
        let strategy = shared_strategy(RingBufferStrategy::new(16));
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(1_000));
        collector.attach(Arc::clone(&strategy));

        collector.on_stage_end("Call LLM", f64::NAN, 0, 0);

        // The latency entry is rejected; the other three are fine.
        assert_eq!(collector.entries_rejected(), 1);
        assert_eq!(collector.entries_emitted(), 3);
        assert_eq!(strategy.lock().sample_count(), 3);
    }

    #[test]
    fn test_in_memory_exporter_is_passthrough() {
        let exporter = InMemoryExporter::with_ring_buffer(32);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_end("Call LLM", 120.0, 1, 1);

        let payload = exporter.export().unwrap();
        let result = payload.as_metric_result().unwrap();
        assert_eq!(result.latency_percentiles.count, 1);
        assert_eq!(result.window_info.kind, WindowKind::RingBuffer);
    }

    #[test]
    fn test_cloudwatch_field_names_are_bit_exact() {
        let exporter = CloudWatchExporter::with_tumbling("Synapse/Test", 60_000, 1);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_end("Call LLM", 120.0, 1, 1);
        collector.on_stage_end("Call LLM", 480.0, 1, 1);

        let payload = exporter.export().unwrap();
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["Namespace"], "Synapse/Test");
        let data = json["MetricData"].as_array().unwrap();
        assert_eq!(data.len(), 2); // overall + one latency-bearing stage

        let overall = &data[0];
        assert_eq!(overall["MetricName"], "PipelineLatency");
        assert_eq!(overall["Dimensions"][0]["Name"], "Scope");
        assert_eq!(overall["Dimensions"][0]["Value"], "overall");
        assert_eq!(overall["StatisticValues"]["SampleCount"], 2.0);
        assert_eq!(overall["StatisticValues"]["Sum"], 600.0);
        assert_eq!(overall["StatisticValues"]["Minimum"], 120.0);
        assert_eq!(overall["StatisticValues"]["Maximum"], 480.0);
        assert_eq!(overall["Unit"], "Milliseconds");

        let stage = &data[1];
        assert_eq!(stage["MetricName"], "StageLatency");
        assert_eq!(stage["Dimensions"][0]["Name"], "StageName");
        assert_eq!(stage["Dimensions"][0]["Value"], "Call LLM");
    }

    #[test]
    fn test_cloudwatch_emits_only_latency_bearing_stages() {
        let exporter = CloudWatchExporter::with_tumbling("Synapse/Test", 60_000, 1);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        // Errors only; no latency samples anywhere.
        collector.on_stage_error("Execute Tools", "boom");

        let payload = exporter.export().unwrap();
        match payload {
            ExportPayload::CloudWatch(cw) => assert!(cw.metric_data.is_empty()),
            other => panic!("expected CloudWatch payload, got {other:?}"),
        }
    }

    #[test]
    fn test_cloudwatch_rejects_oversized_dimension_value() {
        let exporter = CloudWatchExporter::with_tumbling("Synapse/Test", 60_000, 1);
        let long_stage = "s".repeat(CLOUDWATCH_DIMENSION_VALUE_LIMIT + 1);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_end(&long_stage, 10.0, 0, 0);

        let err = exporter.export().unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedShape { .. }));
        assert_eq!(err.backend(), "cloudwatch");
    }

    #[test]
    fn test_prometheus_exposition_scenario() {
        let exporter = PrometheusExporter::with_ring_buffer("synapse", 128);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_error("Execute Tools", "boom");

        let payload = exporter.export().unwrap();
        let text = payload.as_exposition_text().unwrap();

        assert!(text.contains("synapse_errors_total 1"));
        assert!(text.contains("synapse_stage_errors_total{stage=\"Execute Tools\"} 1"));
        assert!(text.contains("# TYPE synapse_errors_total counter"));
        // No latency samples anywhere: no quantile line may appear.
        assert!(!text.contains("quantile="));
    }

    #[test]
    fn test_prometheus_quantile_lines_and_headers() {
        let exporter = PrometheusExporter::with_ring_buffer("synapse", 128);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(5_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_end("Call LLM", 120.0, 1, 1);
        collector.on_stage_end("Call LLM", 480.0, 1, 1);

        let payload = exporter.export().unwrap();
        let text = payload.as_exposition_text().unwrap();

        assert!(text.contains("# HELP synapse_latency_ms Pipeline latency in milliseconds"));
        assert!(text.contains("# TYPE synapse_latency_ms summary"));
        assert!(text.contains("synapse_latency_ms{quantile=\"0.5\"} 120"));
        assert!(text.contains("synapse_latency_ms{quantile=\"0.99\"} 480"));
        assert!(text.contains("synapse_stage_latency_ms{stage=\"Call LLM\",quantile=\"0.5\"} 120"));
        assert!(text.contains("synapse_latency_ms_count 2"));
        assert!(text.contains("synapse_invocations_total 2"));
    }

    #[test]
    fn test_prometheus_label_escaping() {
        assert_eq!(
            PrometheusExporter::escape_label("say \"hi\"\\now"),
            "say \\\"hi\\\"\\\\now"
        );
        assert_eq!(
            PrometheusExporter::escape_label("line\nbreak"),
            "line\\nbreak"
        );
        assert_eq!(PrometheusExporter::escape_label("plain"), "plain");
    }

    #[test]
    fn test_prometheus_invalid_prefix_is_export_error() {
        let exporter = PrometheusExporter::with_ring_buffer("9bad-prefix", 16);
        let err = exporter.export().unwrap_err();
        assert!(matches!(err, ExportError::InvalidMetricName { .. }));
        assert_eq!(err.backend(), "prometheus");
    }

    #[test]
    fn test_datadog_payload_shape() {
        let clock = manual_clock(120_000);
        let exporter = DatadogExporter::new(
            "synapse.pipeline",
            shared_strategy(SlidingWindowStrategy::with_time_source(
                60_000,
                clock.clone(),
            )),
        )
        .with_tags(vec!["env:test".to_string()]);

        let mut collector = MetricCollector::with_time_source("run-1", clock);
        collector.attach_adapter(&exporter);
        collector.on_stage_end("Call LLM", 120.0, 1, 1);
        collector.on_stage_error("Execute Tools", "boom");

        let payload = exporter.export().unwrap();
        let json = serde_json::to_value(&payload).unwrap();

        assert!(json["apiKeyPlaceholder"].is_string());
        let series = json["series"].as_array().unwrap();
        assert!(!series.is_empty());

        // Stage identity is a tag, not a dimension.
        let stage_series = series
            .iter()
            .find(|s| s["metric"] == "synapse.pipeline.stage.latency.p50")
            .unwrap();
        assert_eq!(stage_series["type"], "gauge");
        assert_eq!(stage_series["tags"][0], "stage:Call LLM");
        assert_eq!(stage_series["tags"][1], "env:test");
        assert_eq!(stage_series["points"][0]["value"], 120.0);

        let errors = series
            .iter()
            .find(|s| s["metric"] == "synapse.pipeline.stage.errors")
            .unwrap();
        assert_eq!(errors["type"], "count");
        assert_eq!(errors["tags"][0], "stage:Execute Tools");
        assert_eq!(errors["points"][0]["value"], 1.0);
    }

    #[test]
    fn test_adapter_failure_is_isolated() {
        // Two adapters fed from the same stream; the broken one fails, the
        // healthy one is unaffected, and the shared entries are intact.
        let broken = PrometheusExporter::with_ring_buffer("", 32);
        let healthy = InMemoryExporter::with_ring_buffer(32);

        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(9_000));
        collector.attach_adapter(&broken);
        collector.attach_adapter(&healthy);
        collector.on_stage_end("Call LLM", 42.0, 1, 1);

        assert!(broken.export().is_err());

        let payload = healthy.export().unwrap();
        let result = payload.as_metric_result().unwrap();
        assert_eq!(result.latency_percentiles.count, 1);

        // The broken adapter's strategy still holds its entries.
        assert_eq!(broken.strategy().lock().sample_count(), 4);
    }

    #[test]
    fn test_render_does_not_mutate_strategy() {
        let exporter = PrometheusExporter::with_ring_buffer("synapse", 32);
        let mut collector = MetricCollector::with_time_source("run-1", manual_clock(9_000));
        collector.attach_adapter(&exporter);
        collector.on_stage_end("Call LLM", 42.0, 1, 1);

        let before = exporter.strategy().lock().sample_count();
        let result = exporter.strategy().lock().metric_result();
        let _ = exporter.render(&result).unwrap();
        let _ = exporter.render(&result).unwrap();
        let after = exporter.strategy().lock().sample_count();
        assert_eq!(before, after);
    }

    #[test]
    fn test_capability_sets() {
        assert!(!CloudWatchExporter::with_tumbling("ns", 1_000, 1)
            .capabilities()
            .supports_histograms);
        assert!(PrometheusExporter::with_ring_buffer("p", 8)
            .capabilities()
            .supports_histograms);
        assert!(!PrometheusExporter::with_ring_buffer("p", 8)
            .capabilities()
            .supports_push);
        assert!(DatadogExporter::with_sliding("d", 1_000)
            .capabilities()
            .supports_push);
    }
}

// ============================================================================
// SECTION 13: EXECUTION TREE & NAVIGATOR
// ============================================================================
// Append-only record of per-stage execution nodes for one pipeline run, and
// the two-tier query layer over it. The tree records; it never aggregates.
// The navigator's summary/drill-down split is a deliberate payload-size
// control for automated consumers: a cheap index first, full narrative
// detail only for the nodes the consumer chooses to inspect.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Execution Tree Nodes
// ----------------------------------------------------------------------------

/// Kind of execution node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionNodeKind {
    /// A single pipeline stage
    Stage,
    /// A nested flow (e.g., a provider adapter's internal stages)
    Subflow,
}

/// One recorded execution node. Created once via `add_stage`, never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTreeNode {
    /// Unique id within the tree
    pub id: CompactString,
    /// Display name (e.g., "Call LLM")
    pub name: String,
    /// What the builder wired this stage to do
    pub builder_description: String,
    /// Human-readable timeline of what the stage did
    pub narrative_sentences: Vec<String>,
    /// Stage or subflow
    pub node_type: ExecutionNodeKind,
    /// Stage wall time in milliseconds
    pub duration_ms: f64,
    /// Whether the stage raised an error
    pub has_error: bool,
    /// Error detail, when `has_error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Enclosing subflow node, when nested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CompactString>,
}

impl ExecutionTreeNode {
    /// Create a stage node
    pub fn stage(id: impl Into<CompactString>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            builder_description: String::new(),
            narrative_sentences: Vec::new(),
            node_type: ExecutionNodeKind::Stage,
            duration_ms: 0.0,
            has_error: false,
            error_message: None,
            parent_id: None,
        }
    }

    /// Create a subflow node
    pub fn subflow(id: impl Into<CompactString>, name: impl Into<String>) -> Self {
        Self {
            node_type: ExecutionNodeKind::Subflow,
            ..Self::stage(id, name)
        }
    }

    /// Builder: what the builder wired this stage to do
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.builder_description = description.into();
        self
    }

    /// Builder: append a narrative sentence
    pub fn with_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.narrative_sentences.push(sentence.into());
        self
    }

    /// Builder: stage wall time
    #[inline]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Builder: mark the stage failed with the given detail
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.has_error = true;
        self.error_message = Some(message.into());
        self
    }

    /// Builder: nest under a subflow node
    pub fn with_parent(mut self, parent_id: impl Into<CompactString>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

// ----------------------------------------------------------------------------
// 13.2 Execution Tree
// ----------------------------------------------------------------------------

/// Append-only record of one pipeline run.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    run_id: Uuid,
    agent_name: CompactString,
    nodes: Vec<ExecutionTreeNode>,
    index: AHashMap<CompactString, usize>,
    started_at: Timestamp,
}

impl ExecutionTree {
    /// Create an empty tree for one run
    pub fn new(agent_name: impl Into<CompactString>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            nodes: Vec::new(),
            index: AHashMap::new(),
            started_at: Timestamp::now(),
        }
    }

    /// Run identity
    #[inline]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Agent this run belongs to
    #[inline]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// When the run started
    #[inline]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Append one node.
    ///
    /// Duplicate ids are programming errors and rejected loudly; a nested
    /// node's parent must already exist and be subflow-typed.
    pub fn add_stage(&mut self, node: ExecutionTreeNode) -> Result<(), TreeError> {
        if self.index.contains_key(&node.id) {
            return Err(TreeError::DuplicateStageId {
                id: node.id.to_string(),
            });
        }

        if let Some(parent_id) = &node.parent_id {
            match self.index.get(parent_id) {
                None => {
                    return Err(TreeError::ParentNotFound {
                        id: node.id.to_string(),
                        parent_id: parent_id.to_string(),
                    });
                }
                Some(&parent_idx) => {
                    if self.nodes[parent_idx].node_type != ExecutionNodeKind::Subflow {
                        return Err(TreeError::ParentNotSubflow {
                            id: node.id.to_string(),
                            parent_id: parent_id.to_string(),
                        });
                    }
                }
            }
        }

        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Number of recorded nodes
    #[inline]
    pub fn stage_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up one node by id
    pub fn node(&self, id: &str) -> Option<&ExecutionTreeNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    /// Children of a subflow node, in insertion order
    pub fn children(&self, id: &str) -> Vec<&ExecutionTreeNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// All nodes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionTreeNode> {
        self.nodes.iter()
    }
}

// ----------------------------------------------------------------------------
// 13.3 Tree Navigator
// ----------------------------------------------------------------------------

/// One row of the cheap summary view.
///
/// Intentionally excludes `narrative_sentences` and `duration_ms`: the
/// summary exists to keep the first payload a consumer sees small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummaryEntry {
    pub id: CompactString,
    pub name: String,
    pub builder_description: String,
    pub has_error: bool,
}

/// Read-only query layer over an execution tree. Borrows the tree; holds no
/// state of its own.
#[derive(Debug, Clone, Copy)]
pub struct TreeNavigator<'a> {
    tree: &'a ExecutionTree,
}

impl<'a> TreeNavigator<'a> {
    /// Create a navigator over a tree
    pub fn new(tree: &'a ExecutionTree) -> Self {
        Self { tree }
    }

    /// The cheap view: one small record per node, in insertion order.
    /// This is what a consumer calls first.
    pub fn summary(&self) -> Vec<StageSummaryEntry> {
        self.tree
            .iter()
            .map(|node| StageSummaryEntry {
                id: node.id.clone(),
                name: node.name.clone(),
                builder_description: node.builder_description.clone(),
                has_error: node.has_error,
            })
            .collect()
    }

    /// The expensive view: full detail for one chosen node, narrative and
    /// error message included.
    pub fn drill_down(&self, id: &str) -> Result<&'a ExecutionTreeNode, TreeError> {
        self.tree.node(id).ok_or_else(|| TreeError::not_found(id))
    }
}

// ============================================================================
// SECTION 14: THRESHOLD ALARMS
// ============================================================================
// Threshold-based alarm rules evaluated synchronously against live stage
// events: error totals, per-stage durations, consecutive failures. A rule
// fires once when breached and auto-resolves when its metric returns to
// normal. The evaluator is a pipeline observer like the collector; the
// handle is cloneable so callers can keep one for querying state after the
// run.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Alarm Rules
// ----------------------------------------------------------------------------

/// Which live metric a rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMetricKind {
    /// Total error count for the run (or for one stage when scoped)
    #[serde(rename = "errorCount")]
    ErrorCount,
    /// Duration of the most recent completion of a stage
    #[serde(rename = "stageDuration")]
    StageDuration,
    /// Errors since the last successful stage completion
    #[serde(rename = "consecutiveErrors")]
    ConsecutiveErrors,
}

/// Comparison applied between the observed value and the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmComparison {
    Gt,
    Gte,
}

impl AlarmComparison {
    /// Apply the comparison
    #[inline]
    pub fn breached(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlarmComparison::Gt => value > threshold,
            AlarmComparison::Gte => value >= threshold,
        }
    }
}

/// One threshold rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    /// Rule name, unique within the evaluator
    pub name: String,
    /// Watched metric
    pub metric: AlarmMetricKind,
    /// Threshold the value is compared against
    pub threshold: f64,
    /// Comparison direction
    pub comparison: AlarmComparison,
    /// Restrict the rule to one stage (duration and error rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
}

impl AlarmRule {
    /// Create an unscoped rule
    pub fn new(
        name: impl Into<String>,
        metric: AlarmMetricKind,
        threshold: f64,
        comparison: AlarmComparison,
    ) -> Self {
        Self {
            name: name.into(),
            metric,
            threshold,
            comparison,
            stage_name: None,
        }
    }

    /// Builder: scope the rule to one stage
    pub fn for_stage(mut self, stage_name: impl Into<String>) -> Self {
        self.stage_name = Some(stage_name.into());
        self
    }

    /// Does this rule watch the given stage?
    fn watches_stage(&self, stage_name: &str) -> bool {
        match &self.stage_name {
            Some(scoped) => scoped == stage_name,
            None => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 14.2 Alarm Events & State
// ----------------------------------------------------------------------------

/// Fire or resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmTransition {
    Fired,
    Resolved,
}

/// One transition in the alarm history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub rule_name: String,
    pub transition: AlarmTransition,
    /// Metric value observed at the transition
    pub metric_value: f64,
    /// Stage involved, when the trigger was stage-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    pub timestamp: Timestamp,
}

/// Snapshot of the evaluator's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSummary {
    /// Rules currently in the fired state
    pub active_alarms: Vec<String>,
    /// Fire transitions recorded so far
    pub fired_total: u64,
    /// Resolve transitions recorded so far
    pub resolved_total: u64,
}

#[derive(Debug, Default)]
struct AlarmCore {
    rules: Vec<AlarmRule>,
    /// Rule name -> currently fired
    active: AHashMap<String, bool>,
    history: Vec<AlarmEvent>,
    fired_total: u64,
    resolved_total: u64,
    error_count_total: u64,
    stage_error_counts: AHashMap<String, u64>,
    consecutive_errors: u64,
}

impl AlarmCore {
    fn record(&mut self, event: AlarmEvent) {
        match event.transition {
            AlarmTransition::Fired => {
                self.fired_total += 1;
                info!(
                    target: "synapse::alarms",
                    rule = %event.rule_name,
                    value = event.metric_value,
                    stage = event.stage_name.as_deref().unwrap_or("-"),
                    "Alarm fired"
                );
            }
            AlarmTransition::Resolved => {
                self.resolved_total += 1;
                info!(
                    target: "synapse::alarms",
                    rule = %event.rule_name,
                    value = event.metric_value,
                    "Alarm resolved"
                );
            }
        }
        if self.history.len() == ALARM_HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(event);
    }

    /// Transition one rule based on a freshly observed value
    fn evaluate_rule(&mut self, rule_idx: usize, value: f64, stage: Option<&str>, now: Timestamp) {
        let rule = self.rules[rule_idx].clone();
        let breached = rule.comparison.breached(value, rule.threshold);
        let currently_active = *self.active.get(&rule.name).unwrap_or(&false);

        if breached && !currently_active {
            self.active.insert(rule.name.clone(), true);
            self.record(AlarmEvent {
                rule_name: rule.name,
                transition: AlarmTransition::Fired,
                metric_value: value,
                stage_name: stage.map(str::to_string),
                timestamp: now,
            });
        } else if !breached && currently_active {
            self.active.insert(rule.name.clone(), false);
            self.record(AlarmEvent {
                rule_name: rule.name,
                transition: AlarmTransition::Resolved,
                metric_value: value,
                stage_name: stage.map(str::to_string),
                timestamp: now,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// 14.3 Alarm Evaluator
// ----------------------------------------------------------------------------

/// Threshold alarm evaluation over live stage events.
///
/// Cloneable handle around shared state: register one clone on the event bus
/// and keep another for querying `summary()`/`history()` after the run.
#[derive(Clone)]
pub struct AlarmEvaluator {
    inner: Arc<Mutex<AlarmCore>>,
    time_source: SharedTimeSource,
}

impl fmt::Debug for AlarmEvaluator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let core = self.inner.lock();
        f.debug_struct("AlarmEvaluator")
            .field("rules", &core.rules.len())
            .field("fired_total", &core.fired_total)
            .field("resolved_total", &core.resolved_total)
            .finish()
    }
}

impl AlarmEvaluator {
    /// Create an evaluator with the given rules on the system clock
    pub fn new(rules: Vec<AlarmRule>) -> Self {
        Self::with_time_source(rules, system_time_source())
    }

    /// Create an evaluator on an injected clock (tests, replays)
    pub fn with_time_source(rules: Vec<AlarmRule>, time_source: SharedTimeSource) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AlarmCore {
                rules,
                ..AlarmCore::default()
            })),
            time_source,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &AlarmsConfig) -> Self {
        Self::new(config.rules.clone())
    }

    /// Snapshot of the current alarm state
    pub fn summary(&self) -> AlarmSummary {
        let core = self.inner.lock();
        let mut active_alarms: Vec<String> = core
            .active
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.clone())
            .collect();
        active_alarms.sort();
        AlarmSummary {
            active_alarms,
            fired_total: core.fired_total,
            resolved_total: core.resolved_total,
        }
    }

    /// Fire/resolve transitions recorded so far, oldest first
    pub fn history(&self) -> Vec<AlarmEvent> {
        self.inner.lock().history.clone()
    }
}

impl PipelineObserver for AlarmEvaluator {
    fn name(&self) -> &str {
        "alarm-evaluator"
    }

    fn on_stage_end(&mut self, stage_name: &str, duration_ms: f64, _read_count: u64, _write_count: u64) {
        let now = self.time_source.now();
        let mut core = self.inner.lock();

        // A successful completion ends any error streak.
        core.consecutive_errors = 0;

        for idx in 0..core.rules.len() {
            let rule = core.rules[idx].clone();
            match rule.metric {
                AlarmMetricKind::StageDuration if rule.watches_stage(stage_name) => {
                    core.evaluate_rule(idx, duration_ms, Some(stage_name), now);
                }
                AlarmMetricKind::ConsecutiveErrors => {
                    core.evaluate_rule(idx, 0.0, None, now);
                }
                _ => {}
            }
        }
    }

    fn on_stage_error(&mut self, stage_name: &str, _detail: &str) {
        let now = self.time_source.now();
        let mut core = self.inner.lock();

        core.error_count_total += 1;
        core.consecutive_errors += 1;
        *core
            .stage_error_counts
            .entry(stage_name.to_string())
            .or_default() += 1;

        for idx in 0..core.rules.len() {
            let rule = core.rules[idx].clone();
            match rule.metric {
                AlarmMetricKind::ErrorCount if rule.watches_stage(stage_name) => {
                    let value = match &rule.stage_name {
                        Some(scoped) => *core.stage_error_counts.get(scoped).unwrap_or(&0) as f64,
                        None => core.error_count_total as f64,
                    };
                    core.evaluate_rule(idx, value, Some(stage_name), now);
                }
                AlarmMetricKind::ConsecutiveErrors => {
                    let value = core.consecutive_errors as f64;
                    core.evaluate_rule(idx, value, Some(stage_name), now);
                }
                _ => {}
            }
        }
    }
}

// ============================================================================
// SECTION 15: PHASE 3 TESTS
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::*;

    fn sample_tree() -> ExecutionTree {
        let mut tree = ExecutionTree::new("react-agent");
        tree.add_stage(
            ExecutionTreeNode::stage("initialize", "Initialize")
                .with_description("Sets up the adapter, tool registry, and observer chain")
                .with_sentence("Registered tool get_weather")
                .with_duration_ms(2.0),
        )
        .unwrap();
        tree.add_stage(
            ExecutionTreeNode::subflow("call-llm", "Call LLM")
                .with_description("Runs the 3-stage adapter subflow")
                .with_sentence("Dispatched request to the provider adapter")
                .with_duration_ms(480.0),
        )
        .unwrap();
        tree.add_stage(
            ExecutionTreeNode::stage("format-request", "FormatRequest")
                .with_description("Converts messages and tools into the provider request shape")
                .with_duration_ms(1.0)
                .with_parent("call-llm"),
        )
        .unwrap();
        tree.add_stage(
            ExecutionTreeNode::stage("execute-tools", "Execute Tools")
                .with_description("Calls registered tool handlers")
                .with_sentence("Tool get_weather invoked with city=Seattle")
                .with_duration_ms(45.0)
                .with_error("tool handler threw: connection refused"),
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_tree_append_and_count() {
        let tree = sample_tree();
        assert_eq!(tree.stage_count(), 4);
        assert_eq!(tree.node("call-llm").unwrap().name, "Call LLM");
        assert!(tree.node("unknown").is_none());
    }

    #[test]
    fn test_tree_rejects_duplicate_ids() {
        let mut tree = sample_tree();
        let err = tree
            .add_stage(ExecutionTreeNode::stage("initialize", "Initialize Again"))
            .unwrap_err();
        assert_eq!(
            err,
            TreeError::DuplicateStageId {
                id: "initialize".into()
            }
        );
        // The failed insert changed nothing.
        assert_eq!(tree.stage_count(), 4);
    }

    #[test]
    fn test_tree_parent_validation() {
        let mut tree = ExecutionTree::new("agent");
        let orphan = ExecutionTreeNode::stage("child", "Child").with_parent("ghost");
        assert!(matches!(
            tree.add_stage(orphan),
            Err(TreeError::ParentNotFound { .. })
        ));

        tree.add_stage(ExecutionTreeNode::stage("plain", "Plain Stage"))
            .unwrap();
        let nested_under_stage =
            ExecutionTreeNode::stage("child", "Child").with_parent("plain");
        assert!(matches!(
            tree.add_stage(nested_under_stage),
            Err(TreeError::ParentNotSubflow { .. })
        ));
    }

    #[test]
    fn test_tree_children_in_insertion_order() {
        let mut tree = sample_tree();
        tree.add_stage(
            ExecutionTreeNode::stage("map-response", "MapResponse").with_parent("call-llm"),
        )
        .unwrap();

        let children: Vec<&str> = tree
            .children("call-llm")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(children, vec!["format-request", "map-response"]);
    }

    #[test]
    fn test_navigator_summary_is_cheap_view() {
        let tree = sample_tree();
        let navigator = TreeNavigator::new(&tree);
        let summary = navigator.summary();

        assert_eq!(summary.len(), 4);
        assert_eq!(summary[0].id, "initialize");
        assert!(summary[3].has_error);

        // The summary payload never carries narrative or duration detail.
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("narrativeSentences"));
        assert!(!json.contains("durationMs"));
        assert!(!json.contains("errorMessage"));
    }

    #[test]
    fn test_navigator_drill_down_full_detail() {
        let tree = sample_tree();
        let navigator = TreeNavigator::new(&tree);

        let node = navigator.drill_down("execute-tools").unwrap();
        assert_eq!(node.name, "Execute Tools");
        assert!(node.has_error);
        assert_eq!(
            node.error_message.as_deref(),
            Some("tool handler threw: connection refused")
        );
        assert_eq!(node.narrative_sentences.len(), 1);
        assert_eq!(node.duration_ms, 45.0);

        let json = serde_json::to_string(node).unwrap();
        assert!(json.contains("narrativeSentences"));
        assert!(json.contains("durationMs"));
    }

    #[test]
    fn test_navigator_drill_down_not_found() {
        let tree = sample_tree();
        let navigator = TreeNavigator::new(&tree);
        let err = navigator.drill_down("no-such-stage").unwrap_err();
        assert_eq!(
            err,
            TreeError::StageNotFound {
                id: "no-such-stage".into()
            }
        );
        // The failed lookup left the tree untouched.
        assert_eq!(tree.stage_count(), 4);
    }

    #[test]
    fn test_alarm_fires_on_error_count_threshold() {
        let mut evaluator = AlarmEvaluator::new(vec![AlarmRule::new(
            "high-error-rate",
            AlarmMetricKind::ErrorCount,
            3.0,
            AlarmComparison::Gte,
        )]);

        evaluator.on_stage_error("Execute Tools", "boom 1");
        evaluator.on_stage_error("Execute Tools", "boom 2");
        assert!(evaluator.summary().active_alarms.is_empty());

        evaluator.on_stage_error("Execute Tools", "boom 3");
        let summary = evaluator.summary();
        assert_eq!(summary.active_alarms, vec!["high-error-rate"]);
        assert_eq!(summary.fired_total, 1);
    }

    #[test]
    fn test_alarm_consecutive_errors_fire_and_resolve() {
        let mut evaluator = AlarmEvaluator::new(vec![AlarmRule::new(
            "cascade-failure",
            AlarmMetricKind::ConsecutiveErrors,
            2.0,
            AlarmComparison::Gte,
        )]);

        evaluator.on_stage_error("Call LLM", "timeout");
        evaluator.on_stage_error("Call LLM", "timeout");
        assert_eq!(evaluator.summary().active_alarms, vec!["cascade-failure"]);

        // A successful completion ends the streak and resolves the alarm.
        evaluator.on_stage_end("Call LLM", 100.0, 1, 1);
        let summary = evaluator.summary();
        assert!(summary.active_alarms.is_empty());
        assert_eq!(summary.resolved_total, 1);

        let history = evaluator.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].transition, AlarmTransition::Fired);
        assert_eq!(history[1].transition, AlarmTransition::Resolved);
    }

    #[test]
    fn test_alarm_stage_duration_rule_is_stage_scoped() {
        let mut evaluator = AlarmEvaluator::new(vec![AlarmRule::new(
            "slow-stage",
            AlarmMetricKind::StageDuration,
            2000.0,
            AlarmComparison::Gt,
        )
        .for_stage("Call LLM")]);

        // Another slow stage does not trip a scoped rule.
        evaluator.on_stage_end("Execute Tools", 5000.0, 1, 1);
        assert!(evaluator.summary().active_alarms.is_empty());

        evaluator.on_stage_end("Call LLM", 2500.0, 1, 1);
        assert_eq!(evaluator.summary().active_alarms, vec!["slow-stage"]);

        // A fast completion of the watched stage resolves it.
        evaluator.on_stage_end("Call LLM", 300.0, 1, 1);
        assert!(evaluator.summary().active_alarms.is_empty());
    }

    #[test]
    fn test_alarm_stage_scoped_error_count() {
        let mut evaluator = AlarmEvaluator::new(vec![AlarmRule::new(
            "tool-errors",
            AlarmMetricKind::ErrorCount,
            2.0,
            AlarmComparison::Gte,
        )
        .for_stage("Execute Tools")]);

        // Errors on other stages don't count toward a scoped rule.
        evaluator.on_stage_error("Call LLM", "timeout");
        evaluator.on_stage_error("Call LLM", "timeout");
        assert!(evaluator.summary().active_alarms.is_empty());

        evaluator.on_stage_error("Execute Tools", "boom");
        evaluator.on_stage_error("Execute Tools", "boom");
        assert_eq!(evaluator.summary().active_alarms, vec!["tool-errors"]);
    }

    #[test]
    fn test_alarm_evaluator_on_event_bus_with_collector() {
        let exporter = InMemoryExporter::with_ring_buffer(64);
        let mut collector = MetricCollector::new("run-1");
        collector.attach_adapter(&exporter);

        let evaluator = AlarmEvaluator::new(vec![AlarmRule::new(
            "any-error",
            AlarmMetricKind::ErrorCount,
            1.0,
            AlarmComparison::Gte,
        )]);

        let mut bus = StageEventBus::new();
        bus.register(collector);
        bus.register(evaluator.clone());
        assert_eq!(bus.observer_count(), 2);

        bus.notify_stage_end("Call LLM", 120.0, 2, 1);
        bus.notify_stage_error("Execute Tools", "boom");

        // Both observers saw both events.
        let result = exporter.export().unwrap();
        let result = result.as_metric_result().unwrap();
        assert_eq!(result.total_errors, 1);
        assert_eq!(result.total_invocations, 1);
        assert_eq!(evaluator.summary().active_alarms, vec!["any-error"]);
    }

    #[test]
    fn test_config_defaults_round_trip() {
        let rendered = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.engine.instance_name, ENGINE_NAME);
        assert_eq!(parsed.window.kind, WindowKind::RingBuffer);
        assert_eq!(parsed.window.retained_buckets, DEFAULT_RETAINED_BUCKETS);
        assert_eq!(parsed.exporters.prometheus.prefix, DEFAULT_PROMETHEUS_PREFIX);
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let toml_str = r#"
            [window]
            kind = "tumbling"
            window_ms = 0
        "#;
        assert!(matches!(
            EngineConfig::from_toml_str(toml_str),
            Err(ConfigError::InvalidValue { .. })
        ));

        let toml_str = r#"
            [[alarms.rules]]
            name = ""
            metric = "errorCount"
            threshold = 3.0
            comparison = "gte"
        "#;
        assert!(EngineConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn test_config_alarm_rules_parse() {
        let toml_str = r#"
            [[alarms.rules]]
            name = "slow-llm"
            metric = "stageDuration"
            threshold = 2000.0
            comparison = "gt"
            stage_name = "Call LLM"
        "#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.alarms.rules.len(), 1);
        let rule = &config.alarms.rules[0];
        assert_eq!(rule.metric, AlarmMetricKind::StageDuration);
        assert_eq!(rule.comparison, AlarmComparison::Gt);
        assert_eq!(rule.stage_name.as_deref(), Some("Call LLM"));
    }

    #[test]
    fn test_error_categories() {
        let validation: SynapseError = ValidationError::MissingStageName.into();
        assert_eq!(validation.category(), "validation");
        assert!(validation.is_recoverable());

        let tree: SynapseError = TreeError::not_found("x").into();
        assert_eq!(tree.category(), "tree");
        assert!(tree.is_recoverable());

        let duplicate: SynapseError = TreeError::DuplicateStageId { id: "x".into() }.into();
        assert!(!duplicate.is_recoverable());

        let export: SynapseError = ExportError::InvalidMetricName {
            backend: "prometheus",
            name: "9bad".into(),
        }
        .into();
        assert_eq!(export.category(), "export");
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line interface for the engine: demo replay, configuration
// validation and generation, version information.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Synapse Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "synapse",
    author = "AIOps Team",
    version,
    about = "Metric aggregation and execution-tree navigation for agent pipelines",
    long_about = "Synapse Engine ingests per-stage execution events from an agent \
                  pipeline, maintains bounded-memory statistical windows over them, \
                  exports latency/error aggregates to multiple observability \
                  backends, and exposes a navigable summary/drill-down view of \
                  each execution."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "synapse.toml", env = "SYNAPSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SYNAPSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "SYNAPSE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay the scripted demo pipeline and print every export
    Demo {
        /// Loop turns to replay
        #[arg(short, long, default_value_t = 5)]
        iterations: usize,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
pub fn handle_validate(config_path: &Path, verbose: bool) -> SynapseResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{s}"),
                    Err(e) => println!("Failed to serialize: {e}"),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Environment: {}", config.engine.environment);
            println!("  • Window: {} ({} entries / {}ms)",
                config.window.kind, config.window.max_size, config.window.window_ms);
            println!("  • Alarm rules: {}", config.alarms.rules.len());
            println!("  • Exporters enabled:");
            if config.exporters.in_memory.enabled { println!("    - In-memory"); }
            if config.exporters.cloudwatch.enabled { println!("    - CloudWatch-style"); }
            if config.exporters.prometheus.enabled { println!("    - Prometheus-style"); }
            if config.exporters.datadog.enabled { println!("    - Datadog-style"); }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {e}");
            Err(SynapseError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
pub fn handle_generate_config(output: Option<&Path>) -> SynapseResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{config_str}");
        }
    }

    Ok(())
}

/// Handle the version subcommand
pub fn handle_version() {
    println!("⚡ {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Bounded-memory retention windows (ring buffer, tumbling, sliding)");
    println!("  • Nearest-rank percentile aggregation (p50/p95/p99)");
    println!("  • Multi-backend export (CloudWatch, Prometheus, Datadog, in-memory)");
    println!("  • Two-tier execution-tree navigation (summary + drill-down)");
    println!("  • Threshold alarms with auto-resolve");
    println!();
    println!("License: MIT");
}

// ============================================================================
// SECTION 17: DEMO PIPELINE REPLAY
// ============================================================================
// A scripted ReAct-style agent run wired through the whole engine: the event
// bus fans stage events out to the metric collector and the alarm evaluator,
// the execution tree records every stage instance, and each configured
// exporter renders the windowed aggregates at the end.
// ============================================================================

/// Stage script for one ReAct loop turn: name, base duration, reads, writes.
const REACT_STAGES: &[(&str, f64, u64, u64)] = &[
    ("Assemble Prompt", 4.0, 3, 1),
    ("Call LLM", 480.0, 2, 2),
    ("Parse Response", 2.0, 1, 1),
    ("Route Decider", 1.0, 1, 0),
];

/// The adapter subflow recorded under each "Call LLM" node
const ADAPTER_SUBFLOW: &[(&str, &str)] = &[
    ("FormatRequest", "Converts generic messages and tools into the provider request format"),
    ("ExecuteCall", "Makes the call to the LLM provider"),
    ("MapResponse", "Parses the provider response into a result variant (final, tools, error)"),
];

/// Everything a demo run produces, for printing or assertions.
pub struct DemoRun {
    pub tree: ExecutionTree,
    pub alarms: AlarmEvaluator,
    pub exporters: Vec<Box<dyn ExportAdapter>>,
}

impl fmt::Debug for DemoRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemoRun")
            .field("stage_count", &self.tree.stage_count())
            .field("exporters", &self.exporters.len())
            .finish()
    }
}

/// Build the exporter set the configuration enables.
fn build_exporters(config: &EngineConfig) -> Vec<Box<dyn ExportAdapter>> {
    let mut exporters: Vec<Box<dyn ExportAdapter>> = Vec::new();
    if config.exporters.in_memory.enabled {
        exporters.push(Box::new(InMemoryExporter::with_ring_buffer(
            config.exporters.in_memory.buffer_size,
        )));
    }
    if config.exporters.cloudwatch.enabled {
        exporters.push(Box::new(CloudWatchExporter::from_config(
            &config.exporters.cloudwatch,
        )));
    }
    if config.exporters.prometheus.enabled {
        exporters.push(Box::new(PrometheusExporter::from_config(
            &config.exporters.prometheus,
        )));
    }
    if config.exporters.datadog.enabled {
        exporters.push(Box::new(DatadogExporter::from_config(
            &config.exporters.datadog,
        )));
    }
    exporters
}

/// Deterministic per-turn duration jitter so replays are reproducible.
fn jitter(turn: usize, salt: usize) -> f64 {
    ((turn * 37 + salt * 13) % 29) as f64
}

/// Replay one loop turn through the bus and record it into the tree.
fn replay_turn(
    bus: &mut StageEventBus,
    tree: &mut ExecutionTree,
    turn: usize,
    is_last: bool,
) -> Result<(), TreeError> {
    if turn == 0 {
        bus.notify_stage_end("Initialize", 2.0, 1, 2);
        tree.add_stage(
            ExecutionTreeNode::stage("initialize", "Initialize")
                .with_description("Sets up the adapter, tool registry, and observer chain")
                .with_sentence("Loaded LLM adapter and registered tool get_weather")
                .with_duration_ms(2.0),
        )?;
    }

    for (salt, (stage, base, reads, writes)) in REACT_STAGES.iter().enumerate() {
        let duration = base + jitter(turn, salt);
        bus.notify_stage_end(stage, duration, *reads, *writes);

        let slug = stage.to_lowercase().replace(' ', "-");
        let id = format!("{slug}-{turn}");

        if *stage == "Call LLM" {
            tree.add_stage(
                ExecutionTreeNode::subflow(id.clone(), *stage)
                    .with_description("Runs the 3-stage adapter subflow")
                    .with_sentence("Dispatched request through the provider adapter")
                    .with_duration_ms(duration),
            )?;
            for (child, description) in ADAPTER_SUBFLOW {
                let child_slug = child.to_lowercase();
                tree.add_stage(
                    ExecutionTreeNode::stage(format!("{child_slug}-{turn}"), *child)
                        .with_description(*description)
                        .with_parent(id.clone()),
                )?;
            }
        } else {
            tree.add_stage(
                ExecutionTreeNode::stage(id, *stage)
                    .with_description("Pipeline stage")
                    .with_sentence(format!("Completed in {duration}ms"))
                    .with_duration_ms(duration),
            )?;
        }
    }

    if is_last {
        bus.notify_stage_end("Finalize", 1.0, 1, 1);
        tree.add_stage(
            ExecutionTreeNode::stage(format!("finalize-{turn}"), "Finalize")
                .with_description("Extracts the final text response and ends the agent loop")
                .with_sentence("Returned final response to the caller")
                .with_duration_ms(1.0),
        )?;
    } else {
        let duration = 45.0 + jitter(turn, 7);
        let id = format!("execute-tools-{turn}");

        // The scripted tool flakes on every turn after the first: one error,
        // then a successful retry. Enough traffic to exercise the error
        // aggregates and, with the default rules, trip the error-rate alarm.
        if turn >= 1 {
            bus.notify_stage_error("Execute Tools", "tool handler threw: connection refused");
            bus.notify_stage_end("Execute Tools", duration, 2, 1);
            tree.add_stage(
                ExecutionTreeNode::stage(id, "Execute Tools")
                    .with_description("Calls registered tool handlers and collects results")
                    .with_sentence("Tool get_weather failed once, succeeded on retry")
                    .with_duration_ms(duration)
                    .with_error("tool handler threw: connection refused"),
            )?;
        } else {
            bus.notify_stage_end("Execute Tools", duration, 2, 1);
            tree.add_stage(
                ExecutionTreeNode::stage(id, "Execute Tools")
                    .with_description("Calls registered tool handlers and collects results")
                    .with_sentence("Tool get_weather invoked with city=Seattle")
                    .with_duration_ms(duration),
            )?;
        }
    }

    Ok(())
}

/// Run the scripted demo pipeline.
pub fn run_demo_pipeline(config: &EngineConfig, iterations: usize) -> SynapseResult<DemoRun> {
    let iterations = iterations.max(1);
    let exporters = build_exporters(config);

    let mut collector = MetricCollector::new("demo-run");
    for exporter in &exporters {
        collector.attach(exporter.strategy());
    }

    let alarm_config = if config.alarms.rules.is_empty() {
        AlarmsConfig::demo_rules()
    } else {
        config.alarms.clone()
    };
    let alarms = AlarmEvaluator::from_config(&alarm_config);

    let mut bus = StageEventBus::new();
    bus.register(collector);
    bus.register(alarms.clone());

    let mut tree = ExecutionTree::new("react-agent");
    info!(
        target: "synapse::demo",
        run_id = %tree.run_id(),
        iterations,
        "Starting scripted demo run"
    );

    for turn in 0..iterations {
        replay_turn(&mut bus, &mut tree, turn, turn + 1 == iterations)
            .map_err(SynapseError::Tree)?;
    }

    Ok(DemoRun {
        tree,
        alarms,
        exporters,
    })
}

/// Print everything a demo run produced.
pub fn print_demo_run(run: &DemoRun, format: &str) -> SynapseResult<()> {
    let json_output = format == "json";

    println!("━━━ Exports ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for exporter in &run.exporters {
        match exporter.export() {
            Ok(payload) => {
                println!("\n[{}]", exporter.name());
                match &payload {
                    ExportPayload::Prometheus(text) if !json_output => print!("{text}"),
                    payload => {
                        let rendered = serde_json::to_string_pretty(payload).map_err(|e| {
                            SynapseError::Export(ExportError::Serialization {
                                backend: exporter.name(),
                                message: e.to_string(),
                            })
                        })?;
                        println!("{rendered}");
                    }
                }
            }
            // One adapter failing must not stop the rest from printing.
            Err(e) => warn!(
                target: "synapse::demo",
                backend = exporter.name(),
                error = %e,
                "Export failed"
            ),
        }
    }

    let navigator = TreeNavigator::new(&run.tree);
    let summary = navigator.summary();

    println!("\n━━━ Execution Summary ({} stages) ━━━━━━━━━━━━━━━━━━━━━━━━━", summary.len());
    for entry in &summary {
        let marker = if entry.has_error { "✗" } else { "✓" };
        println!("  {marker} {} ({})", entry.id, entry.name);
    }

    // Drill into the failed stages the way an investigating consumer would.
    for entry in summary.iter().filter(|e| e.has_error) {
        let node = navigator.drill_down(&entry.id).map_err(SynapseError::Tree)?;
        println!("\n━━━ Drill-down: {} ━━━", node.id);
        println!("  error: {}", node.error_message.as_deref().unwrap_or("-"));
        println!("  duration: {}ms", node.duration_ms);
        for sentence in &node.narrative_sentences {
            println!("  · {sentence}");
        }
    }

    let alarm_summary = run.alarms.summary();
    println!("\n━━━ Alarms ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  fired: {}, resolved: {}", alarm_summary.fired_total, alarm_summary.resolved_total);
    for name in &alarm_summary.active_alarms {
        println!("  🔔 active: {name}");
    }

    Ok(())
}

// ============================================================================
// SECTION 18: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the Synapse engine
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    info!("⚡ {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Some(Commands::Demo { iterations, format }) => {
            let run = run_demo_pipeline(&config, iterations)?;
            print_demo_run(&run, &format)?;
        }
        None => {
            let run = run_demo_pipeline(&config, 5)?;
            print_demo_run(&run, "text")?;
        }
        _ => unreachable!(),
    }

    Ok(())
}

// ============================================================================
// SECTION 19: PHASE 4 TESTS
// ============================================================================

#[cfg(test)]
mod phase4_tests {
    use super::*;

    #[test]
    fn test_demo_pipeline_end_to_end() {
        let mut config = EngineConfig::default();
        config.exporters.in_memory.enabled = true;

        let run = run_demo_pipeline(&config, 5).unwrap();

        // Initialize + 4 turns * (4 stages + 3 subflow children + execute-tools)
        // + final turn (4 stages + 3 children + finalize).
        assert!(run.tree.stage_count() > 20);

        // Each turn after the first flakes once: 3 errors over 5 turns, and
        // the default high-error-rate rule (gte 3) has fired.
        let summary = run.alarms.summary();
        assert!(summary.fired_total >= 1);
        assert!(summary
            .active_alarms
            .contains(&"high-error-rate".to_string()));

        // Every configured exporter renders successfully.
        for exporter in &run.exporters {
            assert!(exporter.export().is_ok(), "{} failed", exporter.name());
        }

        // The in-memory payload carries the scripted error volume.
        let in_memory = run
            .exporters
            .iter()
            .find(|e| e.name() == "in-memory")
            .unwrap();
        let payload = in_memory.export().unwrap();
        let result = payload.as_metric_result().unwrap();
        assert_eq!(result.total_errors, 3);
        assert_eq!(result.stage_errors.get("Execute Tools"), Some(&3));
    }

    #[test]
    fn test_demo_tree_subflow_nesting() {
        let config = EngineConfig::default();
        let run = run_demo_pipeline(&config, 2).unwrap();

        let children = run.tree.children("call-llm-0");
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].name, "FormatRequest");
        assert_eq!(children[2].name, "MapResponse");

        let navigator = TreeNavigator::new(&run.tree);
        let node = navigator.drill_down("call-llm-0").unwrap();
        assert_eq!(node.node_type, ExecutionNodeKind::Subflow);
    }

    #[test]
    fn test_demo_single_iteration_has_no_errors() {
        let config = EngineConfig::default();
        let run = run_demo_pipeline(&config, 1).unwrap();

        let navigator = TreeNavigator::new(&run.tree);
        assert!(navigator.summary().iter().all(|e| !e.has_error));
        assert!(run.alarms.summary().active_alarms.is_empty());
    }

    #[test]
    fn test_exporter_set_follows_config() {
        let mut config = EngineConfig::default();
        config.exporters.in_memory.enabled = true;
        config.exporters.cloudwatch.enabled = false;
        config.exporters.datadog.enabled = false;

        let run = run_demo_pipeline(&config, 1).unwrap();
        let names: Vec<&str> = run.exporters.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["in-memory", "prometheus"]);
    }
}
