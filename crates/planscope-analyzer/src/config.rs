//! Per-request analysis options

use crate::classify::ThresholdOverrides;
use planscope_core::SourceEngine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading `AnalysisOptions` from a document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid option: {0}")]
    Invalid(String),
}

/// Options for a single `PlanAnalyzer::analyze` call
///
/// ```
/// use planscope_analyzer::AnalysisOptions;
///
/// let options = AnalysisOptions::from_toml_str(
///     "engine = \"postgres\"\ntimeout_ms = 250\n\n[thresholds]\nscan_cost_percent = 35.0\n",
/// )
/// .unwrap();
/// assert_eq!(options.timeout_ms, Some(250));
/// assert_eq!(options.thresholds.scan_cost_percent, Some(35.0));
/// assert!(options.schema_lookup);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Engine hint such as "sqlserver", "postgres" or "mysql"; sniffed when unset
    pub engine: Option<String>,
    /// Overall deadline, measured from the start of the analysis
    pub timeout_ms: Option<u64>,
    /// Classifier threshold overrides
    pub thresholds: ThresholdOverrides,
    /// Whether to ask the schema metadata provider for index information
    pub schema_lookup: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            engine: None,
            timeout_ms: None,
            thresholds: ThresholdOverrides::default(),
            schema_lookup: true,
        }
    }
}

impl AnalysisOptions {
    /// Creates options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the engine hint
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    /// Sets the overall timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the classifier threshold overrides
    pub fn with_thresholds(mut self, thresholds: ThresholdOverrides) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Sets whether schema metadata lookup is attempted
    pub fn with_schema_lookup(mut self, enabled: bool) -> Self {
        self.schema_lookup = enabled;
        self
    }

    /// Parses options from TOML
    ///
    /// Unknown threshold names are rejected. An engine hint that names no
    /// supported engine is rejected here rather than at analysis time.
    /// Out-of-range threshold values are accepted and later replaced by
    /// their defaults with a warning.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(source)?;
        if let Some(engine) = &options.engine
            && SourceEngine::from_hint(engine).is_none()
        {
            return Err(ConfigError::Invalid(format!("unknown engine '{}'", engine)));
        }
        Ok(options)
    }
}
