//! Analysis Orchestrator
//!
//! Runs the pipeline stages in order under one deadline:
//!
//! ```text
//! Received → Parsing → Extracting → Classifying → Synthesizing → Complete
//! ```
//!
//! A parse failure (including running out of time while parsing) ends the
//! analysis as `Failed`. Running out of time in any later stage ends it as
//! `PartialTimeout`, keeping whatever the finished stages produced. Every other
//! issue is collected as a warning and the pipeline carries on.

use crate::cancel::{Deadline, Interrupted};
use crate::classify::{Bottleneck, ClassificationWarning, Classifier, Rule, Severity};
use crate::config::AnalysisOptions;
use crate::metrics::annotate;
use crate::parse::{AdapterRegistry, DEFAULT_ADAPTERS, ParseError};
use crate::plan::{NormalizedPlan, ParseWarning};
use crate::synthesize::{Recommendation, SynthesisWarning, Synthesizer};
use planscope_core::{SchemaLookup, SchemaMetadataProvider, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    Received,
    Parsing,
    Extracting,
    Classifying,
    Synthesizing,
    Complete,
}

impl AnalysisStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Parsing => "parsing",
            Self::Extracting => "metric extraction",
            Self::Classifying => "classification",
            Self::Synthesizing => "synthesis",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Complete,
    /// The deadline passed after parsing; results are partial
    PartialTimeout,
    /// The document could not be parsed
    Failed,
}

/// Why an analysis failed
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "error")]
pub enum AnalysisFailure {
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Non-fatal issue attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "detail")]
pub enum AnalysisWarning {
    Parse(ParseWarning),
    Classification(ClassificationWarning),
    Synthesis(SynthesisWarning),
    /// The result stops short of a full analysis
    PartialResult(String),
}

impl fmt::Display for AnalysisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(warning) => f.write_str(&warning.message),
            Self::Classification(warning) => write!(f, "{}", warning),
            Self::Synthesis(warning) => write!(f, "{}", warning),
            Self::PartialResult(message) => f.write_str(message),
        }
    }
}

/// Output of `PlanAnalyzer::analyze`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// The annotated plan; `None` only when parsing failed
    pub plan: Option<NormalizedPlan>,
    pub bottlenecks: Vec<Bottleneck>,
    /// Recommendations, best first
    pub recommendations: Vec<Recommendation>,
    pub status: AnalysisStatus,
    pub error: Option<AnalysisFailure>,
    pub warnings: Vec<AnalysisWarning>,
    /// Last stage entered
    pub stage_reached: AnalysisStage,
}

impl AnalysisResult {
    fn received() -> Self {
        Self {
            plan: None,
            bottlenecks: Vec::new(),
            recommendations: Vec::new(),
            status: AnalysisStatus::Complete,
            error: None,
            warnings: Vec::new(),
            stage_reached: AnalysisStage::Received,
        }
    }

    fn enter(&mut self, stage: AnalysisStage) {
        tracing::debug!(stage = %stage, "Entering analysis stage");
        self.stage_reached = stage;
    }

    fn failed(mut self, error: ParseError) -> Self {
        tracing::info!(error = %error, "Plan could not be parsed");
        self.status = AnalysisStatus::Failed;
        self.error = Some(error.into());
        self
    }

    fn timed_out(mut self) -> Self {
        tracing::warn!(stage = %self.stage_reached, "Analysis deadline exceeded, returning partial result");
        self.status = AnalysisStatus::PartialTimeout;
        self.warnings.push(AnalysisWarning::PartialResult(format!(
            "deadline exceeded during {}; results are partial",
            self.stage_reached
        )));
        self
    }

    /// Returns true if the analysis ran to completion
    pub fn is_complete(&self) -> bool {
        self.status == AnalysisStatus::Complete
    }

    /// Returns true if any bottleneck is high severity
    pub fn has_high_severity(&self) -> bool {
        self.bottlenecks.iter().any(|b| b.severity == Severity::High)
    }

    /// Number of bottlenecks with the given severity
    pub fn count_severity(&self, severity: Severity) -> usize {
        self.bottlenecks.iter().filter(|b| b.severity == severity).count()
    }

    /// Overall score from 0 to 100, higher is better
    pub fn performance_score(&self) -> u8 {
        self.bottlenecks.iter().fold(100u8, |score, b| {
            let penalty = match b.severity {
                Severity::High => 25,
                Severity::Medium => 10,
                Severity::Low => 3,
            };
            score.saturating_sub(penalty)
        })
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("Analysis failed: {}", error);
        }

        let high = self.count_severity(Severity::High);
        let medium = self.count_severity(Severity::Medium);
        let low = self.count_severity(Severity::Low);

        let mut summary = if self.bottlenecks.is_empty() {
            "Plan looks optimal - no bottlenecks detected.".to_string()
        } else if high > 0 {
            format!(
                "Plan has {} high, {} medium and {} low severity bottleneck(s) with {} recommendation(s). Performance score: {}/100",
                high,
                medium,
                low,
                self.recommendations.len(),
                self.performance_score()
            )
        } else if medium > 0 {
            format!(
                "Plan has {} medium and {} low severity bottleneck(s) with {} recommendation(s). Performance score: {}/100",
                medium,
                low,
                self.recommendations.len(),
                self.performance_score()
            )
        } else {
            format!(
                "Plan has {} minor bottleneck(s). Performance score: {}/100",
                low,
                self.performance_score()
            )
        };

        if self.status == AnalysisStatus::PartialTimeout {
            summary.push_str(&format!(" (partial: stopped during {})", self.stage_reached));
        }
        summary
    }
}

/// Runs the analysis pipeline
///
/// Cheap to clone; analyses share nothing mutable and can run concurrently.
#[derive(Clone)]
pub struct PlanAnalyzer {
    registry: Arc<AdapterRegistry>,
    schema_provider: Option<Arc<dyn SchemaMetadataProvider>>,
    rules: Vec<Rule>,
}

impl Default for PlanAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanAnalyzer {
    /// Creates an analyzer with the built-in adapters and no schema provider
    pub fn new() -> Self {
        Self {
            registry: DEFAULT_ADAPTERS.clone(),
            schema_provider: None,
            rules: Vec::new(),
        }
    }

    /// Sets the schema metadata collaborator
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaMetadataProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    /// Replaces the adapter registry
    pub fn with_registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Adds a classification rule on top of the built-in table
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Analyzes a raw plan document
    ///
    /// The deadline starts now and covers every stage, including the schema
    /// metadata lookup.
    #[tracing::instrument(
        skip(self, document, options),
        fields(engine = options.engine.as_deref().unwrap_or("auto"), len = document.len())
    )]
    pub async fn analyze(&self, document: &str, options: &AnalysisOptions) -> AnalysisResult {
        let deadline = Deadline::from_timeout_ms(options.timeout_ms);
        self.analyze_with_deadline(document, options, &deadline).await
    }

    /// Analyzes a raw plan document under a caller-owned deadline
    ///
    /// `options.timeout_ms` is ignored; cancelling the deadline's token stops
    /// the analysis at the next node boundary.
    pub async fn analyze_with_deadline(
        &self,
        document: &str,
        options: &AnalysisOptions,
        deadline: &Deadline,
    ) -> AnalysisResult {
        let mut result = AnalysisResult::received();

        result.enter(AnalysisStage::Parsing);
        let plan = match self.registry.parse(document, options.engine.as_deref(), deadline) {
            Ok(plan) => plan,
            Err(e) => return result.failed(e),
        };
        result
            .warnings
            .extend(plan.warnings.iter().cloned().map(AnalysisWarning::Parse));

        result.enter(AnalysisStage::Extracting);
        let plan = match annotate(&plan, deadline) {
            Ok(annotated) => annotated,
            Err(Interrupted) => {
                result.plan = Some(plan);
                return result.timed_out();
            }
        };

        result.enter(AnalysisStage::Classifying);
        let (classifier, threshold_warnings) = Classifier::from_overrides(&options.thresholds);
        let classifier = self.rules.iter().fold(classifier, |c, rule| c.with_rule(*rule));
        result
            .warnings
            .extend(threshold_warnings.into_iter().map(AnalysisWarning::Classification));
        let classification = classifier.classify(&plan, deadline);
        result.bottlenecks = classification.bottlenecks;
        if classification.interrupted {
            result.plan = Some(plan);
            return result.timed_out();
        }

        result.enter(AnalysisStage::Synthesizing);
        let (schema, lookup_timed_out) = self.lookup_schema(&plan, options, deadline).await;
        let outcome = Synthesizer::new(plan.engine).synthesize(&result.bottlenecks, &schema, deadline);
        result.recommendations = outcome.recommendations;
        result
            .warnings
            .extend(outcome.warnings.into_iter().map(AnalysisWarning::Synthesis));
        result.plan = Some(plan);
        if lookup_timed_out || outcome.interrupted {
            return result.timed_out();
        }

        result.enter(AnalysisStage::Complete);
        tracing::debug!(
            bottlenecks = result.bottlenecks.len(),
            recommendations = result.recommendations.len(),
            "Analysis complete"
        );
        result
    }

    /// Asks the provider for metadata on the plan's tables, bounded by the deadline
    ///
    /// Returns the lookup and whether it was cut short by the deadline.
    async fn lookup_schema(
        &self,
        plan: &NormalizedPlan,
        options: &AnalysisOptions,
        deadline: &Deadline,
    ) -> (SchemaLookup, bool) {
        if !options.schema_lookup {
            return (SchemaLookup::unavailable("schema lookup disabled"), false);
        }
        let Some(provider) = &self.schema_provider else {
            return (SchemaLookup::unavailable("no schema metadata provider configured"), false);
        };

        let tables = plan.tables();
        if tables.is_empty() {
            return (SchemaLookup::Available(SchemaSnapshot::default()), false);
        }

        let token = deadline.cancellation_token();
        let expiry = async {
            match deadline.remaining() {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            lookup = provider.lookup(&tables) => (lookup, false),
            _ = expiry => {
                tracing::warn!(tables = tables.len(), "Schema metadata lookup exceeded the deadline");
                (SchemaLookup::unavailable("schema metadata lookup timed out"), true)
            }
            _ = token.cancelled() => {
                (SchemaLookup::unavailable("schema metadata lookup cancelled"), true)
            }
        }
    }
}
