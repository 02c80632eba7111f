use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use decision_trace_core::{
    assemble, classify_exception, match_precedents, AssemblyInput, Classification, DecisionId,
    DecisionOutcome, DecisionOutcomeData, DecisionRequest, DecisionTrace, DecisionType,
    DiscountLimits, Evidence, EvidenceValue, IngestSource, PolicyRules, PolicyStore, PolicyVersion,
    Precedent, PrecedentProfile,
};
use decision_trace_store_sqlite::{
    CustomerProfile, DecisionSummary, ExportManifest, PatternStats, SchemaStatus, SqliteStore,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// How many precedents a trace carries at most.
const PRECEDENT_LIMIT: usize = 5;

/// Confidence attached to pattern-based fallback extraction.
const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid ingest request: {0}")]
    InvalidInput(String),
    #[error("message source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

/// One inbound decision to ingest. `message_text` carries the raw thread
/// inline; `message_ref` points at an external message store instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    pub message_text: Option<String>,
    pub message_ref: Option<String>,
    pub message_key: Option<String>,
    pub customer_name: String,
    pub decision_type: DecisionType,
    pub source: IngestSource,
    pub corrects_decision_id: Option<DecisionId>,
}

/// Outcome of one ingestion. A trace is always produced; `degraded` lists
/// every collaborator that was skipped along the way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub trace: DecisionTrace,
    pub persisted: bool,
    pub duplicate_of: Option<DecisionId>,
    pub degraded: Vec<String>,
    pub value_parse_failed: bool,
}

/// Structured fields recovered from a raw message. Everything is optional;
/// the engine fills gaps with request data and defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedDecision {
    pub requested_action: Option<String>,
    pub final_action: Option<String>,
    pub outcome: Option<DecisionOutcome>,
    pub requestor_email: Option<String>,
    pub requestor_name: Option<String>,
    pub decision_maker_email: Option<String>,
    pub decision_maker_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub requested_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    pub reason: Option<String>,
    pub reasoning: Option<String>,
    pub confidence: f64,
}

/// Turns a raw message into structured decision fields.
pub trait DecisionExtractor {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error when the message cannot be processed at all;
    /// partial results should be returned instead where possible.
    fn extract(&self, text: &str, customer: &str) -> Result<ExtractedDecision>;
}

/// Fetches point-in-time facts about a customer from one external system.
pub trait EvidenceProvider {
    fn source(&self) -> &'static str;

    /// # Errors
    /// Returns an error when the backing system is unreachable; an unknown
    /// customer yields an empty bundle, not an error.
    fn fetch(&self, customer: &str) -> Result<Vec<Evidence>>;
}

/// Resolves a `message_ref` to raw text. No implementation ships by
/// default; mailbox connectors plug in here.
pub trait MessageSource {
    /// # Errors
    /// Returns an error when the reference cannot be resolved.
    fn resolve(&self, message_ref: &str) -> Result<String>;
}

/// Optional graded similarity between the current request and a precedent.
/// `None` means "no opinion"; the structural baseline score stands.
pub trait SimilarityScorer {
    fn score(&self, query_summary: &str, candidate_summary: &str) -> Option<f64>;
    fn explain(&self, query_summary: &str, candidate_summary: &str) -> Option<String>;
}

/// Pattern-based extraction used whenever no richer extractor is
/// configured or the configured one fails. First email address is the
/// requestor, the last one the decision maker; first percentage is the
/// ask, the last one the final value.
pub struct PatternExtractor {
    email_re: Regex,
    percent_re: Regex,
}

const APPROVAL_MARKERS: &[&str] =
    &["approved", "approve", "lgtm", "go ahead", "sounds good", "fine by me"];
const REJECTION_MARKERS: &[&str] = &["rejected", "denied", "can't do", "too high", "decline"];

impl PatternExtractor {
    /// # Errors
    /// Returns an error when the extraction patterns fail to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            email_re: Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+")
                .context("failed to compile email pattern")?,
            percent_re: Regex::new(r"(\d{1,2})%")
                .context("failed to compile percentage pattern")?,
        })
    }
}

impl DecisionExtractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn extract(&self, text: &str, _customer: &str) -> Result<ExtractedDecision> {
        let emails: Vec<&str> = self.email_re.find_iter(text).map(|m| m.as_str()).collect();
        let percentages: Vec<String> = self
            .percent_re
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();

        let requested_action = percentages.first().cloned();
        let final_action = percentages.last().cloned();

        let lowered = text.to_lowercase();
        let outcome = if APPROVAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            if requested_action == final_action {
                Some(DecisionOutcome::Approved)
            } else {
                Some(DecisionOutcome::Modified)
            }
        } else if REJECTION_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            Some(DecisionOutcome::Rejected)
        } else {
            Some(DecisionOutcome::Pending)
        };

        Ok(ExtractedDecision {
            requested_action,
            final_action,
            outcome,
            requestor_email: emails.first().map(|email| (*email).to_string()),
            decision_maker_email: if emails.len() >= 2 {
                emails.last().map(|email| (*email).to_string())
            } else {
                None
            },
            confidence: FALLBACK_CONFIDENCE,
            ..ExtractedDecision::default()
        })
    }
}

/// Cosine similarity over lowercase term counts. Provider-free stand-in
/// for embedding-based similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScorer;

fn term_counts(text: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for raw in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        let term = raw.to_ascii_lowercase();
        if term.len() >= 2 {
            *counts.entry(term).or_insert(0) += 1;
        }
    }
    counts
}

impl SimilarityScorer for LexicalScorer {
    fn score(&self, query_summary: &str, candidate_summary: &str) -> Option<f64> {
        let query = term_counts(query_summary);
        let candidate = term_counts(candidate_summary);
        if query.is_empty() || candidate.is_empty() {
            return None;
        }

        let mut dot = 0.0_f64;
        for (term, count) in &query {
            if let Some(other) = candidate.get(term) {
                #[allow(clippy::cast_precision_loss)]
                {
                    dot += (*count as f64) * (*other as f64);
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let norm = |counts: &BTreeMap<String, usize>| {
            counts.values().map(|count| (*count as f64).powi(2)).sum::<f64>().sqrt()
        };

        let denominator = norm(&query) * norm(&candidate);
        if denominator == 0.0 {
            return None;
        }
        Some((dot / denominator).clamp(0.0, 1.0))
    }

    fn explain(&self, query_summary: &str, candidate_summary: &str) -> Option<String> {
        let query = term_counts(query_summary);
        let candidate = term_counts(candidate_summary);
        let shared: Vec<&str> = query
            .keys()
            .filter(|term| candidate.contains_key(*term))
            .map(String::as_str)
            .take(3)
            .collect();
        if shared.is_empty() {
            None
        } else {
            Some(format!("shared terms: {}", shared.join(", ")))
        }
    }
}

/// Fixture customer rows mirrored across all stub providers.
struct StubCustomer {
    name: &'static str,
    arr: f64,
    tier: &'static str,
    industry: &'static str,
    sev1_tickets: f64,
    satisfaction_score: f64,
    margin_percent: f64,
    ltv: f64,
    payment_status: &'static str,
}

const STUB_CUSTOMERS: &[StubCustomer] = &[
    StubCustomer {
        name: "MedTech Corp",
        arr: 450_000.0,
        tier: "enterprise",
        industry: "healthcare",
        sev1_tickets: 3.0,
        satisfaction_score: 3.2,
        margin_percent: 32.0,
        ltv: 2_400_000.0,
        payment_status: "current",
    },
    StubCustomer {
        name: "HealthTech Inc",
        arr: 320_000.0,
        tier: "enterprise",
        industry: "healthcare",
        sev1_tickets: 1.0,
        satisfaction_score: 4.1,
        margin_percent: 38.0,
        ltv: 1_600_000.0,
        payment_status: "current",
    },
    StubCustomer {
        name: "BioPharm LLC",
        arr: 180_000.0,
        tier: "growth",
        industry: "biotech",
        sev1_tickets: 0.0,
        satisfaction_score: 4.5,
        margin_percent: 42.0,
        ltv: 900_000.0,
        payment_status: "current",
    },
    StubCustomer {
        name: "FinServe Co",
        arr: 620_000.0,
        tier: "enterprise",
        industry: "finance",
        sev1_tickets: 2.0,
        satisfaction_score: 3.5,
        margin_percent: 28.0,
        ltv: 3_100_000.0,
        payment_status: "overdue",
    },
    StubCustomer {
        name: "TechStartup XYZ",
        arr: 45_000.0,
        tier: "startup",
        industry: "tech",
        sev1_tickets: 0.0,
        satisfaction_score: 4.8,
        margin_percent: 55.0,
        ltv: 225_000.0,
        payment_status: "current",
    },
];

fn lookup_stub_customer(name: &str) -> Option<&'static StubCustomer> {
    let needle = name.trim().to_lowercase();
    STUB_CUSTOMERS
        .iter()
        .find(|customer| customer.name.to_lowercase() == needle)
        .or_else(|| {
            STUB_CUSTOMERS.iter().find(|customer| {
                let key = customer.name.to_lowercase();
                key.contains(&needle) || needle.contains(&key)
            })
        })
}

fn evidence(source: &str, field: &str, value: EvidenceValue) -> Evidence {
    Evidence {
        source: source.to_string(),
        field: field.to_string(),
        value,
        captured_at: OffsetDateTime::now_utc(),
    }
}

/// Stub CRM lookup: ARR, tier, industry for the fixture customers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubCrmProvider;

impl EvidenceProvider for StubCrmProvider {
    fn source(&self) -> &'static str {
        "crm"
    }

    fn fetch(&self, customer: &str) -> Result<Vec<Evidence>> {
        let Some(row) = lookup_stub_customer(customer) else {
            return Ok(Vec::new());
        };
        Ok(vec![
            evidence("crm", "arr", EvidenceValue::Number(row.arr)),
            evidence("crm", "tier", EvidenceValue::Text(row.tier.to_string())),
            evidence("crm", "industry", EvidenceValue::Text(row.industry.to_string())),
        ])
    }
}

/// Stub support-system lookup: critical ticket load and CSAT.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubSupportProvider;

impl EvidenceProvider for StubSupportProvider {
    fn source(&self) -> &'static str {
        "support"
    }

    fn fetch(&self, customer: &str) -> Result<Vec<Evidence>> {
        let Some(row) = lookup_stub_customer(customer) else {
            return Ok(Vec::new());
        };
        Ok(vec![
            evidence("support", "sev1_tickets", EvidenceValue::Number(row.sev1_tickets)),
            evidence(
                "support",
                "satisfaction_score",
                EvidenceValue::Number(row.satisfaction_score),
            ),
        ])
    }
}

/// Stub finance lookup: margin, lifetime value, payment standing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubFinanceProvider;

impl EvidenceProvider for StubFinanceProvider {
    fn source(&self) -> &'static str {
        "finance"
    }

    fn fetch(&self, customer: &str) -> Result<Vec<Evidence>> {
        let Some(row) = lookup_stub_customer(customer) else {
            return Ok(Vec::new());
        };
        Ok(vec![
            evidence("finance", "margin_percent", EvidenceValue::Number(row.margin_percent)),
            evidence("finance", "ltv", EvidenceValue::Number(row.ltv)),
            evidence(
                "finance",
                "payment_status",
                EvidenceValue::Text(row.payment_status.to_string()),
            ),
        ])
    }
}

#[must_use]
pub fn stub_providers() -> Vec<Box<dyn EvidenceProvider + Send + Sync>> {
    vec![
        Box::new(StubCrmProvider),
        Box::new(StubSupportProvider),
        Box::new(StubFinanceProvider),
    ]
}

// Built-in policy table mirroring the seed data: v1.0 governed
// 2023-01-01 through 2025-06-30, v2.0 is current from 2025-07-01.
const POLICY_V1_FROM: i64 = 1_672_531_200;
const POLICY_V1_UNTIL: i64 = 1_751_327_999;
const POLICY_V2_FROM: i64 = 1_751_328_000;

fn at_unix(timestamp: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(timestamp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[must_use]
pub fn default_policy_versions() -> Vec<PolicyVersion> {
    vec![
        PolicyVersion {
            version: "v1.0".to_string(),
            effective_from: at_unix(POLICY_V1_FROM),
            effective_until: Some(at_unix(POLICY_V1_UNTIL)),
            rules: PolicyRules {
                discount_limits: DiscountLimits { standard: 10.0, manager: 15.0, vp: 20.0, cfo: 25.0 },
                approval_thresholds: BTreeMap::new(),
                exception_rules: vec![],
            },
        },
        PolicyVersion {
            version: "v2.0".to_string(),
            effective_from: at_unix(POLICY_V2_FROM),
            effective_until: None,
            rules: PolicyRules {
                discount_limits: DiscountLimits { standard: 10.0, manager: 15.0, vp: 20.0, cfo: 30.0 },
                approval_thresholds: BTreeMap::new(),
                exception_rules: vec![],
            },
        },
    ]
}

/// Load an ordered policy version list from a JSON or YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_policy_versions(path: &Path) -> Result<Vec<PolicyVersion>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    if is_yaml {
        serde_yaml::from_slice(&bytes)
            .with_context(|| format!("failed to parse policy YAML {}", path.display()))
    } else {
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse policy JSON {}", path.display()))
    }
}

/// Build a validated policy store from a config file, or from the built-in
/// default table when no path is given.
///
/// # Errors
/// Returns an error when loading fails or the version set is ambiguous.
pub fn build_policy_store(path: Option<&Path>) -> Result<PolicyStore> {
    let versions = match path {
        Some(path) => load_policy_versions(path)?,
        None => default_policy_versions(),
    };
    PolicyStore::new(versions).map_err(|err| anyhow!("invalid policy configuration: {err}"))
}

/// Orchestrates one ingestion end to end and fronts read access for the
/// service and CLI. Opens the store per call, as the database lives on
/// local disk and calls are infrequent.
pub struct DecisionEngine {
    db_path: PathBuf,
    policies: PolicyStore,
    extractor: Option<Box<dyn DecisionExtractor + Send + Sync>>,
    fallback: PatternExtractor,
    providers: Vec<Box<dyn EvidenceProvider + Send + Sync>>,
    message_source: Option<Box<dyn MessageSource + Send + Sync>>,
    scorer: Option<Box<dyn SimilarityScorer + Send + Sync>>,
}

impl DecisionEngine {
    /// # Errors
    /// Returns an error when the fallback extractor cannot be constructed.
    pub fn new(db_path: PathBuf, policies: PolicyStore) -> Result<Self> {
        Ok(Self {
            db_path,
            policies,
            extractor: None,
            fallback: PatternExtractor::new()?,
            providers: stub_providers(),
            message_source: None,
            scorer: Some(Box::new(LexicalScorer)),
        })
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Box<dyn DecisionExtractor + Send + Sync>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    #[must_use]
    pub fn with_providers(
        mut self,
        providers: Vec<Box<dyn EvidenceProvider + Send + Sync>>,
    ) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn with_message_source(mut self, source: Box<dyn MessageSource + Send + Sync>) -> Self {
        self.message_source = Some(source);
        self
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: Option<Box<dyn SimilarityScorer + Send + Sync>>) -> Self {
        self.scorer = scorer;
        self
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Ingest one decision message: extract, gather evidence, evaluate
    /// policy, match precedents, assemble, persist.
    ///
    /// # Errors
    /// Only unusable input, an unresolvable message reference, or total
    /// extraction failure abort; every other collaborator failure degrades
    /// and is listed in the report.
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReport, EngineError> {
        let customer = request.customer_name.trim().to_string();
        if customer.is_empty() {
            return Err(EngineError::InvalidInput("customer_name MUST be non-empty".to_string()));
        }

        let mut degraded = Vec::new();
        let text = self.resolve_text(&request)?;
        let extraction = self.extract(&text, &customer, &mut degraded)?;

        let mut store = match self.open_store() {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(error = %err, "store unavailable; trace will not be persisted");
                degraded.push(format!("store unavailable: {err}"));
                None
            }
        };

        let idempotency_key = request
            .message_key
            .clone()
            .unwrap_or_else(|| content_key(&text));

        if let Some(store) = &store {
            if let Some(report) = check_duplicate(store, &idempotency_key, &mut degraded) {
                return Ok(report);
            }
        }

        let (evidence, profile) = self.gather_evidence(&customer, &mut degraded);

        let decision_time = extraction
            .decided_at
            .or(extraction.requested_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let policy = self.policies.resolve(decision_time).cloned();

        let final_action = extraction
            .final_action
            .clone()
            .or_else(|| extraction.requested_action.clone())
            .unwrap_or_else(|| "unspecified".to_string());

        let mut value_parse_failed = false;
        let exceptions = match &policy {
            Some(policy) => match classify_exception(&final_action, policy) {
                Classification::WithinPolicy => vec![],
                Classification::Unparseable => {
                    value_parse_failed = true;
                    vec![]
                }
                Classification::Exception(exception) => vec![exception],
            },
            None => vec![],
        };

        let precedents = self.find_precedents(
            store.as_ref(),
            &request,
            &extraction,
            &profile,
            &mut degraded,
        );

        let trace = assemble(AssemblyInput {
            decision_type: request.decision_type,
            request: DecisionRequest {
                customer: customer.clone(),
                requested_action: extraction
                    .requested_action
                    .clone()
                    .unwrap_or_else(|| final_action.clone()),
                requestor_email: extraction.requestor_email.clone(),
                requestor_name: extraction.requestor_name.clone(),
                requested_at: extraction.requested_at,
                reason: extraction.reason.clone(),
            },
            decision: DecisionOutcomeData {
                outcome: extraction.outcome.unwrap_or(DecisionOutcome::Pending),
                final_action,
                decision_maker_email: extraction.decision_maker_email.clone(),
                decision_maker_name: extraction.decision_maker_name.clone(),
                decided_at: extraction.decided_at,
                reasoning: extraction.reasoning.clone(),
            },
            evidence,
            policy,
            exceptions,
            precedents,
            corrects_decision_id: request.corrects_decision_id,
            source: request.source,
            raw_text: Some(text),
        });

        let mut persisted = false;
        if let Some(store) = store.as_mut() {
            match store.persist_trace(&trace, profile.as_ref()) {
                Ok(wrote) => {
                    persisted = wrote;
                    if let Err(err) =
                        store.record_ingestion(&idempotency_key, trace.decision_id, request.source)
                    {
                        degraded.push(format!("ingestion ledger write failed: {err}"));
                    }
                }
                Err(err) => {
                    warn!(error = %err, decision_id = %trace.decision_id, "persist failed");
                    degraded.push(format!("persist failed: {err}"));
                }
            }
        }

        info!(
            decision_id = %trace.decision_id,
            customer = %trace.request.customer,
            persisted,
            degraded = degraded.len(),
            "ingested decision"
        );

        Ok(IngestReport { trace, persisted, duplicate_of: None, degraded, value_parse_failed })
    }

    fn resolve_text(&self, request: &IngestRequest) -> Result<String, EngineError> {
        if let Some(text) = &request.message_text {
            if !text.trim().is_empty() {
                return Ok(text.clone());
            }
        }

        let Some(message_ref) = &request.message_ref else {
            return Err(EngineError::InvalidInput(
                "one of message_text or message_ref MUST be provided".to_string(),
            ));
        };

        let Some(source) = &self.message_source else {
            return Err(EngineError::SourceUnavailable(format!(
                "no message source configured to resolve {message_ref}"
            )));
        };
        source
            .resolve(message_ref)
            .map_err(|err| EngineError::SourceUnavailable(format!("{message_ref}: {err}")))
    }

    fn extract(
        &self,
        text: &str,
        customer: &str,
        degraded: &mut Vec<String>,
    ) -> Result<ExtractedDecision, EngineError> {
        if let Some(extractor) = &self.extractor {
            match extractor.extract(text, customer) {
                Ok(extraction) => return Ok(extraction),
                Err(err) => {
                    warn!(extractor = extractor.name(), error = %err, "extractor failed; falling back");
                    degraded.push(format!("extractor {} failed: {err}", extractor.name()));
                }
            }
        }

        self.fallback
            .extract(text, customer)
            .map_err(|err| EngineError::ExtractionFailed(err.to_string()))
    }

    fn gather_evidence(
        &self,
        customer: &str,
        degraded: &mut Vec<String>,
    ) -> (Vec<Evidence>, Option<CustomerProfile>) {
        let mut evidence = Vec::new();
        for provider in &self.providers {
            match provider.fetch(customer) {
                Ok(bundle) => evidence.extend(bundle),
                Err(err) => {
                    warn!(provider = provider.source(), error = %err, "evidence provider unavailable");
                    degraded.push(format!("evidence provider {} unavailable: {err}", provider.source()));
                }
            }
        }

        let profile = profile_from_evidence(customer, &evidence);
        (evidence, profile)
    }

    fn find_precedents(
        &self,
        store: Option<&SqliteStore>,
        request: &IngestRequest,
        extraction: &ExtractedDecision,
        profile: &Option<CustomerProfile>,
        degraded: &mut Vec<String>,
    ) -> Vec<Precedent> {
        let Some(store) = store else {
            return Vec::new();
        };

        let candidates = match store.precedent_candidates(request.decision_type, None) {
            Ok(candidates) => candidates,
            Err(err) => {
                degraded.push(format!("precedent query failed: {err}"));
                return Vec::new();
            }
        };

        let matcher_profile = PrecedentProfile {
            decision_type: request.decision_type,
            industry: profile.as_ref().and_then(|profile| profile.industry.clone()),
            arr: profile.as_ref().and_then(|profile| profile.arr),
        };
        let mut precedents = match_precedents(&matcher_profile, &candidates, PRECEDENT_LIMIT);

        if let Some(scorer) = &self.scorer {
            let query = decision_summary_text(
                &request.customer_name,
                request.decision_type,
                extraction.requested_action.as_deref().or(extraction.final_action.as_deref()),
                extraction.reason.as_deref(),
            );
            for precedent in &mut precedents {
                let candidate = decision_summary_text(
                    &precedent.customer,
                    request.decision_type,
                    Some(&precedent.outcome),
                    None,
                );
                if let Some(score) = scorer.score(&query, &candidate) {
                    precedent.similarity_score = score.clamp(0.0, 1.0);
                }
                if let Some(reason) = scorer.explain(&query, &candidate) {
                    precedent.why_similar = Some(reason);
                }
            }
        }

        precedents
    }

    /// Load one full trace.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn decision(&self, decision_id: DecisionId) -> Result<Option<DecisionTrace>> {
        self.open_store()?.get_decision(decision_id)
    }

    /// Most recent decision summaries.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionSummary>> {
        self.open_store()?.recent_decisions(limit)
    }

    /// Decision summaries for one customer.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn decisions_for_customer(
        &self,
        customer: &str,
        limit: usize,
    ) -> Result<Vec<DecisionSummary>> {
        self.open_store()?.decisions_for_customer(customer, limit)
    }

    /// Aggregate decision patterns.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn pattern_stats(
        &self,
        industry: Option<&str>,
        decision_type: Option<DecisionType>,
    ) -> Result<PatternStats> {
        self.open_store()?.pattern_stats(industry, decision_type)
    }

    /// Export every trace and policy version as an NDJSON snapshot.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or export fails.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.open_store()?.export_snapshot(out_dir)
    }

    /// Schema health of the underlying database.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or inspected.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }
}

fn check_duplicate(
    store: &SqliteStore,
    idempotency_key: &str,
    degraded: &mut Vec<String>,
) -> Option<IngestReport> {
    match store.lookup_ingestion(idempotency_key) {
        Ok(Some(existing_id)) => match store.get_decision(existing_id) {
            Ok(Some(trace)) => {
                info!(decision_id = %existing_id, "duplicate ingestion; returning original");
                return Some(IngestReport {
                    trace,
                    persisted: false,
                    duplicate_of: Some(existing_id),
                    degraded: degraded.clone(),
                    value_parse_failed: false,
                });
            }
            Ok(None) => {
                degraded.push(format!("ledger points at missing decision {existing_id}"));
            }
            Err(err) => degraded.push(format!("duplicate trace load failed: {err}")),
        },
        Ok(None) => {}
        Err(err) => degraded.push(format!("duplicate check failed: {err}")),
    }
    None
}

fn profile_from_evidence(customer: &str, evidence: &[Evidence]) -> Option<CustomerProfile> {
    let mut profile = CustomerProfile {
        name: customer.to_string(),
        arr: None,
        industry: None,
        tier: None,
    };
    let mut populated = false;
    for item in evidence {
        match item.field.as_str() {
            "arr" => {
                if let Some(value) = item.value.as_f64() {
                    profile.arr = Some(value);
                    populated = true;
                }
            }
            "industry" => {
                if let Some(value) = item.value.as_str() {
                    profile.industry = Some(value.to_string());
                    populated = true;
                }
            }
            "tier" => {
                if let Some(value) = item.value.as_str() {
                    profile.tier = Some(value.to_string());
                    populated = true;
                }
            }
            _ => {}
        }
    }
    populated.then_some(profile)
}

/// Textual summary of one decision for graded similarity scoring. Both
/// sides of a comparison are built the same way so shared customer, type,
/// and action terms line up.
fn decision_summary_text(
    customer: &str,
    decision_type: DecisionType,
    action: Option<&str>,
    reason: Option<&str>,
) -> String {
    let mut parts = vec![customer, decision_type.as_str()];
    if let Some(action) = action {
        parts.push(action);
    }
    if let Some(reason) = reason {
        parts.push(reason);
    }
    parts.join(" ")
}

/// Content-derived idempotency key for messages that arrive without an
/// upstream message id.
fn content_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.trim().as_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("txt_{}", &digest_hex[..16])
}
