use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("policy configuration error: {0}")]
    PolicyConfig(String),
}

/// Unique identifier of one decision trace, rendered as `dec_<ulid>`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    pub const PREFIX: &'static str = "dec_";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let raw = value.strip_prefix(Self::PREFIX)?;
        Ulid::from_string(raw).ok().map(Self)
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl Serialize for DecisionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DecisionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid decision id: {raw}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    DiscountApproval,
    CreditExtension,
    RefundRequest,
    ContractException,
    PaymentTerms,
    Other,
}

impl DecisionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscountApproval => "discount_approval",
            Self::CreditExtension => "credit_extension",
            Self::RefundRequest => "refund_request",
            Self::ContractException => "contract_exception",
            Self::PaymentTerms => "payment_terms",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discount_approval" => Some(Self::DiscountApproval),
            "credit_extension" => Some(Self::CreditExtension),
            "refund_request" => Some(Self::RefundRequest),
            "contract_exception" => Some(Self::ContractException),
            "payment_terms" => Some(Self::PaymentTerms),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
    Modified,
    Escalated,
    Pending,
}

impl DecisionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Modified => "modified",
            Self::Escalated => "escalated",
            Self::Pending => "pending",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "modified" => Some(Self::Modified),
            "escalated" => Some(Self::Escalated),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Approval level with an associated maximum limit. `Executive` has no
/// configured limit; it is the tier above every defined one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityTier {
    Standard,
    Manager,
    Vp,
    Cfo,
    Executive,
}

impl AuthorityTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Manager => "manager",
            Self::Vp => "vp",
            Self::Cfo => "cfo",
            Self::Executive => "executive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "manager" => Some(Self::Manager),
            "vp" => Some(Self::Vp),
            "cfo" => Some(Self::Cfo),
            "executive" => Some(Self::Executive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    ExceedsStandardLimit,
    RequiresManagerOrHigher,
    RequiresVpApproval,
    ExceedsAllStandardLimits,
}

impl ExceptionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExceedsStandardLimit => "exceeds_standard_limit",
            Self::RequiresManagerOrHigher => "requires_manager_or_higher",
            Self::RequiresVpApproval => "requires_vp_approval",
            Self::ExceedsAllStandardLimits => "exceeds_all_standard_limits",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exceeds_standard_limit" => Some(Self::ExceedsStandardLimit),
            "requires_manager_or_higher" => Some(Self::RequiresManagerOrHigher),
            "requires_vp_approval" => Some(Self::RequiresVpApproval),
            "exceeds_all_standard_limits" => Some(Self::ExceedsAllStandardLimits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    Manual,
    Mailbox,
    Api,
}

impl IngestSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Mailbox => "mailbox",
            Self::Api => "api",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "mailbox" => Some(Self::Mailbox),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Scalar evidence value captured from an external system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EvidenceValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl EvidenceValue {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// A timestamped fact pulled from an external system at decision time.
/// Immutable once created; one entry per (decision, field).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub source: String,
    pub field: String,
    pub value: EvidenceValue,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DiscountLimits {
    pub standard: f64,
    pub manager: f64,
    pub vp: f64,
    pub cfo: f64,
}

impl DiscountLimits {
    #[must_use]
    pub fn limit_for(&self, tier: AuthorityTier) -> Option<f64> {
        match tier {
            AuthorityTier::Standard => Some(self.standard),
            AuthorityTier::Manager => Some(self.manager),
            AuthorityTier::Vp => Some(self.vp),
            AuthorityTier::Cfo => Some(self.cfo),
            AuthorityTier::Executive => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PolicyRules {
    pub discount_limits: DiscountLimits,
    #[serde(default)]
    pub approval_thresholds: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub exception_rules: Vec<String>,
}

impl Default for DiscountLimits {
    fn default() -> Self {
        Self { standard: 10.0, manager: 15.0, vp: 20.0, cfo: 30.0 }
    }
}

/// A dated set of tiered approval limits. Exactly one version governs any
/// instant inside the configured coverage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyVersion {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_until: Option<OffsetDateTime>,
    pub rules: PolicyRules,
}

impl PolicyVersion {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.effective_until.is_none()
    }

    #[must_use]
    pub fn contains(&self, timestamp: OffsetDateTime) -> bool {
        timestamp >= self.effective_from
            && self.effective_until.map_or(true, |until| timestamp <= until)
    }
}

/// Point-in-time snapshot of the policy version a decision was evaluated
/// against. Fixed at trace assembly; never updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyReference {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_until: Option<OffsetDateTime>,
    pub rules: PolicyRules,
    pub exception_made: bool,
}

/// A recorded deviation of the final decision from the tier that would
/// normally apply. Values are percentage points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyException {
    pub exception_type: ExceptionType,
    pub description: String,
    pub policy_limit: f64,
    pub actual_value: f64,
    pub deviation: f64,
    pub approval_authority: String,
}

/// A prior decision judged similar to the current one. Holds a reference,
/// not ownership; the precedent trace lives elsewhere in the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Precedent {
    pub decision_id: DecisionId,
    pub customer: String,
    pub outcome: String,
    pub similarity_score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub why_similar: Option<String>,
}

/// The "ask": what was requested, by whom, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRequest {
    pub customer: String,
    pub requested_action: String,
    pub requestor_email: Option<String>,
    pub requestor_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub requested_at: Option<OffsetDateTime>,
    pub reason: Option<String>,
}

/// The "answer": what was actually decided.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionOutcomeData {
    pub outcome: DecisionOutcome,
    pub final_action: String,
    pub decision_maker_email: Option<String>,
    pub decision_maker_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
    pub reasoning: Option<String>,
}

/// Immutable record of one organizational decision: the request, the
/// outcome, the evidence that existed at that moment, the governing policy,
/// any deviations from it, and similar prior decisions.
///
/// Created once by [`assemble`] and never mutated. Corrections are new
/// traces pointing at the original via `corrects_decision_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTrace {
    pub decision_id: DecisionId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub decision_type: DecisionType,
    pub request: DecisionRequest,
    pub decision: DecisionOutcomeData,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    pub policy: Option<PolicyReference>,
    #[serde(default)]
    pub precedents: Vec<Precedent>,
    #[serde(default)]
    pub exceptions: Vec<PolicyException>,
    pub corrects_decision_id: Option<DecisionId>,
    pub source: IngestSource,
    pub raw_text: Option<String>,
}

impl DecisionTrace {
    /// Validate trace invariants before persistence.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when identity, consistency, or
    /// range constraints are violated.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.request.customer.trim().is_empty() {
            return Err(TraceError::Validation("customer MUST be non-empty".to_string()));
        }

        if self.request.requested_action.trim().is_empty() {
            return Err(TraceError::Validation("requested_action MUST be non-empty".to_string()));
        }

        if self.decision.final_action.trim().is_empty() {
            return Err(TraceError::Validation("final_action MUST be non-empty".to_string()));
        }

        for precedent in &self.precedents {
            if !(0.0..=1.0).contains(&precedent.similarity_score) {
                return Err(TraceError::Validation(
                    "similarity_score MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }

        if let Some(policy) = &self.policy {
            if policy.exception_made != !self.exceptions.is_empty() {
                return Err(TraceError::Validation(
                    "exception_made MUST agree with the exceptions list".to_string(),
                ));
            }
        } else if !self.exceptions.is_empty() {
            return Err(TraceError::Validation(
                "exceptions MUST be empty when no policy was resolved".to_string(),
            ));
        }

        Ok(())
    }
}

/// Ordered, non-overlapping sequence of policy versions with temporal
/// resolution. Read-only once constructed; safe to share across threads.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    versions: Vec<PolicyVersion>,
}

impl PolicyStore {
    /// Build a store from a version list, validating the interval invariant
    /// eagerly: chronological order, no overlaps, at most one unbounded
    /// `effective_until` and only in final position.
    ///
    /// # Errors
    /// Returns [`TraceError::PolicyConfig`] when the version set is
    /// ambiguous for any timestamp.
    pub fn new(mut versions: Vec<PolicyVersion>) -> Result<Self, TraceError> {
        versions.sort_by_key(|version| version.effective_from);

        for (index, version) in versions.iter().enumerate() {
            if version.version.trim().is_empty() {
                return Err(TraceError::PolicyConfig(
                    "policy version id MUST be non-empty".to_string(),
                ));
            }

            if let Some(until) = version.effective_until {
                if until < version.effective_from {
                    return Err(TraceError::PolicyConfig(format!(
                        "version {} ends before it begins",
                        version.version
                    )));
                }
            } else if index + 1 != versions.len() {
                return Err(TraceError::PolicyConfig(format!(
                    "version {} is unbounded but not the latest version",
                    version.version
                )));
            }

            if let Some(next) = versions.get(index + 1) {
                let Some(until) = version.effective_until else {
                    return Err(TraceError::PolicyConfig(format!(
                        "version {} is unbounded but not the latest version",
                        version.version
                    )));
                };
                if next.effective_from <= until {
                    return Err(TraceError::PolicyConfig(format!(
                        "versions {} and {} overlap",
                        version.version, next.version
                    )));
                }
            }
        }

        Ok(Self { versions })
    }

    /// Resolve which version governed `timestamp`. `None` means "policy
    /// unknown" (e.g. the timestamp predates the earliest version); callers
    /// must not substitute a default.
    #[must_use]
    pub fn resolve(&self, timestamp: OffsetDateTime) -> Option<&PolicyVersion> {
        self.versions.iter().find(|version| version.contains(timestamp))
    }

    /// Numeric limit for a role tier under the version governing
    /// `timestamp`. `None` when no version resolves or the tier carries no
    /// configured limit.
    #[must_use]
    pub fn limit_for(&self, timestamp: OffsetDateTime, tier: AuthorityTier) -> Option<f64> {
        self.resolve(timestamp)?.rules.discount_limits.limit_for(tier)
    }

    /// Lowest tier whose limit covers `value` under the version governing
    /// `timestamp`, walking tiers ascending; `Executive` when the value
    /// exceeds every configured limit.
    #[must_use]
    pub fn required_authority_for(
        &self,
        timestamp: OffsetDateTime,
        value: f64,
    ) -> Option<AuthorityTier> {
        let limits = &self.resolve(timestamp)?.rules.discount_limits;
        let tiers = [
            AuthorityTier::Standard,
            AuthorityTier::Manager,
            AuthorityTier::Vp,
            AuthorityTier::Cfo,
        ];
        for tier in tiers {
            if let Some(limit) = limits.limit_for(tier) {
                if value <= limit {
                    return Some(tier);
                }
            }
        }
        Some(AuthorityTier::Executive)
    }

    #[must_use]
    pub fn current(&self) -> Option<&PolicyVersion> {
        self.versions.iter().find(|version| version.is_current())
    }

    #[must_use]
    pub fn versions(&self) -> &[PolicyVersion] {
        &self.versions
    }
}

/// Outcome of comparing an approved value against tiered policy limits.
///
/// `Unparseable` is deliberately distinct from `WithinPolicy` so callers can
/// record the condition without treating it as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    WithinPolicy,
    Unparseable,
    Exception(PolicyException),
}

fn parse_percent(value: &str) -> Option<f64> {
    let trimmed = value.trim().trim_end_matches('%').trim();
    f64::from_str(trimmed).ok().filter(|parsed| parsed.is_finite())
}

/// Classify a final approved value against the resolved policy's tiered
/// limits. The value is bucketed into the single highest applicable tier;
/// intermediate tiers it also crosses are not reported cumulatively.
#[must_use]
pub fn classify_exception(final_value: &str, policy: &PolicyVersion) -> Classification {
    let Some(value) = parse_percent(final_value) else {
        return Classification::Unparseable;
    };

    let limits = &policy.rules.discount_limits;
    if value <= limits.standard {
        return Classification::WithinPolicy;
    }

    let exception = if value <= limits.manager {
        PolicyException {
            exception_type: ExceptionType::ExceedsStandardLimit,
            description: format!(
                "Value {value}% exceeds standard limit of {}%",
                limits.standard
            ),
            policy_limit: limits.standard,
            actual_value: value,
            deviation: value - limits.standard,
            approval_authority: "Manager (within manager limit)".to_string(),
        }
    } else if value <= limits.vp {
        PolicyException {
            exception_type: ExceptionType::RequiresVpApproval,
            description: format!(
                "Value {value}% exceeds manager limit of {}%",
                limits.manager
            ),
            policy_limit: limits.manager,
            actual_value: value,
            deviation: value - limits.manager,
            approval_authority: "VP (within VP limit)".to_string(),
        }
    } else {
        PolicyException {
            exception_type: ExceptionType::ExceedsAllStandardLimits,
            description: format!("Value {value}% exceeds VP limit of {}%", limits.vp),
            policy_limit: limits.vp,
            actual_value: value,
            deviation: value - limits.vp,
            approval_authority: "Executive exception required".to_string(),
        }
    };

    Classification::Exception(exception)
}

/// Structural profile of the decision being matched against history.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecedentProfile {
    pub decision_type: DecisionType,
    pub industry: Option<String>,
    pub arr: Option<f64>,
}

/// One historical decision row offered to the matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrecedentCandidate {
    pub decision_id: DecisionId,
    pub customer: String,
    pub decision_type: DecisionType,
    pub industry: Option<String>,
    pub arr: Option<f64>,
    pub final_action: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Similarity assigned when a candidate passed every available structural
/// filter; the deterministic path does no graded scoring.
pub const BASELINE_SIMILARITY: f64 = 0.85;

/// ARR window half-width as a fraction of the query value, bounds inclusive.
pub const ARR_WINDOW: f64 = 0.2;

fn arr_in_window(candidate_arr: Option<f64>, query_arr: f64) -> bool {
    let Some(arr) = candidate_arr else {
        return false;
    };
    arr >= query_arr * (1.0 - ARR_WINDOW) && arr <= query_arr * (1.0 + ARR_WINDOW)
}

fn why_similar(profile: &PrecedentProfile) -> String {
    let mut parts = vec![format!("same decision type ({})", profile.decision_type.as_str())];
    if let Some(industry) = &profile.industry {
        parts.push(format!("same industry ({industry})"));
    }
    if profile.arr.is_some() {
        parts.push("similar ARR".to_string());
    }
    parts.join(", ")
}

/// Deterministic structural precedent matching: exact decision type, exact
/// industry when given, ARR within an inclusive 20% window when given;
/// recency descending, truncated to `limit`. Empty history yields an empty
/// list, never an error.
#[must_use]
pub fn match_precedents(
    profile: &PrecedentProfile,
    candidates: &[PrecedentCandidate],
    limit: usize,
) -> Vec<Precedent> {
    let mut matched: Vec<&PrecedentCandidate> = candidates
        .iter()
        .filter(|candidate| candidate.decision_type == profile.decision_type)
        .filter(|candidate| match &profile.industry {
            Some(industry) => candidate.industry.as_deref() == Some(industry.as_str()),
            None => true,
        })
        .filter(|candidate| match profile.arr {
            Some(arr) => arr_in_window(candidate.arr, arr),
            None => true,
        })
        .collect();

    matched.sort_by(|lhs, rhs| {
        rhs.timestamp
            .cmp(&lhs.timestamp)
            .then_with(|| lhs.decision_id.cmp(&rhs.decision_id))
    });
    matched.truncate(limit);

    let reason = why_similar(profile);
    matched
        .into_iter()
        .map(|candidate| Precedent {
            decision_id: candidate.decision_id,
            customer: candidate.customer.clone(),
            outcome: candidate.final_action.clone(),
            similarity_score: BASELINE_SIMILARITY,
            timestamp: candidate.timestamp,
            why_similar: Some(reason.clone()),
        })
        .collect()
}

/// Already-resolved inputs for trace assembly. The assembler performs no
/// I/O; every collaborator result arrives here as plain data.
#[derive(Debug, Clone)]
pub struct AssemblyInput {
    pub decision_type: DecisionType,
    pub request: DecisionRequest,
    pub decision: DecisionOutcomeData,
    pub evidence: Vec<Evidence>,
    pub policy: Option<PolicyVersion>,
    pub exceptions: Vec<PolicyException>,
    pub precedents: Vec<Precedent>,
    pub corrects_decision_id: Option<DecisionId>,
    pub source: IngestSource,
    pub raw_text: Option<String>,
}

/// Compose one immutable [`DecisionTrace`] from already-resolved inputs.
///
/// Canonical timestamp precedence: decision time, then request time, then
/// the current instant. `exception_made` is set iff any exception applies.
#[must_use]
pub fn assemble(input: AssemblyInput) -> DecisionTrace {
    let timestamp = input
        .decision
        .decided_at
        .or(input.request.requested_at)
        .unwrap_or_else(OffsetDateTime::now_utc);

    let exception_made = !input.exceptions.is_empty();
    let policy = input.policy.map(|version| PolicyReference {
        version: version.version,
        effective_from: version.effective_from,
        effective_until: version.effective_until,
        rules: version.rules,
        exception_made,
    });

    DecisionTrace {
        decision_id: DecisionId::new(),
        timestamp,
        decision_type: input.decision_type,
        request: input.request,
        decision: input.decision,
        evidence: input.evidence,
        policy,
        precedents: input.precedents,
        exceptions: input.exceptions,
        corrects_decision_id: input.corrects_decision_id,
        source: input.source,
        raw_text: input.raw_text,
    }
}
