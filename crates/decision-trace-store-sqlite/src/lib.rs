use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use decision_trace_core::{
    DecisionId, DecisionOutcome, DecisionOutcomeData, DecisionRequest, DecisionTrace, DecisionType,
    Evidence, EvidenceValue, ExceptionType, IngestSource, PolicyException, PolicyReference,
    PolicyRules, PolicyVersion, Precedent, PrecedentCandidate,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Cap on history rows handed to the in-memory precedent matcher per query.
const PRECEDENT_CANDIDATE_CAP: i64 = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS people (
  email TEXT PRIMARY KEY,
  name TEXT
);

CREATE TABLE IF NOT EXISTS customers (
  name TEXT PRIMARY KEY,
  arr REAL,
  industry TEXT,
  tier TEXT,
  last_decision TEXT
);

CREATE TABLE IF NOT EXISTS policy_versions (
  version TEXT PRIMARY KEY,
  effective_from TEXT NOT NULL,
  effective_until TEXT,
  rules_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
  decision_id TEXT PRIMARY KEY,
  timestamp TEXT NOT NULL,
  decision_type TEXT NOT NULL CHECK (decision_type IN ('discount_approval','credit_extension','refund_request','contract_exception','payment_terms','other')),
  customer TEXT NOT NULL,
  requested_action TEXT NOT NULL,
  requestor_email TEXT,
  requestor_name TEXT,
  requested_at TEXT,
  reason TEXT,
  outcome TEXT NOT NULL CHECK (outcome IN ('approved','rejected','modified','escalated','pending')),
  final_action TEXT NOT NULL,
  decision_maker_email TEXT,
  decision_maker_name TEXT,
  decided_at TEXT,
  reasoning TEXT,
  policy_version TEXT,
  exception_made INTEGER NOT NULL CHECK (exception_made IN (0, 1)),
  corrects_decision_id TEXT,
  source TEXT NOT NULL CHECK (source IN ('manual','mailbox','api')),
  raw_text TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (customer) REFERENCES customers(name),
  FOREIGN KEY (policy_version) REFERENCES policy_versions(version),
  FOREIGN KEY (requestor_email) REFERENCES people(email),
  FOREIGN KEY (decision_maker_email) REFERENCES people(email)
);

CREATE TABLE IF NOT EXISTS evidence (
  decision_id TEXT NOT NULL,
  source TEXT NOT NULL,
  field TEXT NOT NULL,
  value_json TEXT NOT NULL,
  captured_at TEXT NOT NULL,
  PRIMARY KEY (decision_id, field),
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS exceptions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  decision_id TEXT NOT NULL,
  exception_type TEXT NOT NULL CHECK (exception_type IN ('exceeds_standard_limit','requires_manager_or_higher','requires_vp_approval','exceeds_all_standard_limits')),
  description TEXT NOT NULL,
  policy_limit REAL NOT NULL,
  actual_value REAL NOT NULL,
  deviation REAL NOT NULL,
  approval_authority TEXT NOT NULL,
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS precedent_links (
  decision_id TEXT NOT NULL,
  precedent_decision_id TEXT NOT NULL,
  similarity_score REAL NOT NULL CHECK (similarity_score >= 0.0 AND similarity_score <= 1.0),
  why_similar TEXT,
  PRIMARY KEY (decision_id, precedent_decision_id),
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id),
  FOREIGN KEY (precedent_decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS ingestions (
  idempotency_key TEXT PRIMARY KEY,
  decision_id TEXT NOT NULL,
  source TEXT NOT NULL,
  ingested_at TEXT NOT NULL,
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE INDEX IF NOT EXISTS idx_decisions_type ON decisions(decision_type);
CREATE INDEX IF NOT EXISTS idx_decisions_customer ON decisions(customer);
CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON decisions(timestamp);
CREATE INDEX IF NOT EXISTS idx_evidence_decision ON evidence(decision_id);
CREATE INDEX IF NOT EXISTS idx_exceptions_decision ON exceptions(decision_id);
CREATE INDEX IF NOT EXISTS idx_precedent_links_decision ON precedent_links(decision_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// External attributes of the customer a decision concerns, merged
/// alongside the trace. Industry and tier stick from the first decision;
/// a later non-null `arr` replaces the stored one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerProfile {
    pub name: String,
    pub arr: Option<f64>,
    pub industry: Option<String>,
    pub tier: Option<String>,
}

/// Listing row: enough to render a decision feed without loading full traces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionSummary {
    pub decision_id: DecisionId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub decision_type: DecisionType,
    pub customer: String,
    pub outcome: DecisionOutcome,
    pub final_action: String,
    pub exception_made: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproverCount {
    pub email: String,
    pub decisions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionCount {
    pub exception_type: ExceptionType,
    pub occurrences: i64,
}

/// Aggregate history view over stored decisions, optionally filtered by
/// decision type and customer industry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternStats {
    pub industry: Option<String>,
    pub decision_type: Option<DecisionType>,
    pub total: i64,
    pub approved: i64,
    pub rejected: i64,
    pub modified: i64,
    pub escalated: i64,
    pub pending: i64,
    pub approval_rate: f64,
    pub top_approvers: Vec<ApproverCount>,
    pub exception_counts: Vec<ExceptionCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed trace store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Record a policy version row keyed by version id. Rules and interval
    /// are immutable once written; an existing version id is left untouched
    /// so earlier traces keep the snapshot they were evaluated against.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_policy_version(&mut self, policy: &PolicyVersion) -> Result<()> {
        let rules_json =
            serde_json::to_string(&policy.rules).context("failed to serialize policy rules")?;
        self.conn
            .execute(
                "INSERT INTO policy_versions(version, effective_from, effective_until, rules_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(version) DO NOTHING",
                params![
                    policy.version,
                    rfc3339(policy.effective_from)?,
                    policy.effective_until.map(rfc3339).transpose()?,
                    rules_json,
                ],
            )
            .context("failed to record policy version")?;
        Ok(())
    }

    /// Load every stored policy version ordered by effective start.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or parsed.
    pub fn list_policy_versions(&self) -> Result<Vec<PolicyVersion>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT version, effective_from, effective_until, rules_json
                 FROM policy_versions
                 ORDER BY effective_from ASC",
            )
            .context("failed to prepare policy version query")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut versions = Vec::new();
        for row in rows {
            let (version, effective_from, effective_until, rules_json) = row?;
            versions.push(PolicyVersion {
                version,
                effective_from: parse_rfc3339(&effective_from)?,
                effective_until: effective_until.as_deref().map(parse_rfc3339).transpose()?,
                rules: serde_json::from_str::<PolicyRules>(&rules_json)
                    .context("failed to deserialize policy rules")?,
            });
        }

        Ok(versions)
    }

    /// Persist one trace and all of its satellite rows in a single
    /// transaction. Returns `false` without touching anything when a
    /// decision with the same id already exists.
    ///
    /// # Errors
    /// Returns an error when validation or any insert fails; partial traces
    /// are never left behind.
    pub fn persist_trace(
        &mut self,
        trace: &DecisionTrace,
        customer: Option<&CustomerProfile>,
    ) -> Result<bool> {
        trace.validate().map_err(|err| anyhow!("trace validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;

        let exists = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM decisions WHERE decision_id = ?1)",
                params![trace.decision_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check for existing decision")?;
        if exists == 1 {
            return Ok(false);
        }

        merge_customer(&tx, &trace.request.customer, customer, &rfc3339(trace.timestamp)?)?;
        if let Some(email) = &trace.request.requestor_email {
            ensure_person(&tx, email, trace.request.requestor_name.as_deref())?;
        }
        if let Some(email) = &trace.decision.decision_maker_email {
            ensure_person(&tx, email, trace.decision.decision_maker_name.as_deref())?;
        }

        if let Some(policy) = &trace.policy {
            let rules_json = serde_json::to_string(&policy.rules)
                .context("failed to serialize policy rules")?;
            tx.execute(
                "INSERT INTO policy_versions(version, effective_from, effective_until, rules_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(version) DO NOTHING",
                params![
                    policy.version,
                    rfc3339(policy.effective_from)?,
                    policy.effective_until.map(rfc3339).transpose()?,
                    rules_json,
                ],
            )
            .context("failed to record policy version")?;
        }

        tx.execute(
            "INSERT INTO decisions(
                decision_id, timestamp, decision_type, customer,
                requested_action, requestor_email, requestor_name, requested_at, reason,
                outcome, final_action, decision_maker_email, decision_maker_name, decided_at, reasoning,
                policy_version, exception_made, corrects_decision_id, source, raw_text, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21
            )",
            params![
                trace.decision_id.to_string(),
                rfc3339(trace.timestamp)?,
                trace.decision_type.as_str(),
                trace.request.customer,
                trace.request.requested_action,
                trace.request.requestor_email,
                trace.request.requestor_name,
                trace.request.requested_at.map(rfc3339).transpose()?,
                trace.request.reason,
                trace.decision.outcome.as_str(),
                trace.decision.final_action,
                trace.decision.decision_maker_email,
                trace.decision.decision_maker_name,
                trace.decision.decided_at.map(rfc3339).transpose()?,
                trace.decision.reasoning,
                trace.policy.as_ref().map(|policy| policy.version.clone()),
                i64::from(!trace.exceptions.is_empty()),
                trace.corrects_decision_id.map(|id| id.to_string()),
                trace.source.as_str(),
                trace.raw_text,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert decision row")?;

        for item in &trace.evidence {
            tx.execute(
                "INSERT INTO evidence(decision_id, source, field, value_json, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    trace.decision_id.to_string(),
                    item.source,
                    item.field,
                    serde_json::to_string(&item.value)
                        .context("failed to serialize evidence value")?,
                    rfc3339(item.captured_at)?,
                ],
            )
            .context("failed to insert evidence row")?;
        }

        for exception in &trace.exceptions {
            tx.execute(
                "INSERT INTO exceptions(
                    decision_id, exception_type, description,
                    policy_limit, actual_value, deviation, approval_authority
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    trace.decision_id.to_string(),
                    exception.exception_type.as_str(),
                    exception.description,
                    exception.policy_limit,
                    exception.actual_value,
                    exception.deviation,
                    exception.approval_authority,
                ],
            )
            .context("failed to insert exception row")?;
        }

        for precedent in &trace.precedents {
            tx.execute(
                "INSERT INTO precedent_links(
                    decision_id, precedent_decision_id, similarity_score, why_similar
                 ) VALUES (?1, ?2, ?3, ?4)",
                params![
                    trace.decision_id.to_string(),
                    precedent.decision_id.to_string(),
                    precedent.similarity_score,
                    precedent.why_similar,
                ],
            )
            .context("failed to insert precedent link")?;
        }

        tx.commit().context("failed to commit trace transaction")?;
        Ok(true)
    }

    /// Load one full trace by decision id, rebuilding evidence, exceptions,
    /// precedents, and the governing policy reference.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or stored data fails to parse.
    pub fn get_decision(&self, decision_id: DecisionId) -> Result<Option<DecisionTrace>> {
        let id_raw = decision_id.to_string();
        let row = self
            .conn
            .query_row(
                "SELECT timestamp, decision_type, customer,
                        requested_action, requestor_email, requestor_name, requested_at, reason,
                        outcome, final_action, decision_maker_email, decision_maker_name,
                        decided_at, reasoning, policy_version, exception_made,
                        corrects_decision_id, source, raw_text
                 FROM decisions WHERE decision_id = ?1",
                params![id_raw],
                |row| {
                    Ok(DecisionRow {
                        timestamp: row.get(0)?,
                        decision_type: row.get(1)?,
                        customer: row.get(2)?,
                        requested_action: row.get(3)?,
                        requestor_email: row.get(4)?,
                        requestor_name: row.get(5)?,
                        requested_at: row.get(6)?,
                        reason: row.get(7)?,
                        outcome: row.get(8)?,
                        final_action: row.get(9)?,
                        decision_maker_email: row.get(10)?,
                        decision_maker_name: row.get(11)?,
                        decided_at: row.get(12)?,
                        reasoning: row.get(13)?,
                        policy_version: row.get(14)?,
                        exception_made: row.get(15)?,
                        corrects_decision_id: row.get(16)?,
                        source: row.get(17)?,
                        raw_text: row.get(18)?,
                    })
                },
            )
            .optional()
            .context("failed to load decision row")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let exceptions = self.load_exceptions(&id_raw)?;
        let policy = match &row.policy_version {
            Some(version) => Some(self.load_policy_reference(version, row.exception_made == 1)?),
            None => None,
        };

        Ok(Some(DecisionTrace {
            decision_id,
            timestamp: parse_rfc3339(&row.timestamp)?,
            decision_type: DecisionType::parse(&row.decision_type)
                .ok_or_else(|| anyhow!("unknown decision_type: {}", row.decision_type))?,
            request: DecisionRequest {
                customer: row.customer,
                requested_action: row.requested_action,
                requestor_email: row.requestor_email,
                requestor_name: row.requestor_name,
                requested_at: row.requested_at.as_deref().map(parse_rfc3339).transpose()?,
                reason: row.reason,
            },
            decision: DecisionOutcomeData {
                outcome: DecisionOutcome::parse(&row.outcome)
                    .ok_or_else(|| anyhow!("unknown outcome: {}", row.outcome))?,
                final_action: row.final_action,
                decision_maker_email: row.decision_maker_email,
                decision_maker_name: row.decision_maker_name,
                decided_at: row.decided_at.as_deref().map(parse_rfc3339).transpose()?,
                reasoning: row.reasoning,
            },
            evidence: self.load_evidence(&id_raw)?,
            policy,
            precedents: self.load_precedents(&id_raw)?,
            exceptions,
            corrects_decision_id: row
                .corrects_decision_id
                .as_deref()
                .map(parse_decision_id)
                .transpose()?,
            source: IngestSource::parse(&row.source)
                .ok_or_else(|| anyhow!("unknown ingest source: {}", row.source))?,
            raw_text: row.raw_text,
        }))
    }

    /// Most recent decisions first, truncated to `limit`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or parsed.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionSummary>> {
        self.summaries(
            "SELECT decision_id, timestamp, decision_type, customer, outcome, final_action, exception_made
             FROM decisions ORDER BY timestamp DESC LIMIT ?1",
            params![i64::try_from(limit).unwrap_or(i64::MAX)],
        )
    }

    /// Decision history for one customer, most recent first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or parsed.
    pub fn decisions_for_customer(
        &self,
        customer: &str,
        limit: usize,
    ) -> Result<Vec<DecisionSummary>> {
        self.summaries(
            "SELECT decision_id, timestamp, decision_type, customer, outcome, final_action, exception_made
             FROM decisions WHERE customer = ?1 ORDER BY timestamp DESC LIMIT ?2",
            params![customer, i64::try_from(limit).unwrap_or(i64::MAX)],
        )
    }

    /// History rows of the given type offered to the precedent matcher,
    /// joined with customer attributes, excluding `exclude` when given.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or parsed.
    pub fn precedent_candidates(
        &self,
        decision_type: DecisionType,
        exclude: Option<DecisionId>,
    ) -> Result<Vec<PrecedentCandidate>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.decision_id, d.customer, d.decision_type, c.industry, c.arr,
                        d.final_action, d.timestamp
                 FROM decisions d
                 LEFT JOIN customers c ON c.name = d.customer
                 WHERE d.decision_type = ?1 AND d.decision_id != ?2
                 ORDER BY d.timestamp DESC
                 LIMIT ?3",
            )
            .context("failed to prepare precedent candidate query")?;
        let excluded = exclude.map(|id| id.to_string()).unwrap_or_default();
        let rows = stmt.query_map(
            params![decision_type.as_str(), excluded, PRECEDENT_CANDIDATE_CAP],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;

        let mut candidates = Vec::new();
        for row in rows {
            let (decision_id, customer, type_raw, industry, arr, final_action, timestamp) = row?;
            candidates.push(PrecedentCandidate {
                decision_id: parse_decision_id(&decision_id)?,
                customer,
                decision_type: DecisionType::parse(&type_raw)
                    .ok_or_else(|| anyhow!("unknown decision_type: {type_raw}"))?,
                industry,
                arr,
                final_action,
                timestamp: parse_rfc3339(&timestamp)?,
            });
        }

        Ok(candidates)
    }

    /// Aggregate outcome, approver, and exception statistics over stored
    /// decisions, optionally restricted to one decision type and/or one
    /// customer industry.
    ///
    /// # Errors
    /// Returns an error when aggregate queries fail.
    pub fn pattern_stats(
        &self,
        industry: Option<&str>,
        decision_type: Option<DecisionType>,
    ) -> Result<PatternStats> {
        let type_filter = decision_type.map_or_else(String::new, |value| value.as_str().to_string());
        let industry_filter = industry.unwrap_or_default();

        let mut outcome_stmt = self
            .conn
            .prepare(
                "SELECT d.outcome, COUNT(*) FROM decisions d
                 LEFT JOIN customers c ON c.name = d.customer
                 WHERE (?1 = '' OR d.decision_type = ?1)
                   AND (?2 = '' OR c.industry = ?2)
                 GROUP BY d.outcome",
            )
            .context("failed to prepare outcome stats query")?;
        let outcome_rows = outcome_stmt
            .query_map(params![type_filter, industry_filter], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

        let mut stats = PatternStats {
            industry: industry.map(str::to_string),
            decision_type,
            total: 0,
            approved: 0,
            rejected: 0,
            modified: 0,
            escalated: 0,
            pending: 0,
            approval_rate: 0.0,
            top_approvers: Vec::new(),
            exception_counts: Vec::new(),
        };

        for row in outcome_rows {
            let (outcome_raw, count) = row?;
            let outcome = DecisionOutcome::parse(&outcome_raw)
                .ok_or_else(|| anyhow!("unknown outcome: {outcome_raw}"))?;
            stats.total += count;
            match outcome {
                DecisionOutcome::Approved => stats.approved = count,
                DecisionOutcome::Rejected => stats.rejected = count,
                DecisionOutcome::Modified => stats.modified = count,
                DecisionOutcome::Escalated => stats.escalated = count,
                DecisionOutcome::Pending => stats.pending = count,
            }
        }

        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = (stats.approved + stats.modified) as f64 / stats.total as f64;
            stats.approval_rate = rate;
        }

        let mut approver_stmt = self
            .conn
            .prepare(
                "SELECT d.decision_maker_email, COUNT(*) AS decisions FROM decisions d
                 LEFT JOIN customers c ON c.name = d.customer
                 WHERE d.decision_maker_email IS NOT NULL
                   AND (?1 = '' OR d.decision_type = ?1)
                   AND (?2 = '' OR c.industry = ?2)
                 GROUP BY d.decision_maker_email
                 ORDER BY decisions DESC, d.decision_maker_email ASC
                 LIMIT 5",
            )
            .context("failed to prepare approver stats query")?;
        let approver_rows = approver_stmt
            .query_map(params![type_filter, industry_filter], |row| {
                Ok(ApproverCount { email: row.get(0)?, decisions: row.get(1)? })
            })?;
        for row in approver_rows {
            stats.top_approvers.push(row?);
        }

        let mut exception_stmt = self
            .conn
            .prepare(
                "SELECT e.exception_type, COUNT(*) AS occurrences
                 FROM exceptions e
                 JOIN decisions d ON d.decision_id = e.decision_id
                 LEFT JOIN customers c ON c.name = d.customer
                 WHERE (?1 = '' OR d.decision_type = ?1)
                   AND (?2 = '' OR c.industry = ?2)
                 GROUP BY e.exception_type
                 ORDER BY occurrences DESC, e.exception_type ASC",
            )
            .context("failed to prepare exception stats query")?;
        let exception_rows = exception_stmt.query_map(params![type_filter, industry_filter], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in exception_rows {
            let (type_raw, occurrences) = row?;
            stats.exception_counts.push(ExceptionCount {
                exception_type: ExceptionType::parse(&type_raw)
                    .ok_or_else(|| anyhow!("unknown exception_type: {type_raw}"))?,
                occurrences,
            });
        }

        Ok(stats)
    }

    /// Record that an idempotency key produced the given decision.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_ingestion(
        &mut self,
        idempotency_key: &str,
        decision_id: DecisionId,
        source: IngestSource,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO ingestions(idempotency_key, decision_id, source, ingested_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    idempotency_key,
                    decision_id.to_string(),
                    source.as_str(),
                    now_rfc3339()?,
                ],
            )
            .context("failed to record ingestion")?;
        Ok(())
    }

    /// Look up the decision previously produced by an idempotency key.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn lookup_ingestion(&self, idempotency_key: &str) -> Result<Option<DecisionId>> {
        let existing = self
            .conn
            .query_row(
                "SELECT decision_id FROM ingestions WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up ingestion")?;
        existing.as_deref().map(parse_decision_id).transpose()
    }

    /// Export every trace and policy version as NDJSON files plus a digest
    /// manifest into `out_dir`.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut stmt = self
            .conn
            .prepare("SELECT decision_id FROM decisions ORDER BY timestamp ASC, decision_id ASC")
            .context("failed to prepare export id query")?;
        let id_rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut traces = Vec::new();
        for row in id_rows {
            let id = parse_decision_id(&row?)?;
            let trace = self
                .get_decision(id)?
                .ok_or_else(|| anyhow!("decision disappeared during export: {id}"))?;
            traces.push(trace);
        }

        let policies = self.list_policy_versions()?;

        let traces_path = out_dir.join("decision_traces.ndjson");
        let trace_digest = write_ndjson_file(&traces_path, &traces)?;

        let policies_path = out_dir.join("policy_versions.ndjson");
        let policy_digest = write_ndjson_file(&policies_path, &policies)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "decision_traces.ndjson".to_string(),
                    sha256: trace_digest.0,
                    records: trace_digest.1,
                },
                ExportFileDigest {
                    path: "policy_versions.ndjson".to_string(),
                    sha256: policy_digest.0,
                    records: policy_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn summaries(
        &self,
        query: &str,
        query_params: impl rusqlite::Params,
    ) -> Result<Vec<DecisionSummary>> {
        let mut stmt =
            self.conn.prepare(query).context("failed to prepare decision summary query")?;
        let rows = stmt.query_map(query_params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id_raw, timestamp, type_raw, customer, outcome_raw, final_action, exception) =
                row?;
            summaries.push(DecisionSummary {
                decision_id: parse_decision_id(&id_raw)?,
                timestamp: parse_rfc3339(&timestamp)?,
                decision_type: DecisionType::parse(&type_raw)
                    .ok_or_else(|| anyhow!("unknown decision_type: {type_raw}"))?,
                customer,
                outcome: DecisionOutcome::parse(&outcome_raw)
                    .ok_or_else(|| anyhow!("unknown outcome: {outcome_raw}"))?,
                final_action,
                exception_made: exception == 1,
            });
        }

        Ok(summaries)
    }

    fn load_evidence(&self, decision_id: &str) -> Result<Vec<Evidence>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source, field, value_json, captured_at
                 FROM evidence WHERE decision_id = ?1
                 ORDER BY source ASC, field ASC",
            )
            .context("failed to prepare evidence query")?;
        let rows = stmt.query_map(params![decision_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut evidence = Vec::new();
        for row in rows {
            let (source, field, value_json, captured_at) = row?;
            evidence.push(Evidence {
                source,
                field,
                value: serde_json::from_str::<EvidenceValue>(&value_json)
                    .context("failed to deserialize evidence value")?,
                captured_at: parse_rfc3339(&captured_at)?,
            });
        }

        Ok(evidence)
    }

    fn load_exceptions(&self, decision_id: &str) -> Result<Vec<PolicyException>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT exception_type, description, policy_limit, actual_value, deviation, approval_authority
                 FROM exceptions WHERE decision_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare exception query")?;
        let rows = stmt.query_map(params![decision_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut exceptions = Vec::new();
        for row in rows {
            let (type_raw, description, policy_limit, actual_value, deviation, authority) = row?;
            exceptions.push(PolicyException {
                exception_type: ExceptionType::parse(&type_raw)
                    .ok_or_else(|| anyhow!("unknown exception_type: {type_raw}"))?,
                description,
                policy_limit,
                actual_value,
                deviation,
                approval_authority: authority,
            });
        }

        Ok(exceptions)
    }

    fn load_precedents(&self, decision_id: &str) -> Result<Vec<Precedent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.precedent_decision_id, d.customer, d.final_action,
                        p.similarity_score, d.timestamp, p.why_similar
                 FROM precedent_links p
                 JOIN decisions d ON d.decision_id = p.precedent_decision_id
                 WHERE p.decision_id = ?1
                 ORDER BY d.timestamp DESC, p.precedent_decision_id ASC",
            )
            .context("failed to prepare precedent query")?;
        let rows = stmt.query_map(params![decision_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut precedents = Vec::new();
        for row in rows {
            let (id_raw, customer, outcome, similarity_score, timestamp, why_similar) = row?;
            precedents.push(Precedent {
                decision_id: parse_decision_id(&id_raw)?,
                customer,
                outcome,
                similarity_score,
                timestamp: parse_rfc3339(&timestamp)?,
                why_similar,
            });
        }

        Ok(precedents)
    }

    fn load_policy_reference(&self, version: &str, exception_made: bool) -> Result<PolicyReference> {
        let (effective_from, effective_until, rules_json) = self
            .conn
            .query_row(
                "SELECT effective_from, effective_until, rules_json
                 FROM policy_versions WHERE version = ?1",
                params![version],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .context("failed to load referenced policy version")?;

        Ok(PolicyReference {
            version: version.to_string(),
            effective_from: parse_rfc3339(&effective_from)?,
            effective_until: effective_until.as_deref().map(parse_rfc3339).transpose()?,
            rules: serde_json::from_str::<PolicyRules>(&rules_json)
                .context("failed to deserialize policy rules")?,
            exception_made,
        })
    }
}

struct DecisionRow {
    timestamp: String,
    decision_type: String,
    customer: String,
    requested_action: String,
    requestor_email: Option<String>,
    requestor_name: Option<String>,
    requested_at: Option<String>,
    reason: Option<String>,
    outcome: String,
    final_action: String,
    decision_maker_email: Option<String>,
    decision_maker_name: Option<String>,
    decided_at: Option<String>,
    reasoning: Option<String>,
    policy_version: Option<String>,
    exception_made: i64,
    corrects_decision_id: Option<String>,
    source: String,
    raw_text: Option<String>,
}

/// Merge a customer node. Industry and tier are set on first creation only;
/// repeat decisions refresh `last_decision` and overwrite `arr` when the new
/// profile carries one.
fn merge_customer(
    tx: &rusqlite::Transaction<'_>,
    name: &str,
    profile: Option<&CustomerProfile>,
    decided: &str,
) -> Result<()> {
    let (arr, industry, tier) = profile.map_or((None, None, None), |profile| {
        (profile.arr, profile.industry.clone(), profile.tier.clone())
    });
    tx.execute(
        "INSERT INTO customers(name, arr, industry, tier, last_decision)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
           arr = COALESCE(excluded.arr, customers.arr),
           last_decision = excluded.last_decision",
        params![name, arr, industry, tier, decided],
    )
    .context("failed to merge customer")?;
    Ok(())
}

/// Merge a person node. Name is set on first creation only.
fn ensure_person(tx: &rusqlite::Transaction<'_>, email: &str, name: Option<&str>) -> Result<()> {
    tx.execute(
        "INSERT INTO people(email, name) VALUES (?1, ?2)
         ON CONFLICT(email) DO NOTHING",
        params![email, name],
    )
    .context("failed to merge person")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_decision_id(raw: &str) -> Result<DecisionId> {
    DecisionId::parse(raw).ok_or_else(|| anyhow!("invalid decision id: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use decision_trace_core::{
        assemble, classify_exception, AssemblyInput, Classification, DiscountLimits,
    };
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_policy() -> PolicyVersion {
        PolicyVersion {
            version: "v2.0".to_string(),
            effective_from: fixture_time() - Duration::days(30),
            effective_until: None,
            rules: PolicyRules {
                discount_limits: DiscountLimits { standard: 10.0, manager: 15.0, vp: 20.0, cfo: 30.0 },
                approval_thresholds: std::collections::BTreeMap::new(),
                exception_rules: vec![],
            },
        }
    }

    fn mk_trace(customer: &str, final_action: &str, decided_at: OffsetDateTime) -> DecisionTrace {
        mk_trace_with(customer, final_action, decided_at, mk_policy(), "Jane")
    }

    fn mk_trace_with(
        customer: &str,
        final_action: &str,
        decided_at: OffsetDateTime,
        policy: PolicyVersion,
        maker_name: &str,
    ) -> DecisionTrace {
        let exceptions = match classify_exception(final_action, &policy) {
            Classification::Exception(exception) => vec![exception],
            Classification::WithinPolicy | Classification::Unparseable => vec![],
        };

        assemble(AssemblyInput {
            decision_type: DecisionType::DiscountApproval,
            request: DecisionRequest {
                customer: customer.to_string(),
                requested_action: format!("{final_action} discount"),
                requestor_email: Some("john.sales@company.com".to_string()),
                requestor_name: Some("John".to_string()),
                requested_at: Some(decided_at - Duration::hours(4)),
                reason: Some("renewal at risk".to_string()),
            },
            decision: DecisionOutcomeData {
                outcome: DecisionOutcome::Approved,
                final_action: final_action.to_string(),
                decision_maker_email: Some("jane.manager@company.com".to_string()),
                decision_maker_name: Some(maker_name.to_string()),
                decided_at: Some(decided_at),
                reasoning: Some("strategic account".to_string()),
            },
            evidence: vec![
                Evidence {
                    source: "crm".to_string(),
                    field: "arr".to_string(),
                    value: EvidenceValue::Number(450_000.0),
                    captured_at: decided_at,
                },
                Evidence {
                    source: "crm".to_string(),
                    field: "industry".to_string(),
                    value: EvidenceValue::Text("healthcare".to_string()),
                    captured_at: decided_at,
                },
            ],
            policy: Some(policy),
            exceptions,
            precedents: vec![],
            corrects_decision_id: None,
            source: IngestSource::Manual,
            raw_text: Some("From: john.sales@company.com\napproved".to_string()),
        })
    }

    fn mk_profile(name: &str) -> CustomerProfile {
        CustomerProfile {
            name: name.to_string(),
            arr: Some(450_000.0),
            industry: Some("healthcare".to_string()),
            tier: Some("enterprise".to_string()),
        }
    }

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let mut store = open_store()?;
        store.migrate()?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn persist_and_get_round_trips_the_full_trace() -> Result<()> {
        let mut store = open_store()?;

        let trace = mk_trace("MedTech Corp", "18%", fixture_time());
        assert!(store.persist_trace(&trace, Some(&mk_profile("MedTech Corp")))?);

        let loaded = match store.get_decision(trace.decision_id)? {
            Some(loaded) => loaded,
            None => panic!("persisted trace should be loadable"),
        };

        assert_eq!(loaded.decision_id, trace.decision_id);
        assert_eq!(loaded.evidence, trace.evidence);
        assert_eq!(loaded.exceptions, trace.exceptions);
        assert_eq!(loaded.request, trace.request);
        assert_eq!(loaded.decision, trace.decision);
        match (&loaded.policy, &trace.policy) {
            (Some(loaded_policy), Some(expected)) => {
                assert_eq!(loaded_policy.version, expected.version);
                assert_eq!(loaded_policy.rules, expected.rules);
                assert!(loaded_policy.exception_made);
            }
            _ => panic!("policy reference should survive the round trip"),
        }
        Ok(())
    }

    #[test]
    fn persisting_the_same_decision_twice_is_a_noop() -> Result<()> {
        let mut store = open_store()?;

        let trace = mk_trace("MedTech Corp", "12%", fixture_time());
        assert!(store.persist_trace(&trace, None)?);
        assert!(!store.persist_trace(&trace, None)?);

        let count: i64 = store.conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| {
            row.get(0)
        })?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn customer_upsert_keeps_known_attributes() -> Result<()> {
        let mut store = open_store()?;

        let first = mk_trace("MedTech Corp", "12%", fixture_time());
        store.persist_trace(&first, Some(&mk_profile("MedTech Corp")))?;

        // A later trace without profile data must not erase what we know.
        let second = mk_trace("MedTech Corp", "8%", fixture_time() + Duration::days(1));
        store.persist_trace(&second, None)?;

        let industry: Option<String> = store.conn.query_row(
            "SELECT industry FROM customers WHERE name = ?1",
            params!["MedTech Corp"],
            |row| row.get(0),
        )?;
        assert_eq!(industry.as_deref(), Some("healthcare"));
        Ok(())
    }

    #[test]
    fn earlier_traces_keep_their_policy_snapshot() -> Result<()> {
        let mut store = open_store()?;

        let first = mk_trace("MedTech Corp", "12%", fixture_time());
        store.persist_trace(&first, None)?;

        // Same version id, different rules: must not rewrite the stored row.
        let mut drifted = mk_policy();
        drifted.rules.discount_limits.standard = 12.0;
        let second = mk_trace_with(
            "MedTech Corp",
            "14%",
            fixture_time() + Duration::days(1),
            drifted,
            "Jane",
        );
        store.persist_trace(&second, None)?;

        let loaded = match store.get_decision(first.decision_id)? {
            Some(loaded) => loaded,
            None => panic!("first trace should be loadable"),
        };
        let standard = match &loaded.policy {
            Some(policy) => policy.rules.discount_limits.standard,
            None => panic!("first trace should carry a policy reference"),
        };
        assert!((standard - 10.0).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn person_name_is_set_on_first_creation_only() -> Result<()> {
        let mut store = open_store()?;

        let first = mk_trace_with("MedTech Corp", "12%", fixture_time(), mk_policy(), "Jane");
        store.persist_trace(&first, None)?;

        let second = mk_trace_with(
            "MedTech Corp",
            "14%",
            fixture_time() + Duration::days(1),
            mk_policy(),
            "Janet",
        );
        store.persist_trace(&second, None)?;

        let name: Option<String> = store.conn.query_row(
            "SELECT name FROM people WHERE email = ?1",
            params!["jane.manager@company.com"],
            |row| row.get(0),
        )?;
        assert_eq!(name.as_deref(), Some("Jane"));
        Ok(())
    }

    #[test]
    fn repeat_decisions_refresh_last_decision_but_not_industry() -> Result<()> {
        let mut store = open_store()?;

        let first = mk_trace("MedTech Corp", "12%", fixture_time());
        store.persist_trace(&first, Some(&mk_profile("MedTech Corp")))?;

        let mut relabeled = mk_profile("MedTech Corp");
        relabeled.arr = Some(500_000.0);
        relabeled.industry = Some("biotech".to_string());
        let second = mk_trace("MedTech Corp", "8%", fixture_time() + Duration::days(1));
        store.persist_trace(&second, Some(&relabeled))?;

        let (arr, industry, last_decision): (Option<f64>, Option<String>, Option<String>) =
            store.conn.query_row(
                "SELECT arr, industry, last_decision FROM customers WHERE name = ?1",
                params!["MedTech Corp"],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
        assert!((arr.unwrap_or_default() - 500_000.0).abs() < f64::EPSILON);
        assert_eq!(industry.as_deref(), Some("healthcare"));
        assert_eq!(last_decision.as_deref(), Some(rfc3339(second.timestamp)?.as_str()));
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = open_store()?;

        let check_result = store.conn.execute(
            "INSERT INTO decisions(
                decision_id, timestamp, decision_type, customer, requested_action,
                outcome, final_action, exception_made, source, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                DecisionId::new().to_string(),
                "2026-01-01T00:00:00Z",
                "not_a_decision_type",
                "MedTech Corp",
                "18% discount",
                "approved",
                "18%",
                0_i64,
                "manual",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO evidence(decision_id, source, field, value_json, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                DecisionId::new().to_string(),
                "crm",
                "arr",
                "450000.0",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(fk_result.is_err());

        Ok(())
    }

    #[test]
    fn recent_decisions_orders_newest_first_and_truncates() -> Result<()> {
        let mut store = open_store()?;

        let oldest = mk_trace("MedTech Corp", "8%", fixture_time());
        let middle = mk_trace("HealthTech Inc", "12%", fixture_time() + Duration::days(1));
        let newest = mk_trace("BioPharm LLC", "18%", fixture_time() + Duration::days(2));
        store.persist_trace(&oldest, None)?;
        store.persist_trace(&middle, None)?;
        store.persist_trace(&newest, None)?;

        let recent = store.recent_decisions(2)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].decision_id, newest.decision_id);
        assert_eq!(recent[1].decision_id, middle.decision_id);
        assert!(recent[0].exception_made);
        Ok(())
    }

    #[test]
    fn decisions_for_customer_filters_by_name() -> Result<()> {
        let mut store = open_store()?;

        store.persist_trace(&mk_trace("MedTech Corp", "8%", fixture_time()), None)?;
        store.persist_trace(
            &mk_trace("HealthTech Inc", "12%", fixture_time() + Duration::days(1)),
            None,
        )?;

        let rows = store.decisions_for_customer("MedTech Corp", 10)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].customer, "MedTech Corp");
        Ok(())
    }

    #[test]
    fn precedent_candidates_join_customer_attributes_and_exclude_self() -> Result<()> {
        let mut store = open_store()?;

        let history = mk_trace("MedTech Corp", "12%", fixture_time());
        let current = mk_trace("HealthTech Inc", "18%", fixture_time() + Duration::days(1));
        store.persist_trace(&history, Some(&mk_profile("MedTech Corp")))?;
        store.persist_trace(&current, None)?;

        let candidates = store
            .precedent_candidates(DecisionType::DiscountApproval, Some(current.decision_id))?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].decision_id, history.decision_id);
        assert_eq!(candidates[0].industry.as_deref(), Some("healthcare"));
        assert_eq!(candidates[0].arr, Some(450_000.0));
        Ok(())
    }

    #[test]
    fn precedent_links_survive_the_round_trip() -> Result<()> {
        let mut store = open_store()?;

        let earlier = mk_trace("MedTech Corp", "12%", fixture_time());
        store.persist_trace(&earlier, None)?;

        let mut current = mk_trace("HealthTech Inc", "18%", fixture_time() + Duration::days(1));
        current.precedents = vec![Precedent {
            decision_id: earlier.decision_id,
            customer: earlier.request.customer.clone(),
            outcome: earlier.decision.final_action.clone(),
            similarity_score: 0.85,
            timestamp: earlier.timestamp,
            why_similar: Some("same decision type (discount_approval)".to_string()),
        }];
        store.persist_trace(&current, None)?;

        let loaded = match store.get_decision(current.decision_id)? {
            Some(loaded) => loaded,
            None => panic!("persisted trace should be loadable"),
        };
        assert_eq!(loaded.precedents.len(), 1);
        assert_eq!(loaded.precedents[0].decision_id, earlier.decision_id);
        assert_eq!(loaded.precedents[0].customer, "MedTech Corp");
        Ok(())
    }

    #[test]
    fn pattern_stats_aggregates_outcomes_approvers_and_exceptions() -> Result<()> {
        let mut store = open_store()?;

        let mut rejected = mk_trace("MedTech Corp", "waived fee", fixture_time());
        rejected.decision.outcome = DecisionOutcome::Rejected;
        store.persist_trace(&rejected, None)?;
        store.persist_trace(
            &mk_trace("HealthTech Inc", "18%", fixture_time() + Duration::days(1)),
            None,
        )?;
        store.persist_trace(
            &mk_trace("BioPharm LLC", "27%", fixture_time() + Duration::days(2)),
            None,
        )?;

        let stats = store.pattern_stats(None, Some(DecisionType::DiscountApproval))?;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.approved, 2);
        assert_eq!(stats.rejected, 1);
        assert!((stats.approval_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.top_approvers.len(), 1);
        assert_eq!(stats.top_approvers[0].decisions, 3);

        let exception_total: i64 =
            stats.exception_counts.iter().map(|count| count.occurrences).sum();
        assert_eq!(exception_total, 2);
        Ok(())
    }

    #[test]
    fn pattern_stats_industry_filter_uses_customer_attributes() -> Result<()> {
        let mut store = open_store()?;

        store.persist_trace(
            &mk_trace("MedTech Corp", "12%", fixture_time()),
            Some(&mk_profile("MedTech Corp")),
        )?;
        let finance_profile = CustomerProfile {
            name: "FinServe Co".to_string(),
            arr: Some(620_000.0),
            industry: Some("finance".to_string()),
            tier: Some("enterprise".to_string()),
        };
        store.persist_trace(
            &mk_trace("FinServe Co", "8%", fixture_time() + Duration::days(1)),
            Some(&finance_profile),
        )?;

        let stats = store.pattern_stats(Some("healthcare"), None)?;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.industry.as_deref(), Some("healthcare"));
        Ok(())
    }

    #[test]
    fn pattern_stats_on_empty_store_is_all_zero() -> Result<()> {
        let store = open_store()?;
        let stats = store.pattern_stats(None, None)?;
        assert_eq!(stats.total, 0);
        assert!((stats.approval_rate - 0.0).abs() < f64::EPSILON);
        assert!(stats.top_approvers.is_empty());
        Ok(())
    }

    #[test]
    fn ingestion_ledger_maps_keys_to_decisions() -> Result<()> {
        let mut store = open_store()?;

        let trace = mk_trace("MedTech Corp", "12%", fixture_time());
        store.persist_trace(&trace, None)?;
        store.record_ingestion("msg-0001", trace.decision_id, IngestSource::Mailbox)?;

        assert_eq!(store.lookup_ingestion("msg-0001")?, Some(trace.decision_id));
        assert_eq!(store.lookup_ingestion("msg-9999")?, None);
        Ok(())
    }

    #[test]
    fn recorded_policy_version_is_immutable() -> Result<()> {
        let mut store = open_store()?;

        let mut policy = mk_policy();
        store.record_policy_version(&policy)?;
        policy.rules.discount_limits.standard = 12.0;
        store.record_policy_version(&policy)?;

        let versions = store.list_policy_versions()?;
        assert_eq!(versions.len(), 1);
        assert!((versions[0].rules.discount_limits.standard - 10.0).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn export_snapshot_writes_files_and_digest_manifest() -> Result<()> {
        let mut store = open_store()?;

        store.persist_trace(&mk_trace("MedTech Corp", "18%", fixture_time()), None)?;
        store.record_policy_version(&mk_policy())?;

        let out_dir = std::env::temp_dir().join(format!("dtrace-export-{}", Ulid::new()));
        let manifest = store.export_snapshot(&out_dir)?;

        assert_eq!(manifest.schema_version, LATEST_SCHEMA_VERSION);
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].records, 1);
        for file in &manifest.files {
            assert!(out_dir.join(&file.path).exists());
            assert_eq!(file.sha256.len(), 64);
        }

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    #[test]
    fn get_unknown_decision_is_none() -> Result<()> {
        let store = open_store()?;
        assert!(store.get_decision(DecisionId::new())?.is_none());
        Ok(())
    }
}
