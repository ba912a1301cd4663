//! Compliance monitoring engine.
//!
//! After each completed analysis, jurisdiction rules are evaluated over the
//! findings: missing category coverage, forbidden patterns, and findings at
//! or above the severity floor become alerts (deduplicated against open
//! alerts inside the rule's window), and rolling trend counters advance.
//! Everything is idempotent per `(analysis, rule)` via once-only markers, so
//! reprocessing a job never double-counts.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::model::{
    Analysis, ComplianceAlert, Finding, Jurisdiction, JurisdictionRule, Severity, TrendWindow,
};
use crate::queue::QueueJob;
use crate::store::{CachedReads, MetadataStore};

/// Queue job: evaluate one completed analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceJob {
    pub analysis_id: Uuid,
}

impl QueueJob for ComplianceJob {}

/// Default jurisdiction rule set, patterned after the platform's shipped
/// GDPR/CCPA coverage. `forbidden_patterns` is resolved against the rule
/// library by name at construction time.
pub fn default_jurisdiction_rules(
    pattern_ids_by_name: &std::collections::HashMap<String, Uuid>,
) -> Vec<JurisdictionRule> {
    let forbidden = |names: &[&str]| -> Vec<Uuid> {
        names
            .iter()
            .filter_map(|n| pattern_ids_by_name.get(*n).copied())
            .collect()
    };

    vec![
        JurisdictionRule::new(Jurisdiction::Gdpr, Severity::Critical, chrono::Duration::days(7))
            .with_required_coverage(["data_collection", "data_sharing", "user_rights"])
            .with_forbidden_patterns(forbidden(&["Broad Data Collection", "Third-Party Disclosure"])),
        JurisdictionRule::new(Jurisdiction::Ccpa, Severity::Critical, chrono::Duration::days(7))
            .with_required_coverage(["data_collection", "data_sharing"])
            .with_forbidden_patterns(forbidden(&["Third-Party Disclosure"])),
    ]
}

/// Result of evaluating one analysis.
#[derive(Debug, Default)]
pub struct ComplianceReport {
    pub alerts_opened: Vec<ComplianceAlert>,
    pub rules_evaluated: usize,
    pub rules_skipped: usize,
}

/// The evaluation engine.
pub struct ComplianceEngine {
    store: Arc<MetadataStore>,
    cache: Cache,
    reads: CachedReads,
    events: EventBus,
    rules: Vec<JurisdictionRule>,
}

impl ComplianceEngine {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Cache,
        events: EventBus,
        rules: Vec<JurisdictionRule>,
        cache_cfg: &CacheConfig,
    ) -> Self {
        let reads = CachedReads::new(store.clone(), cache.clone(), cache_cfg);
        Self {
            store,
            cache,
            reads,
            events,
            rules,
        }
    }

    pub fn rules(&self) -> &[JurisdictionRule] {
        &self.rules
    }

    /// Evaluate the analysis referenced by a job.
    pub async fn process(&self, job: &ComplianceJob) -> Result<ComplianceReport> {
        let analysis = self.reads.analysis(job.analysis_id).await?;
        if analysis.completed_at.is_none() {
            return Err(Error::Internal(format!(
                "analysis {} reached compliance without completing",
                analysis.id
            )));
        }
        let findings = self.store.findings_for(analysis.id)?;
        let document = self.store.get_document(analysis.document_id)?;

        let mut report = ComplianceReport::default();
        for rule in &self.rules {
            // Once-only marker: a reprocessed job skips rules it already
            // applied, keeping alerts and counters exact.
            if !self
                .store
                .try_mark_compliance_processed(analysis.id, rule.id)?
            {
                report.rules_skipped += 1;
                continue;
            }
            report.rules_evaluated += 1;

            let evaluation = evaluate_rule(rule, &findings);
            self.open_alerts(rule, &analysis, &evaluation, &mut report)?;
            self.bump_trends(rule, &analysis, &findings, &evaluation, document.document_type.as_str())
                .await;
        }
        Ok(report)
    }

    fn open_alerts(
        &self,
        rule: &JurisdictionRule,
        analysis: &Analysis,
        evaluation: &RuleEvaluation,
        report: &mut ComplianceReport,
    ) -> Result<()> {
        let window_start = Utc::now() - rule.window;

        for violation in &evaluation.violations {
            let already_open = self.store.has_open_alert_since(
                analysis.document_id,
                violation.pattern_id,
                violation.severity,
                window_start,
            )?;
            if already_open {
                continue;
            }

            let evidence = json!({
                "analysis_id": analysis.id,
                "rule_id": rule.id,
                "finding_count": violation.finding_count,
                "categories": violation.categories,
                "missing_coverage": evaluation.missing_coverage,
            });
            let alert = self.store.open_alert(
                analysis.document_id,
                violation.pattern_id,
                rule.jurisdiction,
                violation.severity,
                evidence,
            )?;
            self.events.publish(PlatformEvent::ComplianceAlertOpened {
                alert_id: alert.id,
                document_id: alert.document_id,
                jurisdiction: alert.jurisdiction,
                severity: alert.severity,
                opened_at: alert.detected_at,
            });
            report.alerts_opened.push(alert);
        }
        Ok(())
    }

    /// Advance the sliding trend counters. Counter failures degrade: trends
    /// are advisory and never fail the job.
    async fn bump_trends(
        &self,
        rule: &JurisdictionRule,
        analysis: &Analysis,
        findings: &[Finding],
        evaluation: &RuleEvaluation,
        document_type: &str,
    ) {
        let now = Utc::now();
        for window in TrendWindow::ALL {
            let bucket = window.bucket_start(now).timestamp();
            let prefix = format!(
                "trend:{}:{}:{}:{}",
                window.as_str(),
                bucket,
                document_type,
                rule.jurisdiction
            );
            let ttl = StdDuration::from_secs(window.length().num_seconds() as u64);

            let mut steps: Vec<(String, i64)> = vec![(format!("{prefix}:total_analyses"), 1)];
            for finding in findings {
                steps.push((format!("{prefix}:findings:{}", finding.severity), 1));
            }
            if let Some(score) = analysis.overall_risk_score {
                // Average risk is derived downstream from sum and count.
                steps.push((format!("{prefix}:risk_score_sum"), score as i64));
                steps.push((format!("{prefix}:risk_score_count"), 1));
            }
            if !evaluation.violations.is_empty() {
                steps.push((
                    format!("{prefix}:violations"),
                    evaluation.violations.len() as i64,
                ));
            }

            for (key, amount) in steps {
                if let Err(e) = self.cache.incr_by(&key, amount, ttl).await {
                    log::warn!("trend counter {key} skipped: {e}");
                }
            }
        }
    }
}

// ─── Rule evaluation ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RuleEvaluation {
    missing_coverage: Vec<String>,
    violations: Vec<Violation>,
}

#[derive(Debug)]
struct Violation {
    pattern_id: Option<Uuid>,
    severity: Severity,
    finding_count: usize,
    categories: Vec<String>,
}

fn evaluate_rule(rule: &JurisdictionRule, findings: &[Finding]) -> RuleEvaluation {
    use std::collections::BTreeMap;

    let covered: std::collections::HashSet<&str> =
        findings.iter().map(|f| f.category.as_str()).collect();
    let missing_coverage = rule
        .required_category_coverage
        .iter()
        .filter(|c| !covered.contains(c.as_str()))
        .cloned()
        .collect();

    // A finding violates when its pattern is forbidden or its severity
    // reaches the floor. One violation per distinct (pattern, severity).
    let mut grouped: BTreeMap<(Option<Uuid>, Severity), (usize, Vec<String>)> = BTreeMap::new();
    for finding in findings {
        let forbidden = finding
            .pattern_id
            .map(|p| rule.forbidden_patterns.contains(&p))
            .unwrap_or(false);
        if !forbidden && finding.severity < rule.severity_floor {
            continue;
        }
        let entry = grouped
            .entry((finding.pattern_id, finding.severity))
            .or_default();
        entry.0 += 1;
        if !entry.1.contains(&finding.category) {
            entry.1.push(finding.category.clone());
        }
    }

    RuleEvaluation {
        missing_coverage,
        violations: grouped
            .into_iter()
            .map(|((pattern_id, severity), (count, categories))| Violation {
                pattern_id,
                severity,
                finding_count: count,
                categories,
            })
            .collect(),
    }
}
