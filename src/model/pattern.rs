//! Versioned pattern rules describing concerning clause shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::Severity;

/// Regulatory regime a rule is relevant to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Jurisdiction {
    #[serde(rename = "GDPR")]
    Gdpr,
    #[serde(rename = "CCPA")]
    Ccpa,
    #[serde(rename = "COPPA")]
    Coppa,
    #[serde(rename = "PIPEDA")]
    Pipeda,
    #[serde(rename = "LGPD")]
    Lgpd,
    #[serde(rename = "PDPA")]
    Pdpa,
}

impl Jurisdiction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Jurisdiction::Gdpr => "GDPR",
            Jurisdiction::Ccpa => "CCPA",
            Jurisdiction::Coppa => "COPPA",
            Jurisdiction::Pipeda => "PIPEDA",
            Jurisdiction::Lgpd => "LGPD",
            Jurisdiction::Pdpa => "PDPA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GDPR" => Some(Jurisdiction::Gdpr),
            "CCPA" => Some(Jurisdiction::Ccpa),
            "COPPA" => Some(Jurisdiction::Coppa),
            "PIPEDA" => Some(Jurisdiction::Pipeda),
            "LGPD" => Some(Jurisdiction::Lgpd),
            "PDPA" => Some(Jurisdiction::Pdpa),
            _ => None,
        }
    }
}

impl std::fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned clause-pattern definition.
///
/// Rules are never mutated in place: an update inserts a new `(name,
/// version)` row and deactivates the old one, so historical findings keep a
/// resolvable reference. The matcher only loads `active` rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub id: Uuid,
    pub category: String,
    pub name: String,
    pub severity: Severity,
    pub description: String,
    pub legal_basis: Option<String>,
    /// Case-insensitive phrases; any hit produces a candidate finding.
    pub keywords: Vec<String>,
    /// Optional regex applied to the normalized text.
    pub regex: Option<String>,
    /// Reference into the vector index's `patterns` collection.
    pub embedding_id: Option<Uuid>,
    pub jurisdictions: Vec<Jurisdiction>,
    pub active: bool,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl PatternRule {
    /// New first-version rule with generated id.
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            name: name.into(),
            severity,
            description: description.into(),
            legal_basis: None,
            keywords: Vec::new(),
            regex: None,
            embedding_id: None,
            jurisdictions: Vec::new(),
            active: true,
            version: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex = Some(regex.into());
        self
    }

    pub fn with_legal_basis(mut self, basis: impl Into<String>) -> Self {
        self.legal_basis = Some(basis.into());
        self
    }

    pub fn with_jurisdictions(mut self, jurisdictions: Vec<Jurisdiction>) -> Self {
        self.jurisdictions = jurisdictions;
        self
    }
}

/// Built-in rule library seeded on first run.
///
/// Mirrors the categories the platform ships with; deployments extend the
/// set from YAML via [`crate::store::MetadataStore::upsert_pattern_rule`].
pub fn builtin_rules() -> Vec<PatternRule> {
    use Jurisdiction::*;

    vec![
        PatternRule::new(
            "data_collection",
            "Broad Data Collection",
            Severity::High,
            "The provider reserves the right to collect arbitrary information supplied by the user.",
        )
        .with_keywords(["collect any information", "all information you submit"])
        .with_regex(r"(?i)collect\s+(?:any|all)\s+(?:personal\s+)?information")
        .with_legal_basis("GDPR Art. 5(1)(c) data minimisation")
        .with_jurisdictions(vec![Gdpr, Ccpa, Lgpd]),

        PatternRule::new(
            "data_sharing",
            "Third-Party Disclosure",
            Severity::High,
            "Personal data may be shared with or sold to third parties without granular consent.",
        )
        .with_keywords(["share your information", "sell your information", "disclose to third parties"])
        .with_regex(r"(?i)(?:share|sell|disclose)[^.]{0,60}(?:third|3rd)[- ]part")
        .with_legal_basis("CCPA §1798.115")
        .with_jurisdictions(vec![Gdpr, Ccpa]),

        PatternRule::new(
            "user_rights",
            "Class Action Waiver",
            Severity::Critical,
            "The user waives the right to participate in class or collective actions.",
        )
        .with_keywords(["class action", "collective action", "waive the right"])
        .with_regex(r"(?i)waiv\w+[^.]{0,80}class\s+action")
        .with_legal_basis("Unfair contract terms directives")
        .with_jurisdictions(vec![Gdpr, Ccpa, Pipeda]),

        PatternRule::new(
            "liability",
            "Total Liability Exclusion",
            Severity::High,
            "The provider disclaims all liability, including for its own negligence.",
        )
        .with_keywords(["not be liable", "no liability", "disclaim all liability"])
        .with_regex(r"(?i)(?:shall|will)\s+not\s+be\s+liable")
        .with_jurisdictions(vec![Gdpr, Pipeda]),

        PatternRule::new(
            "content_rights",
            "Perpetual Content License",
            Severity::Medium,
            "User content is licensed to the provider perpetually and irrevocably.",
        )
        .with_keywords(["perpetual license", "irrevocable license", "royalty-free license"])
        .with_regex(r"(?i)(?:perpetual|irrevocable)[^.]{0,40}licen[sc]e")
        .with_jurisdictions(vec![Gdpr, Ccpa]),

        PatternRule::new(
            "dispute_resolution",
            "Mandatory Arbitration",
            Severity::High,
            "Disputes must be resolved through binding arbitration rather than the courts.",
        )
        .with_keywords(["binding arbitration", "mandatory arbitration"])
        .with_regex(r"(?i)(?:binding|mandatory)\s+arbitration")
        .with_jurisdictions(vec![Ccpa, Pipeda]),
    ]
}
