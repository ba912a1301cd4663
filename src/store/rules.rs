//! Pattern rule library persistence.

use chrono::Utc;
use rusqlite::{named_params, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{builtin_rules, Jurisdiction, PatternRule, Severity};

use super::{from_json, parse_opt_uuid, parse_ts, parse_uuid, to_json, ts, MetadataStore};

const RULE_COLS: &str = "id, category, name, severity, description, legal_basis, keywords, \
     regex, embedding_id, jurisdictions, active, version, created_at";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RawRule> {
    Ok(RawRule {
        id: row.get(0)?,
        category: row.get(1)?,
        name: row.get(2)?,
        severity: row.get(3)?,
        description: row.get(4)?,
        legal_basis: row.get(5)?,
        keywords: row.get(6)?,
        regex: row.get(7)?,
        embedding_id: row.get(8)?,
        jurisdictions: row.get(9)?,
        active: row.get(10)?,
        version: row.get(11)?,
        created_at: row.get(12)?,
    })
}

struct RawRule {
    id: String,
    category: String,
    name: String,
    severity: String,
    description: String,
    legal_basis: Option<String>,
    keywords: String,
    regex: Option<String>,
    embedding_id: Option<String>,
    jurisdictions: String,
    active: bool,
    version: i64,
    created_at: String,
}

impl RawRule {
    fn into_rule(self) -> Result<PatternRule> {
        let jurisdictions: Vec<String> = from_json(&self.jurisdictions)?;
        Ok(PatternRule {
            id: parse_uuid(&self.id)?,
            category: self.category,
            name: self.name,
            severity: Severity::parse(&self.severity)
                .ok_or_else(|| Error::Storage(format!("bad severity {:?}", self.severity)))?,
            description: self.description,
            legal_basis: self.legal_basis,
            keywords: from_json(&self.keywords)?,
            regex: self.regex,
            embedding_id: parse_opt_uuid(self.embedding_id)?,
            jurisdictions: jurisdictions
                .iter()
                .filter_map(|j| Jurisdiction::parse(j))
                .collect(),
            active: self.active,
            version: self.version as u32,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl MetadataStore {
    /// Insert a rule as given (id, version, and activity preserved).
    pub fn insert_pattern_rule(&self, rule: &PatternRule) -> Result<()> {
        let jurisdictions: Vec<&str> = rule.jurisdictions.iter().map(|j| j.as_str()).collect();
        self.conn().execute(
            "INSERT INTO pattern_rules (id, category, name, severity, description, legal_basis, \
             keywords, regex, embedding_id, jurisdictions, active, version, created_at) \
             VALUES (:id, :category, :name, :severity, :description, :basis, :keywords, :regex, \
             :embedding, :jurisdictions, :active, :version, :created)",
            named_params! {
                ":id": rule.id.to_string(),
                ":category": rule.category,
                ":name": rule.name,
                ":severity": rule.severity.as_str(),
                ":description": rule.description,
                ":basis": rule.legal_basis,
                ":keywords": to_json(&rule.keywords)?,
                ":regex": rule.regex,
                ":embedding": rule.embedding_id.map(|e| e.to_string()),
                ":jurisdictions": to_json(&jurisdictions)?,
                ":active": rule.active,
                ":version": rule.version as i64,
                ":created": ts(rule.created_at),
            },
        )?;
        Ok(())
    }

    /// Publish a new version of a rule: deactivates the current active
    /// version of the same name and inserts the replacement at `max + 1`,
    /// in one transaction. Returns the stored rule.
    pub fn upsert_pattern_rule(&self, mut rule: PatternRule) -> Result<PatternRule> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(Error::from)?;

        let current_max: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM pattern_rules WHERE name = :name",
                named_params! { ":name": rule.name },
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;

        tx.execute(
            "UPDATE pattern_rules SET active = 0 WHERE name = :name AND active = 1",
            named_params! { ":name": rule.name },
        )?;

        rule.id = Uuid::new_v4();
        rule.version = (current_max.unwrap_or(0) + 1) as u32;
        rule.active = true;
        rule.created_at = Utc::now();

        let jurisdictions: Vec<&str> = rule.jurisdictions.iter().map(|j| j.as_str()).collect();
        tx.execute(
            "INSERT INTO pattern_rules (id, category, name, severity, description, legal_basis, \
             keywords, regex, embedding_id, jurisdictions, active, version, created_at) \
             VALUES (:id, :category, :name, :severity, :description, :basis, :keywords, :regex, \
             :embedding, :jurisdictions, 1, :version, :created)",
            named_params! {
                ":id": rule.id.to_string(),
                ":category": rule.category,
                ":name": rule.name,
                ":severity": rule.severity.as_str(),
                ":description": rule.description,
                ":basis": rule.legal_basis,
                ":keywords": to_json(&rule.keywords)?,
                ":regex": rule.regex,
                ":embedding": rule.embedding_id.map(|e| e.to_string()),
                ":jurisdictions": to_json(&jurisdictions)?,
                ":version": rule.version as i64,
                ":created": ts(rule.created_at),
            },
        )?;
        tx.commit()?;
        Ok(rule)
    }

    pub fn get_pattern_rule(&self, id: Uuid) -> Result<PatternRule> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {RULE_COLS} FROM pattern_rules WHERE id = :id"))?;
        let raw = stmt
            .query_row(named_params! { ":id": id.to_string() }, rule_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("pattern rule {id}")),
                other => other.into(),
            })?;
        raw.into_rule()
    }

    /// All active rule versions, the set the matcher works from.
    pub fn active_pattern_rules(&self) -> Result<Vec<PatternRule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLS} FROM pattern_rules WHERE active = 1 ORDER BY name"
        ))?;
        let rows = stmt.query_map([], rule_from_row)?;
        rows.map(|r| r.map_err(Error::from).and_then(RawRule::into_rule))
            .collect()
    }

    /// Seed the built-in library on an empty table. Returns how many rules
    /// were inserted.
    pub fn seed_builtin_rules(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM pattern_rules", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(0);
        }
        let rules = builtin_rules();
        for rule in &rules {
            self.insert_pattern_rule(rule)?;
        }
        log::info!("seeded {} built-in pattern rules", rules.len());
        Ok(rules.len())
    }

    /// Rules loaded from a YAML library file, published as new versions.
    pub fn load_rules_from_yaml(&self, yaml: &str) -> Result<usize> {
        let rules: Vec<PatternRule> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Serialization(format!("rule library: {e}")))?;
        let count = rules.len();
        for rule in rules {
            self.upsert_pattern_rule(rule)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_idempotent() {
        let store = MetadataStore::open_in_memory().unwrap();
        let first = store.seed_builtin_rules().unwrap();
        assert!(first > 0);
        assert_eq!(store.seed_builtin_rules().unwrap(), 0);
        assert_eq!(store.active_pattern_rules().unwrap().len(), first);
    }

    #[test]
    fn upsert_versions_and_keeps_history_resolvable() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.seed_builtin_rules().unwrap();

        let old = store
            .active_pattern_rules()
            .unwrap()
            .into_iter()
            .find(|r| r.name == "Broad Data Collection")
            .unwrap();

        let mut updated = old.clone();
        updated.description = "Tightened description".into();
        let new = store.upsert_pattern_rule(updated).unwrap();

        assert_eq!(new.version, old.version + 1);
        assert_ne!(new.id, old.id);

        // Old version is deactivated but still resolvable by id.
        let old_again = store.get_pattern_rule(old.id).unwrap();
        assert!(!old_again.active);

        let active: Vec<_> = store
            .active_pattern_rules()
            .unwrap()
            .into_iter()
            .filter(|r| r.name == "Broad Data Collection")
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, new.version);
    }
}
