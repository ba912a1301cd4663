//! Table layout.
//!
//! Singular primary keys, `ON DELETE CASCADE` for ownership cascades,
//! `ON DELETE RESTRICT` where history must keep its reference
//! (findings → pattern rules). Timestamps are RFC 3339 text; list and
//! object columns are JSON text.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id                       TEXT PRIMARY KEY,
    owner_id                 TEXT NOT NULL,
    team_id                  TEXT,
    title                    TEXT NOT NULL,
    source_url               TEXT,
    document_type            TEXT NOT NULL,
    content_fingerprint      TEXT NOT NULL,
    content_length           INTEGER NOT NULL CHECK (content_length >= 0),
    language                 TEXT NOT NULL,
    monitoring_enabled       INTEGER NOT NULL DEFAULT 0,
    monitor_interval_seconds INTEGER,
    last_monitored_at        TEXT,
    next_monitor_at          TEXT,
    row_version              INTEGER NOT NULL DEFAULT 0,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL,
    deleted_at               TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_live_fingerprint
    ON documents(owner_id, content_fingerprint) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id);
CREATE INDEX IF NOT EXISTS idx_documents_monitor_due
    ON documents(monitoring_enabled, next_monitor_at) WHERE monitoring_enabled = 1;

CREATE TABLE IF NOT EXISTS document_versions (
    id                  TEXT PRIMARY KEY,
    document_id         TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    version_seq         INTEGER NOT NULL CHECK (version_seq >= 1),
    fingerprint         TEXT NOT NULL,
    content_length      INTEGER NOT NULL CHECK (content_length >= 0),
    captured_at         TEXT NOT NULL,
    change_kind         TEXT NOT NULL,
    change_summary      TEXT NOT NULL,
    significant_changes TEXT NOT NULL,
    risk_delta          INTEGER NOT NULL DEFAULT 0,
    paragraph_digest    TEXT NOT NULL,
    section_count       INTEGER NOT NULL DEFAULT 0,
    UNIQUE (document_id, version_seq)
);

CREATE INDEX IF NOT EXISTS idx_versions_document ON document_versions(document_id);

CREATE TABLE IF NOT EXISTS pattern_rules (
    id            TEXT PRIMARY KEY,
    category      TEXT NOT NULL,
    name          TEXT NOT NULL,
    severity      TEXT NOT NULL,
    description   TEXT NOT NULL,
    legal_basis   TEXT,
    keywords      TEXT NOT NULL,
    regex         TEXT,
    embedding_id  TEXT,
    jurisdictions TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    version       INTEGER NOT NULL CHECK (version >= 1),
    created_at    TEXT NOT NULL,
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS analyses (
    id                  TEXT PRIMARY KEY,
    document_id         TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    document_version_id TEXT NOT NULL REFERENCES document_versions(id) ON DELETE CASCADE,
    owner_id            TEXT NOT NULL,
    status              TEXT NOT NULL,
    overall_risk_score  INTEGER CHECK (overall_risk_score BETWEEN 0 AND 100),
    model_id            TEXT,
    model_version       TEXT,
    processing_ms       INTEGER,
    executive_summary   TEXT,
    key_findings        TEXT NOT NULL DEFAULT '[]',
    recommendations     TEXT NOT NULL DEFAULT '[]',
    error_kind          TEXT,
    started_at          TEXT,
    completed_at        TEXT,
    expires_at          TEXT,
    created_at          TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_analyses_one_active
    ON analyses(document_version_id) WHERE status IN ('pending', 'processing');
CREATE INDEX IF NOT EXISTS idx_analyses_document ON analyses(document_id);
CREATE INDEX IF NOT EXISTS idx_analyses_expiry ON analyses(expires_at);

CREATE TABLE IF NOT EXISTS findings (
    id             TEXT PRIMARY KEY,
    analysis_id    TEXT NOT NULL REFERENCES analyses(id) ON DELETE CASCADE,
    category       TEXT NOT NULL,
    title          TEXT NOT NULL,
    description    TEXT NOT NULL,
    severity       TEXT NOT NULL,
    confidence     REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
    pattern_id     TEXT REFERENCES pattern_rules(id) ON DELETE RESTRICT,
    excerpt        TEXT NOT NULL,
    position_start INTEGER NOT NULL CHECK (position_start >= 0),
    position_end   INTEGER NOT NULL,
    recommendation TEXT,
    impact         TEXT,
    CHECK (position_start < position_end)
);

CREATE INDEX IF NOT EXISTS idx_findings_analysis ON findings(analysis_id);
CREATE INDEX IF NOT EXISTS idx_findings_pattern ON findings(pattern_id);

CREATE TABLE IF NOT EXISTS compliance_alerts (
    id           TEXT PRIMARY KEY,
    document_id  TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    pattern_id   TEXT,
    jurisdiction TEXT NOT NULL,
    severity     TEXT NOT NULL,
    detected_at  TEXT NOT NULL,
    status       TEXT NOT NULL,
    evidence     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_document ON compliance_alerts(document_id, status);

CREATE TABLE IF NOT EXISTS compliance_markers (
    analysis_id TEXT NOT NULL,
    rule_id     TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (analysis_id, rule_id)
);

CREATE TABLE IF NOT EXISTS monitor_jobs (
    id              TEXT PRIMARY KEY,
    document_id     TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    scheduled_at    TEXT NOT NULL,
    dispatched_at   TEXT,
    completed_at    TEXT,
    state           TEXT NOT NULL,
    attempt         INTEGER NOT NULL DEFAULT 0,
    last_error_kind TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_monitor_jobs_one_active
    ON monitor_jobs(document_id) WHERE state IN ('scheduled', 'running');

CREATE TABLE IF NOT EXISTS audit_records (
    id             TEXT PRIMARY KEY,
    actor          TEXT,
    action         TEXT NOT NULL,
    resource_type  TEXT NOT NULL,
    resource_id    TEXT NOT NULL,
    before_state   TEXT,
    after_state    TEXT,
    correlation_id TEXT,
    anonymized     INTEGER NOT NULL DEFAULT 0,
    at             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_resource
    ON audit_records(resource_type, resource_id, at);
"#;
