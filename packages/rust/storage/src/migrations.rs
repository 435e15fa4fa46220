//! SQL migration definitions for the Curricula database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: curricula, competencies, jobs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Verified curriculum artifacts (the vault)
CREATE TABLE IF NOT EXISTS curricula (
    id                     TEXT PRIMARY KEY,
    country                TEXT NOT NULL,
    country_code           TEXT NOT NULL,
    jurisdiction_level     TEXT NOT NULL,
    jurisdiction_name      TEXT,
    parent_jurisdiction_id TEXT,
    jurisdiction_key       TEXT NOT NULL,
    grade                  TEXT NOT NULL,
    subject                TEXT NOT NULL,
    status                 TEXT NOT NULL,
    confidence_score       REAL NOT NULL,
    last_verified          TEXT NOT NULL,
    ttl_expiry             TEXT NOT NULL,
    source_url             TEXT NOT NULL,
    checksum               TEXT NOT NULL,
    version                INTEGER NOT NULL,
    UNIQUE(country_code, jurisdiction_key, grade, subject)
);

CREATE INDEX IF NOT EXISTS idx_curricula_lookup
    ON curricula(country_code, grade, subject);

-- Competencies belonging to a stored replica
CREATE TABLE IF NOT EXISTS competencies (
    id            TEXT PRIMARY KEY,
    curriculum_id TEXT NOT NULL REFERENCES curricula(id) ON DELETE CASCADE,
    position      INTEGER NOT NULL,
    body_json     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_competencies_curriculum ON competencies(curriculum_id);

-- Orchestrator jobs, including suspended ones
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    job_key      TEXT,
    state        TEXT NOT NULL,
    in_flight    INTEGER NOT NULL DEFAULT 0,
    resume_token TEXT,
    body_json    TEXT NOT NULL,
    last_error   TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- At most one in-flight cold start per key
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_inflight_key
    ON jobs(job_key) WHERE in_flight = 1 AND job_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Router and review state: cost_ledger, stage_floors, shadow_runs, alerts",
            sql: r#"
-- Monthly spend per stage
CREATE TABLE IF NOT EXISTS cost_ledger (
    month     TEXT NOT NULL,
    stage     TEXT NOT NULL,
    spent_usd REAL NOT NULL DEFAULT 0,
    PRIMARY KEY(month, stage)
);

-- Permanent minimum tier per stage
CREATE TABLE IF NOT EXISTS stage_floors (
    stage      TEXT PRIMARY KEY,
    tier       INTEGER NOT NULL,
    reason     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Offline review log of shadow comparisons
CREATE TABLE IF NOT EXISTS shadow_runs (
    id                    TEXT PRIMARY KEY,
    job_id                TEXT NOT NULL,
    stage                 TEXT NOT NULL,
    primary_model         TEXT NOT NULL,
    shadow_model          TEXT NOT NULL,
    topic_overlap         REAL NOT NULL,
    structural_similarity REAL NOT NULL,
    drift                 REAL NOT NULL,
    escalated             INTEGER NOT NULL,
    created_at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_shadow_runs_stage ON shadow_runs(stage);

-- Human alerts awaiting a decision
CREATE TABLE IF NOT EXISTS alerts (
    job_id             TEXT PRIMARY KEY,
    reason             TEXT NOT NULL,
    recommended_action TEXT NOT NULL,
    class              TEXT NOT NULL,
    raised_at          TEXT NOT NULL,
    resolved_at        TEXT
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
