//! SQL migration definitions for the curator database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

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
            description: "Initial schema: runs, run_checkpoints, weekly_items, anomaly_baseline",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per orchestrator run; run_json holds the full record
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    mode         TEXT NOT NULL,
    status       TEXT NOT NULL,
    week_id      TEXT,
    resumed_from TEXT,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    run_json     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_mode_started ON runs(mode, started_at);

-- Item set persisted after each successful phase
CREATE TABLE IF NOT EXISTS run_checkpoints (
    run_id     TEXT NOT NULL,
    phase      TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    items_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (run_id, phase)
);

-- Tier-2 admitted items accumulated per ISO week and calendar day
CREATE TABLE IF NOT EXISTS weekly_items (
    week_id      TEXT NOT NULL,
    day          TEXT NOT NULL,
    item_id      TEXT NOT NULL,
    item_json    TEXT NOT NULL,
    collected_at TEXT NOT NULL,
    UNIQUE(week_id, day, item_id)
);

CREATE INDEX IF NOT EXISTS idx_weekly_items_week ON weekly_items(week_id);

-- Rolling per-phase metric statistics (Welford accumulators)
CREATE TABLE IF NOT EXISTS anomaly_baseline (
    phase      TEXT NOT NULL,
    metric     TEXT NOT NULL,
    count      INTEGER NOT NULL,
    mean       REAL NOT NULL,
    m2         REAL NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (phase, metric)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Completion cache for text-generation calls",
            sql: r#"
CREATE TABLE IF NOT EXISTS completion_cache (
    id            TEXT PRIMARY KEY,
    schema_name   TEXT NOT NULL,
    prompt_hash   TEXT NOT NULL,
    model_id      TEXT NOT NULL,
    response_text TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE(schema_name, prompt_hash, model_id)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
