#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use memory_evidence_core::{
    format_rfc3339, now_utc, tags_in_query, tokenize, MemoryHit, MemoryRecord, TagHit,
};
use rusqlite::{params, params_from_iter, Connection};

const INDEX_MIGRATION_VERSION: i64 = 1;

const SCHEMA_MEMORY_INDEX_V1: &str = r"
CREATE TABLE IF NOT EXISTS memories (
  memory_id TEXT PRIMARY KEY,
  task_id TEXT NOT NULL,
  feature TEXT,
  agent_role TEXT,
  engine_version TEXT,
  outcome TEXT,
  confidence REAL,
  confidence_calibrated REAL,
  root_cause TEXT,
  fix_summary TEXT,
  repair_strategy TEXT,
  notes TEXT,
  files_touched_json TEXT,
  assumptions_json TEXT,
  prevention_updates_json TEXT,
  raw_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_failure_tags (
  memory_id TEXT NOT NULL,
  failure_tag TEXT NOT NULL,
  PRIMARY KEY (memory_id, failure_tag),
  FOREIGN KEY (memory_id) REFERENCES memories(memory_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS memory_contract_ids (
  memory_id TEXT NOT NULL,
  contract_id TEXT NOT NULL,
  PRIMARY KEY (memory_id, contract_id),
  FOREIGN KEY (memory_id) REFERENCES memories(memory_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS memory_pattern_ids (
  memory_id TEXT NOT NULL,
  pattern_id TEXT NOT NULL,
  PRIMARY KEY (memory_id, pattern_id),
  FOREIGN KEY (memory_id) REFERENCES memories(memory_id) ON DELETE CASCADE
);

CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
  memory_id UNINDEXED,
  task_id,
  feature,
  expected_behavior,
  actual_behavior,
  fix_summary,
  notes,
  assumptions,
  prevention_updates
);

CREATE INDEX IF NOT EXISTS idx_memories_task_id ON memories(task_id);
CREATE INDEX IF NOT EXISTS idx_memories_outcome ON memories(outcome);
CREATE INDEX IF NOT EXISTS idx_failure_tag ON memory_failure_tags(failure_tag);
CREATE INDEX IF NOT EXISTS idx_contract_id ON memory_contract_ids(contract_id);
CREATE INDEX IF NOT EXISTS idx_pattern_id ON memory_pattern_ids(pattern_id);
";

/// Explicit handle over the persistent memory index. One handle is opened per
/// invocation, schema is ensured, and the connection closes on drop on every
/// exit path. The log file remains the sole source of truth; this store only
/// holds derived structures.
pub struct SqliteMemoryIndex {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RebuildReport {
    pub records_indexed: usize,
    pub tag_associations: usize,
}

impl SqliteMemoryIndex {
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

    /// Idempotently creates the relational tables, the three association
    /// tables, the FTS5 structure, and the supporting lookup indexes. Safe to
    /// call on an existing store.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_MEMORY_INDEX_V1)
            .context("failed to apply memory index schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![INDEX_MIGRATION_VERSION, now],
            )
            .context("failed to register memory index migration")?;

        Ok(())
    }

    /// Replaces all derived state with a projection of `records`, as one
    /// all-or-nothing transaction: a failure partway leaves the store exactly
    /// as it was before the call. A concurrent reader sees fully-old or
    /// fully-new content, never an interleaved mix.
    pub fn rebuild(&mut self, records: &[MemoryRecord]) -> Result<RebuildReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start rebuild transaction")?;

        for table in [
            "memory_failure_tags",
            "memory_contract_ids",
            "memory_pattern_ids",
            "memory_fts",
            "memories",
        ] {
            tx.execute(&format!("DELETE FROM {table}"), [])
                .with_context(|| format!("failed to clear {table}"))?;
        }

        for record in records {
            insert_record(&tx, record)?;
        }

        let records_indexed = count_rows(&tx, "memories")?;
        let tag_associations = count_rows(&tx, "memory_failure_tags")?;

        tx.commit().context("failed to commit rebuild transaction")?;

        Ok(RebuildReport {
            records_indexed,
            tag_associations,
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count_memories()? == 0)
    }

    pub fn count_memories(&self) -> Result<usize> {
        count_rows(&self.conn, "memories")
    }

    pub fn count_tag_associations(&self) -> Result<usize> {
        count_rows(&self.conn, "memory_failure_tags")
    }

    /// Ranked full-text search: every query token becomes a prefix term,
    /// combined with OR, scored by `bm25(memory_fts)` where lower is better.
    /// An empty token sequence returns no hits without touching the index.
    pub fn search_memories(&self, query: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let match_expr = tokens
            .iter()
            .map(|token| format!("{token}*"))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut stmt = self.conn.prepare(
            "SELECT m.memory_id, m.task_id, m.feature, m.outcome, m.confidence, m.fix_summary,
                    bm25(memory_fts) AS score
             FROM memory_fts
             JOIN memories m ON m.memory_id = memory_fts.memory_id
             WHERE memory_fts MATCH ?1
             ORDER BY score ASC
             LIMIT ?2",
        )?;

        let limit = i64::try_from(top_k).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![match_expr, limit], |row| {
            Ok(MemoryHit {
                memory_id: row.get(0)?,
                task_id: row.get(1)?,
                feature: row.get(2)?,
                outcome: row.get(3)?,
                confidence: row.get(4)?,
                fix_summary: row.get(5)?,
                score: row.get(6)?,
            })
        })?;

        collect_rows(rows)
    }

    /// Exact-match lookup over the failure-tag association table. Only
    /// vocabulary tags named in the query activate the lookup; rows come back
    /// most-recently-indexed first (memory_id descending), capped at `top_k`.
    pub fn search_tags(&self, query: &str, top_k: usize) -> Result<Vec<TagHit>> {
        let requested = tags_in_query(query);
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=requested.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT m.memory_id, m.task_id, m.feature, t.failure_tag
             FROM memory_failure_tags t
             JOIN memories m ON m.memory_id = t.memory_id
             WHERE t.failure_tag IN ({placeholders})
             ORDER BY m.memory_id DESC
             LIMIT "
        );
        sql.push_str(&top_k.to_string());

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(requested.iter()), |row| {
            Ok(TagHit {
                memory_id: row.get(0)?,
                task_id: row.get(1)?,
                feature: row.get(2)?,
                failure_tag: row.get(3)?,
            })
        })?;

        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn insert_record(conn: &Connection, record: &MemoryRecord) -> Result<()> {
    // Later duplicates win: replace the primary row and drop derived rows an
    // earlier occurrence of the same id left behind.
    conn.execute(
        "DELETE FROM memory_fts WHERE memory_id = ?1",
        params![record.memory_id],
    )
    .context("failed to clear stale full-text row")?;
    for table in [
        "memory_failure_tags",
        "memory_contract_ids",
        "memory_pattern_ids",
    ] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE memory_id = ?1"),
            params![record.memory_id],
        )
        .with_context(|| format!("failed to clear stale {table} rows"))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO memories (
            memory_id, task_id, feature, agent_role, engine_version,
            outcome, confidence, confidence_calibrated, root_cause,
            fix_summary, repair_strategy, notes,
            files_touched_json, assumptions_json, prevention_updates_json, raw_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            record.memory_id,
            record.task_id,
            record.feature,
            record.agent_role,
            record.engine_version,
            record.outcome,
            record.confidence,
            record.confidence_calibrated,
            record.root_cause,
            record.fix_summary,
            record.repair_strategy,
            record.notes,
            serde_json::to_string(&record.files_touched)
                .context("failed to serialize files_touched")?,
            serde_json::to_string(&record.assumptions)
                .context("failed to serialize assumptions")?,
            serde_json::to_string(&record.prevention_updates)
                .context("failed to serialize prevention_updates")?,
            serde_json::to_string(&record.raw).context("failed to serialize raw record")?,
        ],
    )
    .with_context(|| format!("failed to insert memory {}", record.memory_id))?;

    conn.execute(
        "INSERT INTO memory_fts (
            memory_id, task_id, feature, expected_behavior, actual_behavior,
            fix_summary, notes, assumptions, prevention_updates
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.memory_id,
            record.task_id,
            record.feature,
            record.expected_behavior,
            record.actual_behavior,
            record.fix_summary,
            record.notes,
            record.assumptions_text(),
            record.prevention_updates_text(),
        ],
    )
    .with_context(|| format!("failed to index full text for {}", record.memory_id))?;

    for tag in &record.failure_tags {
        conn.execute(
            "INSERT OR IGNORE INTO memory_failure_tags (memory_id, failure_tag) VALUES (?1, ?2)",
            params![record.memory_id, tag],
        )
        .context("failed to insert failure tag association")?;
    }

    for contract_id in &record.contract_ids_touched {
        conn.execute(
            "INSERT OR IGNORE INTO memory_contract_ids (memory_id, contract_id) VALUES (?1, ?2)",
            params![record.memory_id, contract_id],
        )
        .context("failed to insert contract association")?;
    }

    for pattern_id in &record.pattern_ids_used {
        conn.execute(
            "INSERT OR IGNORE INTO memory_pattern_ids (memory_id, pattern_id) VALUES (?1, ?2)",
            params![record.memory_id, pattern_id],
        )
        .context("failed to insert pattern association")?;
    }

    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to count {table} rows"))?;

    usize::try_from(count).with_context(|| format!("invalid {table} row count: {count}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
