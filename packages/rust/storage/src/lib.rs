//! Embedded libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database for run records, per-phase
//! checkpoints, the weekly accumulation buckets, the anomaly baseline, and the
//! text-generation completion cache.
//!
//! **Access rules:**
//! - A pipeline run: read-write (sole writer) via [`Storage::open`]
//! - Inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{NaiveDate, Utc};
use curator_shared::{CuratorError, Item, Result, Run, RunId, RunMode, WeekId};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A persisted item set for one phase of one run.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub phase: String,
    /// Position of the phase in its run's sequence.
    pub seq: u32,
    pub items: Vec<Item>,
}

/// One item accumulated into a weekly bucket.
#[derive(Debug, Clone)]
pub struct WeeklyEntry {
    pub day: NaiveDate,
    pub item: Item,
}

/// Rolling statistic for one (phase, metric) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineStat {
    pub phase: String,
    pub metric: String,
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations (Welford); variance = m2 / (count - 1).
    pub m2: f64,
}

impl BaselineStat {
    pub fn empty(phase: &str, metric: &str) -> Self {
        Self {
            phase: phase.to_string(),
            metric: metric.to_string(),
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Fold one observation in (incremental mean and variance).
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample variance, if at least two observations exist.
    pub fn variance(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }
}

fn storage_err(e: libsql::Error) -> CuratorError {
    CuratorError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> CuratorError {
    CuratorError::Storage(format!("invalid stored JSON: {e}"))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CuratorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CuratorError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CuratorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run records
    // -----------------------------------------------------------------------

    /// Insert or replace a run record.
    pub async fn save_run(&self, run: &Run) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(run).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO runs (id, mode, status, week_id, resumed_from, started_at, finished_at, run_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   finished_at = excluded.finished_at,
                   run_json = excluded.run_json",
                params![
                    run.id.to_string(),
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.week_id.as_ref().map(|w| w.to_string()),
                    run.resumed_from.as_ref().map(|r| r.to_string()),
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    json,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let mut rows = self
            .conn
            .query("SELECT run_json FROM runs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(storage_err)?;
                Ok(Some(serde_json::from_str(&json).map_err(json_err)?))
            }
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<Run>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_json FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json: String = row.get(0).map_err(storage_err)?;
            results.push(serde_json::from_str(&json).map_err(json_err)?);
        }
        Ok(results)
    }

    /// The most recent run of `mode` that did not complete successfully and
    /// that no later run has resumed.
    pub async fn latest_resumable_run(&self, mode: RunMode) -> Result<Option<Run>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_json FROM runs
                 WHERE mode = ?1 AND status != 'success'
                   AND id NOT IN (SELECT resumed_from FROM runs WHERE resumed_from IS NOT NULL)
                 ORDER BY started_at DESC LIMIT 1",
                params![mode.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(storage_err)?;
                Ok(Some(serde_json::from_str(&json).map_err(json_err)?))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Phase checkpoints
    // -----------------------------------------------------------------------

    /// Persist the item set produced by `phase` (upserts on run + phase).
    pub async fn write_checkpoint(
        &self,
        run_id: &RunId,
        phase: &str,
        seq: u32,
        items: &[Item],
    ) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(items).map_err(json_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO run_checkpoints (run_id, phase, seq, items_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id, phase) DO UPDATE SET
                   seq = excluded.seq,
                   items_json = excluded.items_json,
                   created_at = excluded.created_at",
                params![run_id.to_string(), phase, seq, json, now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// The checkpoint with the highest sequence number for a run.
    pub async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        let mut rows = self
            .conn
            .query(
                "SELECT phase, seq, items_json FROM run_checkpoints
                 WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let phase: String = row.get(0).map_err(storage_err)?;
                let seq: u32 = row.get(1).map_err(storage_err)?;
                let json: String = row.get(2).map_err(storage_err)?;
                Ok(Some(Checkpoint {
                    run_id: run_id.clone(),
                    phase,
                    seq,
                    items: serde_json::from_str(&json).map_err(json_err)?,
                }))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Weekly accumulation
    // -----------------------------------------------------------------------

    /// Append items to a week's bucket for `day`. Identifiers already present
    /// for that day are left untouched. Returns the number of new rows.
    pub async fn append_week_items(
        &self,
        week: &WeekId,
        day: NaiveDate,
        items: &[Item],
    ) -> Result<usize> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let day_str = day.to_string();
        let mut inserted = 0usize;

        for item in items {
            let json = serde_json::to_string(item).map_err(json_err)?;
            let changed = tx
                .execute(
                    "INSERT INTO weekly_items (week_id, day, item_id, item_json, collected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(week_id, day, item_id) DO NOTHING",
                    params![
                        week.as_str(),
                        day_str.as_str(),
                        item.id.as_str(),
                        json,
                        item.collected_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(storage_err)?;
            inserted += changed as usize;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    /// Every entry accumulated for a week, ordered by day then collection time.
    pub async fn load_week_items(&self, week: &WeekId) -> Result<Vec<WeeklyEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT day, item_json FROM weekly_items
                 WHERE week_id = ?1 ORDER BY day, collected_at, item_id",
                params![week.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let day: String = row.get(0).map_err(storage_err)?;
            let json: String = row.get(1).map_err(storage_err)?;
            entries.push(WeeklyEntry {
                day: day
                    .parse()
                    .map_err(|e| CuratorError::Storage(format!("invalid day '{day}': {e}")))?,
                item: serde_json::from_str(&json).map_err(json_err)?,
            });
        }
        Ok(entries)
    }

    /// Item count per day for a week.
    pub async fn week_day_counts(&self, week: &WeekId) -> Result<Vec<(NaiveDate, usize)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT day, COUNT(*) FROM weekly_items WHERE week_id = ?1 GROUP BY day ORDER BY day",
                params![week.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let day: String = row.get(0).map_err(storage_err)?;
            let count: i64 = row.get(1).map_err(storage_err)?;
            let day = day
                .parse()
                .map_err(|e| CuratorError::Storage(format!("invalid day '{day}': {e}")))?;
            counts.push((day, count as usize));
        }
        Ok(counts)
    }

    /// Delete all of a week's buckets. Returns the number of rows removed.
    pub async fn clear_week(&self, week: &WeekId) -> Result<usize> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM weekly_items WHERE week_id = ?1",
                params![week.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(removed as usize)
    }

    // -----------------------------------------------------------------------
    // Anomaly baseline
    // -----------------------------------------------------------------------

    /// All baseline statistics.
    pub async fn load_baseline(&self) -> Result<Vec<BaselineStat>> {
        let mut rows = self
            .conn
            .query(
                "SELECT phase, metric, count, mean, m2 FROM anomaly_baseline ORDER BY phase, metric",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            stats.push(BaselineStat {
                phase: row.get(0).map_err(storage_err)?,
                metric: row.get(1).map_err(storage_err)?,
                count: row.get::<i64>(2).map_err(storage_err)? as u64,
                mean: row.get(3).map_err(storage_err)?,
                m2: row.get(4).map_err(storage_err)?,
            });
        }
        Ok(stats)
    }

    /// Write updated baseline statistics in one transaction.
    pub async fn save_baseline(&self, stats: &[BaselineStat]) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();

        for stat in stats {
            tx.execute(
                "INSERT INTO anomaly_baseline (phase, metric, count, mean, m2, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(phase, metric) DO UPDATE SET
                   count = excluded.count,
                   mean = excluded.mean,
                   m2 = excluded.m2,
                   updated_at = excluded.updated_at",
                params![
                    stat.phase.as_str(),
                    stat.metric.as_str(),
                    stat.count as i64,
                    stat.mean,
                    stat.m2,
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion cache
    // -----------------------------------------------------------------------

    /// Get a cached completion.
    pub async fn get_completion_cache(
        &self,
        schema_name: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response_text FROM completion_cache
                 WHERE schema_name = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![schema_name, prompt_hash, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    /// Store a completion in the cache (upserts).
    pub async fn set_completion_cache(
        &self,
        schema_name: &str,
        prompt_hash: &str,
        model_id: &str,
        response_text: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO completion_cache (id, schema_name, prompt_hash, model_id, response_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(schema_name, prompt_hash, model_id) DO UPDATE SET
                   response_text = excluded.response_text,
                   created_at = excluded.created_at",
                params![id.as_str(), schema_name, prompt_hash, model_id, response_text, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_shared::{RawItem, RunStatus};

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn item(url: &str, title: &str) -> Item {
        Item::from_raw(
            RawItem {
                source_id: "wire".into(),
                title: title.into(),
                url: Some(url.into()),
                body: "body".into(),
                published_at: None,
            },
            1.0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn run_roundtrip_and_resumable_lookup() {
        let storage = test_storage().await;
        let mut run = Run::new(RunMode::Collect, None, Utc::now());
        storage.save_run(&run).await.expect("save running");

        let found = storage.get_run(&run.id).await.unwrap().expect("run exists");
        assert_eq!(found.status, RunStatus::Running);

        let resumable = storage.latest_resumable_run(RunMode::Collect).await.unwrap();
        assert_eq!(resumable.map(|r| r.id), Some(run.id.clone()));

        run.finish(RunStatus::Success, Utc::now());
        storage.save_run(&run).await.expect("save finished");
        assert!(storage.latest_resumable_run(RunMode::Collect).await.unwrap().is_none());
        assert_eq!(storage.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resumed_run_is_not_resumable_again() {
        let storage = test_storage().await;
        let t0 = Utc::now();
        let mut failed = Run::new(RunMode::Finalize, None, t0);
        failed.finish(RunStatus::Failed, t0);
        storage.save_run(&failed).await.unwrap();

        let mut retry = Run::new(RunMode::Finalize, None, t0 + chrono::Duration::seconds(1));
        retry.resumed_from = Some(failed.id.clone());
        storage.save_run(&retry).await.unwrap();

        // An unfinished resume is itself the next candidate.
        let next = storage.latest_resumable_run(RunMode::Finalize).await.unwrap();
        assert_eq!(next.map(|r| r.id), Some(retry.id.clone()));

        retry.finish(RunStatus::Success, t0 + chrono::Duration::seconds(2));
        storage.save_run(&retry).await.unwrap();
        assert!(storage.latest_resumable_run(RunMode::Finalize).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_latest_by_sequence() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        let items = vec![item("https://example.com/a", "A"), item("https://example.com/b", "B")];

        storage.write_checkpoint(&run_id, "collect", 0, &items).await.unwrap();
        storage.write_checkpoint(&run_id, "tier1_filter", 1, &items[..1]).await.unwrap();

        let cp = storage.latest_checkpoint(&run_id).await.unwrap().expect("checkpoint");
        assert_eq!(cp.phase, "tier1_filter");
        assert_eq!(cp.seq, 1);
        assert_eq!(cp.items.len(), 1);

        // Rewriting a phase replaces its row.
        storage.write_checkpoint(&run_id, "tier1_filter", 1, &[]).await.unwrap();
        let cp = storage.latest_checkpoint(&run_id).await.unwrap().expect("checkpoint");
        assert!(cp.items.is_empty());
        assert!(storage.latest_checkpoint(&RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn weekly_append_is_idempotent() {
        let storage = test_storage().await;
        let week: WeekId = "2026-W43".parse().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let items = vec![item("https://example.com/a", "A"), item("https://example.com/b", "B")];

        assert_eq!(storage.append_week_items(&week, day, &items).await.unwrap(), 2);
        assert_eq!(storage.append_week_items(&week, day, &items).await.unwrap(), 0);

        let loaded = storage.load_week_items(&week).await.unwrap();
        assert_eq!(loaded.len(), 2);

        // Same identifier on another day is a separate entry.
        let next = day.succ_opt().unwrap();
        storage.append_week_items(&week, next, &items[..1]).await.unwrap();
        assert_eq!(storage.load_week_items(&week).await.unwrap().len(), 3);
        assert_eq!(storage.week_day_counts(&week).await.unwrap(), vec![(day, 2), (next, 1)]);

        assert_eq!(storage.clear_week(&week).await.unwrap(), 3);
        assert!(storage.load_week_items(&week).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn baseline_roundtrip() {
        let storage = test_storage().await;
        let mut stat = BaselineStat::empty("collect", "duration_ms");
        for v in [100.0, 200.0, 300.0] {
            stat.observe(v);
        }
        assert_eq!(stat.mean, 200.0);
        assert_eq!(stat.variance(), Some(10_000.0));

        storage.save_baseline(&[stat.clone()]).await.unwrap();
        let loaded = storage.load_baseline().await.unwrap();
        assert_eq!(loaded, vec![stat]);
    }

    #[tokio::test]
    async fn completion_cache() {
        let storage = test_storage().await;

        let cached = storage
            .get_completion_cache("batch_judgments", "hash1", "model-a")
            .await
            .expect("get cache miss");
        assert!(cached.is_none());

        storage
            .set_completion_cache("batch_judgments", "hash1", "model-a", r#"{"judgments":[]}"#)
            .await
            .expect("set cache");

        let cached = storage
            .get_completion_cache("batch_judgments", "hash1", "model-a")
            .await
            .expect("get cache hit");
        assert!(cached.unwrap().contains("judgments"));

        assert!(storage
            .get_completion_cache("batch_judgments", "hash1", "model-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .write_checkpoint(&RunId::new(), "collect", 0, &[])
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
