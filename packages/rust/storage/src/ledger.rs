//! Router and review state: monthly cost ledger, stage tier floors,
//! shadow comparison log and human alerts.

use chrono::Utc;
use curricula_shared::{CurriculaError, FailureClass, HumanAlert, JobId, Result};
use libsql::params;
use uuid::Uuid;

use crate::{Storage, db_err, parse_time};

/// One logged shadow comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowRunRow {
    pub job_id: String,
    pub stage: String,
    pub primary_model: String,
    pub shadow_model: String,
    pub topic_overlap: f64,
    pub structural_similarity: f64,
    pub drift: f64,
    pub escalated: bool,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Cost ledger
    // -----------------------------------------------------------------------

    /// Spend per stage for `month` (`YYYY-MM`).
    pub async fn load_ledger(&self, month: &str) -> Result<Vec<(String, f64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, spent_usd FROM cost_ledger WHERE month = ?1",
                params![month],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<f64>(1).map_err(db_err)?,
            ));
        }
        Ok(results)
    }

    /// Add a reservation to the month's spend for a stage.
    pub async fn add_spend(&self, month: &str, stage: &str, amount_usd: f64) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO cost_ledger (month, stage, spent_usd) VALUES (?1, ?2, ?3)
                 ON CONFLICT(month, stage) DO UPDATE SET
                   spent_usd = spent_usd + excluded.spent_usd",
                params![month, stage, amount_usd],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage floors
    // -----------------------------------------------------------------------

    /// Every persisted `(stage, tier index)` floor.
    pub async fn load_stage_floors(&self) -> Result<Vec<(String, u8)>> {
        let mut rows = self
            .conn
            .query("SELECT stage, tier FROM stage_floors", params![])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let tier = row.get::<i64>(1).map_err(db_err)?;
            results.push((
                row.get::<String>(0).map_err(db_err)?,
                u8::try_from(tier)
                    .map_err(|_| CurriculaError::Storage(format!("invalid tier {tier}")))?,
            ));
        }
        Ok(results)
    }

    pub async fn set_stage_floor(&self, stage: &str, tier: u8, reason: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO stage_floors (stage, tier, reason, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stage) DO UPDATE SET
                   tier = MAX(tier, excluded.tier),
                   reason = excluded.reason,
                   updated_at = excluded.updated_at",
                params![stage, i64::from(tier), reason, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shadow runs
    // -----------------------------------------------------------------------

    pub async fn insert_shadow_run(&self, run: &ShadowRunRow) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO shadow_runs (id, job_id, stage, primary_model, shadow_model,
                    topic_overlap, structural_similarity, drift, escalated, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    Uuid::now_v7().to_string(),
                    run.job_id.as_str(),
                    run.stage.as_str(),
                    run.primary_model.as_str(),
                    run.shadow_model.as_str(),
                    run.topic_overlap,
                    run.structural_similarity,
                    run.drift,
                    i64::from(run.escalated),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent shadow runs for a stage, newest first.
    pub async fn list_shadow_runs(&self, stage: &str, limit: u32) -> Result<Vec<ShadowRunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, stage, primary_model, shadow_model, topic_overlap,
                    structural_similarity, drift, escalated
                 FROM shadow_runs WHERE stage = ?1 ORDER BY id DESC LIMIT ?2",
                params![stage, limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(ShadowRunRow {
                job_id: row.get::<String>(0).map_err(db_err)?,
                stage: row.get::<String>(1).map_err(db_err)?,
                primary_model: row.get::<String>(2).map_err(db_err)?,
                shadow_model: row.get::<String>(3).map_err(db_err)?,
                topic_overlap: row.get::<f64>(4).map_err(db_err)?,
                structural_similarity: row.get::<f64>(5).map_err(db_err)?,
                drift: row.get::<f64>(6).map_err(db_err)?,
                escalated: row.get::<i64>(7).map_err(db_err)? != 0,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Record an open alert for a job, replacing any earlier one.
    pub async fn upsert_alert(&self, alert: &HumanAlert) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO alerts (job_id, reason, recommended_action, class, raised_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT(job_id) DO UPDATE SET
                   reason = excluded.reason,
                   recommended_action = excluded.recommended_action,
                   class = excluded.class,
                   raised_at = excluded.raised_at,
                   resolved_at = NULL",
                params![
                    alert.job_id.to_string(),
                    alert.reason.as_str(),
                    alert.recommended_action.as_str(),
                    alert.class.as_str(),
                    alert.raised_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn resolve_alert(&self, job_id: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE alerts SET resolved_at = ?1 WHERE job_id = ?2 AND resolved_at IS NULL",
                params![now.as_str(), job_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Unresolved alerts, oldest first.
    pub async fn open_alerts(&self) -> Result<Vec<HumanAlert>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, reason, recommended_action, class, raised_at
                 FROM alerts WHERE resolved_at IS NULL ORDER BY raised_at",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let job_id: String = row.get(0).map_err(db_err)?;
            let class: String = row.get(3).map_err(db_err)?;
            results.push(HumanAlert {
                job_id: job_id
                    .parse::<JobId>()
                    .map_err(|e| CurriculaError::Storage(format!("invalid job id: {e}")))?,
                reason: row.get::<String>(1).map_err(db_err)?,
                recommended_action: row.get::<String>(2).map_err(db_err)?,
                class: parse_class(&class)?,
                raised_at: parse_time(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }
}

fn parse_class(s: &str) -> Result<FailureClass> {
    match s {
        "user" => Ok(FailureClass::User),
        "data" => Ok(FailureClass::Data),
        "agent" => Ok(FailureClass::Agent),
        "legal" => Ok(FailureClass::Legal),
        "system" => Ok(FailureClass::System),
        "unclassified" => Ok(FailureClass::Unclassified),
        other => Err(CurriculaError::Storage(format!(
            "unknown failure class '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;

    #[tokio::test]
    async fn ledger_accumulates_per_month() {
        let storage = test_storage().await;
        storage.add_spend("2026-10", "parsing", 0.25).await.unwrap();
        storage.add_spend("2026-10", "parsing", 0.5).await.unwrap();
        storage.add_spend("2026-09", "parsing", 9.0).await.unwrap();

        let october = storage.load_ledger("2026-10").await.unwrap();
        assert_eq!(october.len(), 1);
        assert_eq!(october[0].0, "parsing");
        assert!((october[0].1 - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn floors_never_decrease() {
        let storage = test_storage().await;
        storage.set_stage_floor("parsing", 1, "drift 0.4").await.unwrap();
        storage.set_stage_floor("parsing", 0, "manual").await.unwrap();
        let floors = storage.load_stage_floors().await.unwrap();
        assert_eq!(floors, vec![("parsing".to_string(), 1)]);
    }

    #[tokio::test]
    async fn alerts_open_and_resolve() {
        let storage = test_storage().await;
        let alert = HumanAlert {
            job_id: JobId::new(),
            reason: "source conflict".into(),
            recommended_action: "provide a source".into(),
            class: FailureClass::Data,
            raised_at: Utc::now(),
        };
        storage.upsert_alert(&alert).await.unwrap();
        let open = storage.open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].job_id, alert.job_id);
        assert_eq!(open[0].class, FailureClass::Data);

        storage.resolve_alert(&alert.job_id.to_string()).await.unwrap();
        assert!(storage.open_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shadow_runs_are_logged() {
        let storage = test_storage().await;
        let run = ShadowRunRow {
            job_id: "job-1".into(),
            stage: "parsing".into(),
            primary_model: "cheap".into(),
            shadow_model: "smart".into(),
            topic_overlap: 0.5,
            structural_similarity: 0.7,
            drift: 0.4,
            escalated: true,
        };
        storage.insert_shadow_run(&run).await.unwrap();
        let runs = storage.list_shadow_runs("parsing", 10).await.unwrap();
        assert_eq!(runs, vec![run]);
    }
}
