//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the verified
//! curriculum vault, orchestrator jobs, the monthly cost ledger, stage tier
//! floors, the shadow review log and open human alerts.
//!
//! **Access rules:**
//! - The orchestrator: read-write via [`Storage::open`]; all writes are
//!   serialized through one in-process write lock
//! - Reporting tools: read-only via [`Storage::open_readonly`]
//!
//! Vault writes are optimistic: a replica is written only if the record's
//! version still matches what the writer read, otherwise the write fails
//! with [`CurriculaError::Conflict`] and nothing is persisted.

mod jobs;
mod ledger;
mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use curricula_shared::{Competency, CurriculaError, CurriculumRecord, Result};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use jobs::JobRow;
pub use ledger::ShadowRunRow;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CurriculaError::io(parent, e))?;
        }

        let storage = Self::connect(path, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly,
            write_lock: Mutex::new(()),
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
                        CurriculaError::Storage(format!(
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
            return Err(CurriculaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vault reads
    // -----------------------------------------------------------------------

    /// Fetch the record for one exact (country, jurisdiction, grade, subject) key.
    pub async fn find_curriculum(
        &self,
        country_code: &str,
        jurisdiction_key: &str,
        grade: &str,
        subject: &str,
    ) -> Result<Option<CurriculumRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CURRICULUM_COLUMNS} FROM curricula
                     WHERE country_code = ?1 AND jurisdiction_key = ?2
                       AND grade = ?3 AND subject = ?4"
                ),
                params![country_code, jurisdiction_key, grade, subject],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_curriculum(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Number of distinct usable jurisdictions cached for a country/grade/subject.
    pub async fn count_jurisdictions(
        &self,
        country_code: &str,
        grade: &str,
        subject: &str,
    ) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(DISTINCT jurisdiction_key) FROM curricula
                 WHERE country_code = ?1 AND grade = ?2 AND subject = ?3
                   AND status != 'conflicted'",
                params![country_code, grade, subject],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List every stored record, ordered by key.
    pub async fn list_curricula(&self) -> Result<Vec<CurriculumRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CURRICULUM_COLUMNS} FROM curricula
                     ORDER BY country_code, jurisdiction_key, grade, subject"
                ),
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_curriculum(&row)?);
        }
        Ok(results)
    }

    /// Competencies of a stored record, in their stored order.
    pub async fn competencies_for(&self, curriculum_id: &str) -> Result<Vec<Competency>> {
        let mut rows = self
            .conn
            .query(
                "SELECT body_json FROM competencies WHERE curriculum_id = ?1 ORDER BY position",
                params![curriculum_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let body: String = row.get(0).map_err(db_err)?;
            let competency = serde_json::from_str(&body)
                .map_err(|e| CurriculaError::Storage(format!("corrupt competency row: {e}")))?;
            results.push(competency);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Vault writes
    // -----------------------------------------------------------------------

    /// Write a verified replica and its competencies in one transaction.
    ///
    /// `expected_version` is the version the writer observed before the cold
    /// start began (`None` if no record existed). If another writer got there
    /// first the call fails with [`CurriculaError::Conflict`] and nothing is
    /// written. Returns the record as stored.
    pub async fn store_replica(
        &self,
        record: &CurriculumRecord,
        competencies: &[Competency],
        expected_version: Option<i64>,
    ) -> Result<CurriculumRecord> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let conn = self.db.connect().map_err(db_err)?;
        let tx = conn.transaction().await.map_err(db_err)?;

        let stored = match expected_version {
            None => {
                let inserted = tx
                    .execute(
                        "INSERT INTO curricula (id, country, country_code, jurisdiction_level,
                            jurisdiction_name, parent_jurisdiction_id, jurisdiction_key, grade,
                            subject, status, confidence_score, last_verified, ttl_expiry,
                            source_url, checksum, version)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1)
                         ON CONFLICT(country_code, jurisdiction_key, grade, subject) DO NOTHING",
                        params![
                            record.id.as_str(),
                            record.country.as_str(),
                            record.country_code.as_str(),
                            record.jurisdiction_level.as_str(),
                            record.jurisdiction_name.as_deref(),
                            record.parent_jurisdiction_id.as_deref(),
                            record.jurisdiction_key.as_str(),
                            record.grade.as_str(),
                            record.subject.as_str(),
                            record.status.as_str(),
                            record.confidence_score,
                            record.last_verified.to_rfc3339(),
                            record.ttl_expiry.to_rfc3339(),
                            record.source_url.as_str(),
                            record.checksum.as_str(),
                        ],
                    )
                    .await
                    .map_err(db_err)?;
                if inserted == 0 {
                    tx.rollback().await.map_err(db_err)?;
                    return Err(CurriculaError::Conflict(format!(
                        "{} was created by another writer",
                        record.jurisdiction_key
                    )));
                }
                CurriculumRecord {
                    version: 1,
                    ..record.clone()
                }
            }
            Some(expected) => {
                let mut rows = tx
                    .query(
                        "SELECT id FROM curricula
                         WHERE country_code = ?1 AND jurisdiction_key = ?2
                           AND grade = ?3 AND subject = ?4 AND version = ?5",
                        params![
                            record.country_code.as_str(),
                            record.jurisdiction_key.as_str(),
                            record.grade.as_str(),
                            record.subject.as_str(),
                            expected,
                        ],
                    )
                    .await
                    .map_err(db_err)?;
                let current = rows.next().await.map_err(db_err)?;
                let existing_id: String = match current {
                    Some(row) => row.get(0).map_err(db_err)?,
                    None => {
                        tx.rollback().await.map_err(db_err)?;
                        return Err(CurriculaError::Conflict(format!(
                            "{} is no longer at version {expected}",
                            record.jurisdiction_key
                        )));
                    }
                };

                let updated = tx
                    .execute(
                        "UPDATE curricula SET country = ?1, jurisdiction_level = ?2,
                            jurisdiction_name = ?3, parent_jurisdiction_id = ?4, status = ?5,
                            confidence_score = ?6, last_verified = ?7, ttl_expiry = ?8,
                            source_url = ?9, checksum = ?10, version = version + 1
                         WHERE id = ?11 AND version = ?12",
                        params![
                            record.country.as_str(),
                            record.jurisdiction_level.as_str(),
                            record.jurisdiction_name.as_deref(),
                            record.parent_jurisdiction_id.as_deref(),
                            record.status.as_str(),
                            record.confidence_score,
                            record.last_verified.to_rfc3339(),
                            record.ttl_expiry.to_rfc3339(),
                            record.source_url.as_str(),
                            record.checksum.as_str(),
                            existing_id.as_str(),
                            expected,
                        ],
                    )
                    .await
                    .map_err(db_err)?;
                if updated == 0 {
                    tx.rollback().await.map_err(db_err)?;
                    return Err(CurriculaError::Conflict(format!(
                        "{} changed during write",
                        record.jurisdiction_key
                    )));
                }
                tx.execute(
                    "DELETE FROM competencies WHERE curriculum_id = ?1",
                    params![existing_id.as_str()],
                )
                .await
                .map_err(db_err)?;
                CurriculumRecord {
                    id: existing_id,
                    version: expected + 1,
                    ..record.clone()
                }
            }
        };

        for (position, competency) in competencies.iter().enumerate() {
            let body = serde_json::to_string(competency)
                .map_err(|e| CurriculaError::Storage(format!("serialize competency: {e}")))?;
            tx.execute(
                "INSERT INTO competencies (id, curriculum_id, position, body_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::now_v7().to_string(),
                    stored.id.as_str(),
                    position as i64,
                    body,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::info!(
            id = %stored.id,
            key = %stored.jurisdiction_key,
            version = stored.version,
            competencies = competencies.len(),
            "replica stored"
        );
        Ok(stored)
    }

    /// Mark a record's status without touching its content.
    pub async fn set_curriculum_status(
        &self,
        id: &str,
        status: curricula_shared::CurriculumStatus,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "UPDATE curricula SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Column list shared by every curriculum query, in [`row_to_curriculum`] order.
const CURRICULUM_COLUMNS: &str = "id, country, country_code, jurisdiction_level, \
    jurisdiction_name, parent_jurisdiction_id, jurisdiction_key, grade, subject, status, \
    confidence_score, last_verified, ttl_expiry, source_url, checksum, version";

pub(crate) fn db_err(e: libsql::Error) -> CurriculaError {
    CurriculaError::Storage(e.to_string())
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CurriculaError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`CurriculumRecord`].
fn row_to_curriculum(row: &libsql::Row) -> Result<CurriculumRecord> {
    Ok(CurriculumRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        country: row.get::<String>(1).map_err(db_err)?,
        country_code: row.get::<String>(2).map_err(db_err)?,
        jurisdiction_level: row.get::<String>(3).map_err(db_err)?.parse()?,
        jurisdiction_name: row.get::<String>(4).ok(),
        parent_jurisdiction_id: row.get::<String>(5).ok(),
        jurisdiction_key: row.get::<String>(6).map_err(db_err)?,
        grade: row.get::<String>(7).map_err(db_err)?,
        subject: row.get::<String>(8).map_err(db_err)?,
        status: row.get::<String>(9).map_err(db_err)?.parse()?,
        confidence_score: row.get::<f64>(10).map_err(db_err)?,
        last_verified: parse_time(&row.get::<String>(11).map_err(db_err)?)?,
        ttl_expiry: parse_time(&row.get::<String>(12).map_err(db_err)?)?,
        source_url: row.get::<String>(13).map_err(db_err)?,
        checksum: row.get::<String>(14).map_err(db_err)?,
        version: row.get::<i64>(15).map_err(db_err)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use curricula_shared::{CurriculumStatus, JurisdictionLevel};

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("curricula_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub(crate) fn record(key: &str, confidence: f64) -> CurriculumRecord {
        let (level, name) = match key.split_once(':') {
            Some(("state", name)) => (JurisdictionLevel::State, Some(name.to_string())),
            Some(("county", name)) => (JurisdictionLevel::County, Some(name.to_string())),
            _ => (JurisdictionLevel::National, None),
        };
        CurriculumRecord {
            id: Uuid::now_v7().to_string(),
            country: "nigeria".into(),
            country_code: "NG".into(),
            jurisdiction_level: level,
            jurisdiction_name: name,
            parent_jurisdiction_id: None,
            jurisdiction_key: key.into(),
            grade: "jss 1".into(),
            subject: "biology".into(),
            status: CurriculumStatus::Active,
            confidence_score: confidence,
            last_verified: Utc::now(),
            ttl_expiry: Utc::now() + Duration::days(30),
            source_url: "https://nerdc.gov.ng/biology".into(),
            checksum: "abc".into(),
            version: 0,
        }
    }

    fn competency(title: &str) -> Competency {
        Competency {
            id: Uuid::now_v7().to_string(),
            title: title.into(),
            description: format!("{title} description"),
            learning_outcomes: vec![format!("Explain {title}")],
            grade: None,
            abstraction_level: 0,
            confidence: 0.9,
            source_chunk_ids: vec!["k1".into()],
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("curricula_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn replica_insert_and_read_back() {
        let storage = test_storage().await;
        let rec = record("national", 0.95);
        let comps = vec![competency("Cells"), competency("Photosynthesis")];

        let stored = storage
            .store_replica(&rec, &comps, None)
            .await
            .expect("store replica");
        assert_eq!(stored.version, 1);

        let found = storage
            .find_curriculum("NG", "national", "jss 1", "biology")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, rec.id);
        assert_eq!(found.jurisdiction_level, JurisdictionLevel::National);
        assert!((found.confidence_score - 0.95).abs() < f64::EPSILON);

        let back = storage.competencies_for(&found.id).await.expect("comps");
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].title, "Cells");
        assert_eq!(back[1].title, "Photosynthesis");
    }

    #[tokio::test]
    async fn optimistic_check_rejects_stale_writer() {
        let storage = test_storage().await;
        let rec = record("state:lagos", 0.9);
        storage
            .store_replica(&rec, &[competency("Cells")], None)
            .await
            .expect("first write");

        // Second writer that also believed no record existed.
        let err = storage
            .store_replica(&record("state:lagos", 0.9), &[competency("Other")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CurriculaError::Conflict(_)));

        // Writer holding the current version succeeds and bumps it.
        let updated = storage
            .store_replica(&rec, &[competency("Cells v2")], Some(1))
            .await
            .expect("versioned update");
        assert_eq!(updated.version, 2);

        // A writer still holding version 1 loses.
        let err = storage
            .store_replica(&rec, &[competency("Late")], Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CurriculaError::Conflict(_)));

        let comps = storage.competencies_for(&rec.id).await.unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].title, "Cells v2");
    }

    #[tokio::test]
    async fn jurisdiction_count_ignores_conflicted() {
        let storage = test_storage().await;
        storage
            .store_replica(&record("national", 0.9), &[competency("A")], None)
            .await
            .unwrap();
        let lagos = storage
            .store_replica(&record("state:lagos", 0.9), &[competency("B")], None)
            .await
            .unwrap();
        assert_eq!(
            storage.count_jurisdictions("NG", "jss 1", "biology").await.unwrap(),
            2
        );

        storage
            .set_curriculum_status(&lagos.id, CurriculumStatus::Conflicted)
            .await
            .unwrap();
        assert_eq!(
            storage.count_jurisdictions("NG", "jss 1", "biology").await.unwrap(),
            1
        );
        assert_eq!(storage.list_curricula().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("curricula_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.store_replica(&record("national", 0.9), &[competency("A")], None)
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .store_replica(&record("state:kano", 0.9), &[competency("B")], None)
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert_eq!(ro.list_curricula().await.unwrap().len(), 1);
    }
}
