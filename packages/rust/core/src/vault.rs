//! Vault lookup: exact jurisdiction, then parent, then national.
//!
//! The first tier with a usable record wins, even when a later tier holds
//! a higher-confidence artifact. Lookup is a pure read; store errors
//! surface unchanged.

use chrono::{DateTime, Utc};
use curricula_shared::{
    CurriculumRecord, CurriculumStatus, JurisdictionResolution, NormalizedRequest, Result,
    VaultLookupResult, VaultSource,
};
use curricula_storage::Storage;
use tracing::{debug, instrument};

/// A lookup result plus what the orchestrator needs to act on it.
#[derive(Debug, Clone)]
pub struct VaultMatch {
    pub result: VaultLookupResult,
    pub record: Option<CurriculumRecord>,
    /// Version of the record under the exact key, whatever its status.
    /// A later replica write must expect this version.
    pub exact_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VaultDecision {
    Serve,
    /// Serve, but tell the caller why the artifact may be out of date.
    ServeStale { reason: String },
    ColdStart,
}

#[instrument(skip_all, fields(country = %request.country_code, key = %resolution.key()))]
pub async fn lookup(
    storage: &Storage,
    request: &NormalizedRequest,
    resolution: &JurisdictionResolution,
) -> Result<VaultMatch> {
    let exact_key = resolution.key();
    let mut tiers: Vec<(VaultSource, String)> = vec![(VaultSource::Cache, exact_key.clone())];
    if let Some(parent) = &resolution.parent_id {
        tiers.push((VaultSource::Parent, parent.to_lowercase()));
    }
    tiers.push((VaultSource::National, "national".to_string()));

    let mut seen: Vec<&str> = Vec::new();
    let mut exact_version = None;

    for (source, key) in &tiers {
        if seen.contains(&key.as_str()) {
            continue;
        }
        seen.push(key);

        let record = storage
            .find_curriculum(&request.country_code, key, &request.grade, &request.subject)
            .await?;
        let Some(record) = record else {
            continue;
        };
        if *key == exact_key {
            exact_version = Some(record.version);
        }
        if record.status == CurriculumStatus::Conflicted {
            debug!(key = %key, "skipping conflicted record");
            continue;
        }

        debug!(key = %key, ?source, confidence = record.confidence_score, "vault hit");
        return Ok(VaultMatch {
            result: VaultLookupResult {
                found: true,
                artifact_id: Some(record.id.clone()),
                confidence: record.confidence_score,
                source: Some(*source),
            },
            record: Some(record),
            exact_version,
        });
    }

    debug!("vault miss");
    Ok(VaultMatch {
        result: VaultLookupResult::miss(),
        record: None,
        exact_version,
    })
}

/// Serve, serve with a warning, or start a cold start.
pub fn decide(found: &VaultMatch, serve_threshold: f64, now: DateTime<Utc>) -> VaultDecision {
    let Some(record) = found.record.as_ref().filter(|_| found.result.found) else {
        return VaultDecision::ColdStart;
    };

    if record.confidence_score < serve_threshold {
        VaultDecision::ServeStale {
            reason: format!(
                "artifact confidence {:.2} is below {serve_threshold:.2}",
                record.confidence_score
            ),
        }
    } else if record.status == CurriculumStatus::Stale {
        VaultDecision::ServeStale {
            reason: "artifact is marked stale".to_string(),
        }
    } else if record.ttl_expiry <= now {
        VaultDecision::ServeStale {
            reason: format!(
                "artifact was last verified {} and its TTL has expired",
                record.last_verified.format("%Y-%m-%d")
            ),
        }
    } else {
        VaultDecision::Serve
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{record, request, resolution, test_storage};
    use chrono::Duration;
    use curricula_shared::JurisdictionLevel;

    #[tokio::test]
    async fn exact_match_wins_over_higher_confidence_tiers() {
        let storage = test_storage().await;
        storage
            .store_replica(&record("county:ikeja", 0.5), &[], None)
            .await
            .unwrap();
        storage
            .store_replica(&record("state:lagos", 0.95), &[], None)
            .await
            .unwrap();
        storage
            .store_replica(&record("national", 0.99), &[], None)
            .await
            .unwrap();

        let mut res = resolution(JurisdictionLevel::County, Some("Ikeja"));
        res.parent_id = Some("state:lagos".into());

        let found = lookup(&storage, &request(), &res).await.unwrap();
        assert!(found.result.found);
        assert_eq!(found.result.source, Some(VaultSource::Cache));
        assert_eq!(found.result.confidence, 0.5);
        assert_eq!(found.exact_version, Some(1));
    }

    #[tokio::test]
    async fn falls_back_to_parent_then_national() {
        let storage = test_storage().await;
        storage
            .store_replica(&record("national", 0.9), &[], None)
            .await
            .unwrap();

        let mut res = resolution(JurisdictionLevel::County, Some("Ikeja"));
        res.parent_id = Some("state:lagos".into());
        let found = lookup(&storage, &request(), &res).await.unwrap();
        assert_eq!(found.result.source, Some(VaultSource::National));
        assert_eq!(found.exact_version, None);

        storage
            .store_replica(&record("state:lagos", 0.6), &[], None)
            .await
            .unwrap();
        let found = lookup(&storage, &request(), &res).await.unwrap();
        assert_eq!(found.result.source, Some(VaultSource::Parent));
    }

    #[tokio::test]
    async fn conflicted_records_are_not_matches() {
        let storage = test_storage().await;
        let stored = storage
            .store_replica(&record("national", 0.9), &[], None)
            .await
            .unwrap();
        storage
            .set_curriculum_status(&stored.id, CurriculumStatus::Conflicted)
            .await
            .unwrap();

        let res = resolution(JurisdictionLevel::National, None);
        let found = lookup(&storage, &request(), &res).await.unwrap();
        assert!(!found.result.found);
        assert_eq!(found.exact_version, Some(1));
        assert_eq!(decide(&found, 0.8, Utc::now()), VaultDecision::ColdStart);
    }

    #[test]
    fn decision_boundaries() {
        let hit = |confidence: f64| VaultMatch {
            result: VaultLookupResult {
                found: true,
                artifact_id: Some("a".into()),
                confidence,
                source: Some(VaultSource::Cache),
            },
            record: Some(record("national", confidence)),
            exact_version: Some(1),
        };
        let now = Utc::now();
        assert_eq!(decide(&hit(0.8), 0.8, now), VaultDecision::Serve);
        assert!(matches!(
            decide(&hit(0.79), 0.8, now),
            VaultDecision::ServeStale { .. }
        ));

        let mut expired = hit(0.95);
        if let Some(r) = expired.record.as_mut() {
            r.ttl_expiry = now - Duration::days(1);
        }
        assert!(matches!(
            decide(&expired, 0.8, now),
            VaultDecision::ServeStale { .. }
        ));

        let miss = VaultMatch {
            result: VaultLookupResult::miss(),
            record: None,
            exact_version: None,
        };
        assert_eq!(decide(&miss, 0.8, now), VaultDecision::ColdStart);
    }
}
