//! Scan→execute handoff. Each scan persists one `ScanArtifact` blob under
//! `opportunities/{YYYY-MM-DD}/{HH-MM}.json`; the execute cycle consumes
//! the newest PENDING artifact still inside the age window and flips it to
//! EXECUTED afterwards. Duplicate-execution protection lives in the
//! position guard, not here.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::model::{ArtifactStatus, Opportunity, ScanArtifact};
use crate::persistence::blob_store::{BlobStore, StoreError};

const ROOT: &str = "opportunities";

pub struct OpportunityStore {
    blobs: Arc<dyn BlobStore>,
}

impl OpportunityStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn blob_path(scan_time: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}.json",
            ROOT,
            scan_time.format("%Y-%m-%d"),
            scan_time.format("%H-%M")
        )
    }

    /// Write a new PENDING artifact. Opportunities missing a field the
    /// sizing stage needs are rejected here, at scan time, instead of
    /// failing the execute cycle later.
    pub fn persist(
        &self,
        scan_time: DateTime<Utc>,
        max_age: Duration,
        opportunities: Vec<Opportunity>,
    ) -> Result<String, StoreError> {
        for opp in &opportunities {
            if opp.contract.mid <= Decimal::ZERO {
                return Err(StoreError::Rejected(format!(
                    "{}: non-positive mid",
                    opp.contract.occ_symbol
                )));
            }
            if opp.contract.strike <= Decimal::ZERO {
                return Err(StoreError::Rejected(format!(
                    "{}: non-positive strike",
                    opp.contract.occ_symbol
                )));
            }
            if opp.contract.dte < 0 {
                return Err(StoreError::Rejected(format!(
                    "{}: negative dte",
                    opp.contract.occ_symbol
                )));
            }
        }

        let artifact = ScanArtifact {
            scan_time,
            expires_at: scan_time + max_age,
            status: ArtifactStatus::Pending,
            opportunities,
        };

        let path = Self::blob_path(scan_time);
        let bytes = serde_json::to_vec(&artifact)?;
        self.blobs.put(&path, &bytes)?;
        info!(path = %path, count = artifact.opportunities.len(), "scan artifact persisted");
        Ok(path)
    }

    /// Newest PENDING artifact for the current date whose age is within
    /// `max_age` (inclusive). Stale, EXECUTED, and unreadable artifacts are
    /// skipped, not errors; `Ok(None)` means nothing is consumable.
    pub fn retrieve_latest_valid(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Option<(ScanArtifact, String)>, StoreError> {
        let prefix = format!("{}/{}/", ROOT, now.format("%Y-%m-%d"));
        let mut paths = self.blobs.list_prefix(&prefix)?;
        paths.reverse();

        for path in paths {
            let artifact: ScanArtifact = match self
                .blobs
                .get(&path)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(a) => a,
                Err(e) => {
                    warn!(path = %path, error = %e, "unreadable artifact skipped");
                    continue;
                }
            };

            if artifact.status != ArtifactStatus::Pending {
                continue;
            }
            if now - artifact.scan_time > max_age {
                continue;
            }
            return Ok(Some((artifact, path)));
        }

        Ok(None)
    }

    /// Flip an artifact to EXECUTED by rewriting it in place. Idempotent:
    /// an already-EXECUTED artifact is left untouched.
    pub fn mark_executed(&self, path: &str) -> Result<(), StoreError> {
        let bytes = self.blobs.get(path)?;
        let mut artifact: ScanArtifact = serde_json::from_slice(&bytes)?;

        if artifact.status == ArtifactStatus::Executed {
            return Ok(());
        }

        artifact.status = ArtifactStatus::Executed;
        self.blobs.put(path, &serde_json::to_vec(&artifact)?)?;
        info!(path, "artifact marked executed");
        Ok(())
    }
}
