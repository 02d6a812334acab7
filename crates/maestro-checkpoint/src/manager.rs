use chrono::{DateTime, Duration, Utc};
use maestro_core::{CheckpointData, Clock, MaestroError, MaestroResult, RunState, SystemClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Summary of a persisted run, derived from its checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// The run identifier.
    pub run_id: String,
    /// The agent the run executes.
    pub agent: String,
    /// Derived run status (not stored redundantly in the document).
    pub status: RunState,
    /// Total number of stages in the run.
    pub total_stages: usize,
    /// Number of completed stages.
    pub completed_stages: usize,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

/// Durable key-value store for run state, keyed by run id.
///
/// One directory per run id under the base directory, containing the
/// serialized [`CheckpointData`] document plus `artifacts/` and `logs/`
/// subdirectories.
pub struct CheckpointManager {
    base_dir: PathBuf,
    retention_days: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("base_dir", &self.base_dir)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Creates a manager rooted at `base_dir`, creating the directory if
    /// needed. Uses the system clock and a 30-day retention window.
    pub async fn new(base_dir: impl Into<PathBuf>) -> MaestroResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            retention_days: DEFAULT_RETENTION_DAYS,
            clock: Arc::new(SystemClock),
        })
    }

    /// Sets the age-based cleanup retention window. Zero days is a
    /// configuration error.
    pub fn with_retention_days(mut self, days: u32) -> MaestroResult<Self> {
        if days == 0 {
            return Err(MaestroError::Config(
                "checkpoint retention must be at least 1 day".to_string(),
            ));
        }
        self.retention_days = days;
        Ok(self)
    }

    /// Replaces the clock. Tests use [`maestro_core::ManualClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The directory holding a run's checkpoint, artifacts, and logs.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// The run's artifact directory.
    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    /// The run's log directory.
    pub fn logs_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("logs")
    }

    fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINT_FILE)
    }

    // Run ids are controller-generated UUIDs; reject anything that could
    // escape the base directory when the id comes from user input.
    fn is_valid_run_id(run_id: &str) -> bool {
        !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// Persists the checkpoint atomically: refreshes `updated_at`,
    /// recomputes the checksum, writes to a temp file, and renames it into
    /// place. Ensures the run's `artifacts/` and `logs/` directories exist.
    pub async fn save(&self, data: &mut CheckpointData) -> MaestroResult<()> {
        if !Self::is_valid_run_id(&data.run_id) {
            return Err(MaestroError::Config(format!(
                "invalid run id: {:?}",
                data.run_id
            )));
        }

        data.updated_at = self.clock.now();
        data.checksum = compute_checksum(data)?;

        let run_dir = self.run_dir(&data.run_id);
        tokio::fs::create_dir_all(&run_dir).await?;
        tokio::fs::create_dir_all(self.artifacts_dir(&data.run_id)).await?;
        tokio::fs::create_dir_all(self.logs_dir(&data.run_id)).await?;

        let json = serde_json::to_string_pretty(data)?;
        let tmp_path = run_dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, self.checkpoint_path(&data.run_id)).await?;

        Ok(())
    }

    /// Loads and verifies a checkpoint.
    ///
    /// A missing run is [`MaestroError::RunNotFound`]; an existing but
    /// unreadable, version-mismatched, or checksum-mismatched document is
    /// reported as corruption and never silently repaired.
    pub async fn load(&self, run_id: &str) -> MaestroResult<CheckpointData> {
        if !Self::is_valid_run_id(run_id) {
            return Err(MaestroError::RunNotFound(run_id.to_string()));
        }

        let path = self.checkpoint_path(run_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MaestroError::RunNotFound(run_id.to_string()));
            }
            Err(e) => {
                return Err(MaestroError::CheckpointCorrupt {
                    run_id: run_id.to_string(),
                    reason: format!("unreadable checkpoint: {e}"),
                });
            }
        };

        // Parse the version first and dispatch before attempting a full
        // decode; unknown major versions fail loudly.
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| MaestroError::CheckpointCorrupt {
                run_id: run_id.to_string(),
                reason: format!("invalid JSON: {e}"),
            })?;

        let version = value["schema_version"].as_str().ok_or_else(|| {
            MaestroError::CheckpointCorrupt {
                run_id: run_id.to_string(),
                reason: "missing schema_version field".to_string(),
            }
        })?;
        if major_version(version) != major_version(maestro_core::CHECKPOINT_SCHEMA_VERSION) {
            return Err(MaestroError::SchemaVersion {
                found: version.to_string(),
                supported: maestro_core::CHECKPOINT_SCHEMA_VERSION.to_string(),
            });
        }

        let data: CheckpointData =
            serde_json::from_value(value).map_err(|e| MaestroError::CheckpointCorrupt {
                run_id: run_id.to_string(),
                reason: format!("malformed document: {e}"),
            })?;

        let expected = compute_checksum(&data)?;
        if expected != data.checksum {
            return Err(MaestroError::CheckpointCorrupt {
                run_id: run_id.to_string(),
                reason: "checksum mismatch".to_string(),
            });
        }

        Ok(data)
    }

    /// Fast existence probe; does not deserialize the document.
    pub async fn exists(&self, run_id: &str) -> bool {
        if !Self::is_valid_run_id(run_id) {
            return false;
        }
        tokio::fs::try_exists(self.checkpoint_path(run_id))
            .await
            .unwrap_or(false)
    }

    /// Lists summaries of all persisted runs, most recently updated first.
    /// Unreadable entries are skipped with a warning rather than failing
    /// the whole listing.
    pub async fn list(&self) -> MaestroResult<Vec<CheckpointSummary>> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&run_id).await {
                Ok(data) => summaries.push(CheckpointSummary {
                    run_id: data.run_id.clone(),
                    agent: data.agent.clone(),
                    status: data.derived_state(),
                    total_stages: data.stages.len(),
                    completed_stages: data.completed_stage_count(),
                    created_at: data.created_at,
                    updated_at: data.updated_at,
                }),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "skipping unreadable checkpoint entry");
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Removes a run's entire directory tree (checkpoint, artifacts,
    /// logs). Idempotent: deleting a non-existent run is not an error.
    pub async fn delete(&self, run_id: &str) -> MaestroResult<()> {
        if !Self::is_valid_run_id(run_id) {
            warn!(run_id = %run_id, "ignoring delete for invalid run id");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(self.run_dir(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes runs whose `updated_at` exceeds the retention window.
    /// Returns the ids of the runs that were removed.
    pub async fn cleanup(&self) -> MaestroResult<Vec<String>> {
        let cutoff = self.clock.now() - Duration::days(i64::from(self.retention_days));
        let mut removed = Vec::new();
        for summary in self.list().await? {
            if summary.updated_at < cutoff {
                self.delete(&summary.run_id).await?;
                removed.push(summary.run_id);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up expired checkpoints");
        }
        Ok(removed)
    }

    /// The base directory this manager is rooted at.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// SHA-256 over the serialized document with the checksum field blanked.
/// `shared_data` is a `BTreeMap`, so serialization is deterministic.
fn compute_checksum(data: &CheckpointData) -> MaestroResult<String> {
    let mut unsigned = data.clone();
    unsigned.checksum = String::new();
    let bytes = serde_json::to_vec(&unsigned)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use maestro_core::{ExecutionMode, ManualClock, StageState, StageStatus};

    fn sample_data(run_id: &str) -> CheckpointData {
        CheckpointData::new(
            run_id,
            "researcher",
            "Summarize the findings",
            ExecutionMode::resumable(),
            vec![
                StageState::new("plan", "Plan the work", 0, false),
                StageState::new("execute", "Do the work", 1, true),
                StageState::new("report", "Write the report", 2, false),
            ],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();

        let mut data = sample_data("run-round-trip");
        data.previous_outputs.push("plan output".to_string());
        data.shared_data
            .insert("branch".to_string(), serde_json::json!("main"));
        manager.save(&mut data).await.unwrap();

        let loaded = manager.load("run-round-trip").await.unwrap();
        assert_eq!(loaded, data);
        assert!(!loaded.checksum.is_empty());

        // Run directories are created alongside the document.
        assert!(manager.artifacts_dir("run-round-trip").is_dir());
        assert!(manager.logs_dir("run-round-trip").is_dir());
    }

    #[tokio::test]
    async fn test_load_missing_run_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let err = manager.load("no-such-run").await.unwrap_err();
        assert!(matches!(err, MaestroError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_tampered_checkpoint_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let mut data = sample_data("run-tampered");
        manager.save(&mut data).await.unwrap();

        let path = tmp.path().join("run-tampered").join(CHECKPOINT_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("Summarize the findings", "Something else entirely");
        assert_ne!(raw, tampered);
        std::fs::write(&path, tampered).unwrap();

        let err = manager.load("run-tampered").await.unwrap_err();
        assert!(
            matches!(err, MaestroError::CheckpointCorrupt { ref reason, .. } if reason.contains("checksum")),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_unknown_schema_version_fails_before_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let mut data = sample_data("run-schema");
        manager.save(&mut data).await.unwrap();

        let path = tmp.path().join("run-schema").join(CHECKPOINT_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("\"schema_version\": \"1.0\"", "\"schema_version\": \"2.0\"");
        assert_ne!(raw, tampered);
        std::fs::write(&path, tampered).unwrap();

        let err = manager.load("run-schema").await.unwrap_err();
        assert!(matches!(err, MaestroError::SchemaVersion { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let mut data = sample_data("run-delete");
        manager.save(&mut data).await.unwrap();

        assert!(manager.exists("run-delete").await);
        manager.delete("run-delete").await.unwrap();
        assert!(!manager.exists("run-delete").await);
        // Second delete of the same run must not error.
        manager.delete("run-delete").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_sorted_by_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = CheckpointManager::new(tmp.path())
            .await
            .unwrap()
            .with_clock(clock.clone());

        let mut older = sample_data("run-older");
        manager.save(&mut older).await.unwrap();

        clock.advance(Duration::minutes(5));
        let mut newer = sample_data("run-newer");
        newer.stages[0].status = StageStatus::Error;
        manager.save(&mut newer).await.unwrap();

        let summaries = manager.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].run_id, "run-newer");
        assert_eq!(summaries[0].status, RunState::Failed);
        assert_eq!(summaries[1].run_id, "run-older");
        assert_eq!(summaries[1].status, RunState::InProgress);
        assert_eq!(summaries[1].total_stages, 3);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = CheckpointManager::new(tmp.path())
            .await
            .unwrap()
            .with_retention_days(7)
            .unwrap()
            .with_clock(clock.clone());

        let mut old_run = sample_data("run-expired");
        manager.save(&mut old_run).await.unwrap();

        clock.advance(Duration::days(10));
        let mut fresh_run = sample_data("run-fresh");
        manager.save(&mut fresh_run).await.unwrap();

        let removed = manager.cleanup().await.unwrap();
        assert_eq!(removed, vec!["run-expired".to_string()]);
        assert!(!manager.exists("run-expired").await);
        assert!(manager.exists("run-fresh").await);
    }

    #[tokio::test]
    async fn test_zero_retention_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let err = manager.with_retention_days(0).unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_run_id_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path()).await.unwrap();
        let err = manager.load("../escape").await.unwrap_err();
        assert!(matches!(err, MaestroError::RunNotFound(_)));
        assert!(!manager.exists("../escape").await);
    }
}
