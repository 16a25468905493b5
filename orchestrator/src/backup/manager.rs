// File: orchestrator/src/backup/manager.rs
use crate::constants::snapshots;
use crate::errors::SnapshotError;
use chrono::{DateTime, Utc};
use glob::glob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

/// Metadata record written beside each sealed archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPoint {
    pub id: String,
    pub label: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub archive_file: String,
    pub checksum_sha256: String,
    pub size_bytes: u64,
    pub contents: SnapshotContents,
}

/// What the archive captured, per subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContents {
    pub config_paths: Vec<String>,
    pub user_data_paths: Vec<String>,
    pub package_state: bool,
    pub service_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreAction {
    Automatic,
    ManualFollowUp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemRestore {
    pub subsystem: String,
    pub action: RestoreAction,
    pub detail: String,
}

/// Per-subsystem outcome of a restore, with the staging location for the
/// subsystems that need manual follow-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub staging_dir: String,
    pub subsystems: Vec<SubsystemRestore>,
}

impl RestoreReport {
    pub fn manual_steps(&self) -> impl Iterator<Item = &SubsystemRestore> {
        self.subsystems
            .iter()
            .filter(|s| s.action == RestoreAction::ManualFollowUp)
    }
}

/// What to capture. Package and service state shell out to `dpkg` and
/// `systemctl` and are disabled on hosts (and tests) without them.
#[derive(Debug, Clone)]
pub struct BackupSources {
    pub config_paths: Vec<PathBuf>,
    pub user_data_paths: Vec<PathBuf>,
    pub capture_package_state: bool,
    pub capture_service_state: bool,
}

impl Default for BackupSources {
    fn default() -> Self {
        Self {
            config_paths: vec![
                PathBuf::from("/etc/sysmaint"),
                PathBuf::from("/etc/apt/apt.conf.d"),
                PathBuf::from("/etc/cron.d"),
            ],
            user_data_paths: Vec::new(),
            capture_package_state: true,
            capture_service_state: true,
        }
    }
}

pub struct BackupManager {
    snapshots_dir: PathBuf,
    retention_count: usize,
    sources: BackupSources,
}

impl BackupManager {
    pub fn new(snapshots_dir: PathBuf, retention_count: usize, sources: BackupSources) -> Self {
        Self {
            snapshots_dir,
            retention_count,
            sources,
        }
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{}.tar.gz", id))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{}.json", id))
    }

    /// Captures a sealed snapshot. Fails the caller if the archive cannot be
    /// created or does not verify; a failed snapshot leaves nothing behind.
    pub async fn snapshot(
        &self,
        label: &str,
        description: &str,
    ) -> Result<SnapshotPoint, SnapshotError> {
        let created_at = Utc::now();
        let id = format!(
            "{}_{}_{}",
            label,
            created_at.format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        let staging_dir = self.snapshots_dir.join(format!("{}.staging", id));
        let archive_path = self.archive_path(&id);

        info!("Creating snapshot '{}' ({})", id, description);

        let result = self
            .build_snapshot(&id, label, description, created_at, &staging_dir, &archive_path)
            .await;

        // Staging is transient regardless of outcome
        let _ = fs::remove_dir_all(&staging_dir).await;

        match result {
            Ok(point) => {
                let removed = self.cleanup_old_snapshots().await?;
                if removed > 0 {
                    info!("Retention removed {} old snapshots", removed);
                }
                Ok(point)
            }
            Err(e) => {
                let _ = fs::remove_file(&archive_path).await;
                let _ = fs::remove_file(self.metadata_path(&id)).await;
                Err(e)
            }
        }
    }

    async fn build_snapshot(
        &self,
        id: &str,
        label: &str,
        description: &str,
        created_at: DateTime<Utc>,
        staging_dir: &Path,
        archive_path: &Path,
    ) -> Result<SnapshotPoint, SnapshotError> {
        let create_err = |reason: String| SnapshotError::CreateFailed {
            label: label.to_string(),
            reason,
        };

        let files_dir = staging_dir.join("files");
        fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| create_err(e.to_string()))?;

        // Step 1: stage configuration and user data, structure preserved
        let mut staged_config = Vec::new();
        for path in &self.sources.config_paths {
            if stage_path(path, &files_dir).await.map_err(create_err)? {
                staged_config.push(path.display().to_string());
            } else {
                debug!("Config path {} absent, not staged", path.display());
            }
        }
        let mut staged_user_data = Vec::new();
        for path in &self.sources.user_data_paths {
            if stage_path(path, &files_dir).await.map_err(create_err)? {
                staged_user_data.push(path.display().to_string());
            }
        }

        // Step 2: package selections and enabled services
        if self.sources.capture_package_state {
            run_shell(&format!(
                "dpkg --get-selections > '{}'",
                staging_dir.join("packages.list").display()
            ))
            .await
            .map_err(|e| create_err(format!("package state capture failed: {}", e)))?;
        }
        if self.sources.capture_service_state {
            run_shell(&format!(
                "systemctl list-unit-files --state=enabled --no-legend | awk '{{print $1}}' > '{}'",
                staging_dir.join("services.list").display()
            ))
            .await
            .map_err(|e| create_err(format!("service state capture failed: {}", e)))?;
        }

        // Step 3: seal the staging tree
        fs::create_dir_all(&self.snapshots_dir)
            .await
            .map_err(|e| create_err(e.to_string()))?;
        run_shell(&format!(
            "tar -czf '{}' -C '{}' .",
            archive_path.display(),
            staging_dir.display()
        ))
        .await
        .map_err(|e| create_err(format!("tar failed: {}", e)))?;

        // Step 4: checksum and verify immediately
        let size_bytes = fs::metadata(archive_path)
            .await
            .map_err(|e| create_err(e.to_string()))?
            .len();
        let checksum_sha256 = sha256_file(archive_path)
            .await
            .map_err(|e| create_err(e))?;

        let point = SnapshotPoint {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            created_at,
            archive_file: archive_path.display().to_string(),
            checksum_sha256,
            size_bytes,
            contents: SnapshotContents {
                config_paths: staged_config,
                user_data_paths: staged_user_data,
                package_state: self.sources.capture_package_state,
                service_state: self.sources.capture_service_state,
            },
        };
        self.verify_archive(&point).await?;

        // Step 5: metadata record written last, so a metadata file always
        // refers to a verified archive
        let rendered = serde_json::to_vec_pretty(&point)
            .map_err(|e| create_err(e.to_string()))?;
        let metadata_path = self.metadata_path(id);
        let tmp_path = metadata_path.with_extension("json.tmp");
        fs::write(&tmp_path, rendered)
            .await
            .map_err(|e| create_err(e.to_string()))?;
        fs::rename(&tmp_path, &metadata_path)
            .await
            .map_err(|e| create_err(e.to_string()))?;

        info!(
            "Snapshot '{}' sealed: {} bytes, sha256 {}",
            id,
            point.size_bytes,
            &point.checksum_sha256[..12]
        );
        Ok(point)
    }

    /// Integrity check: plausible size, listable archive, matching checksum.
    pub async fn verify_archive(&self, point: &SnapshotPoint) -> Result<(), SnapshotError> {
        let verify_err = |reason: String| SnapshotError::VerificationFailed {
            id: point.id.clone(),
            reason,
        };

        if point.size_bytes < snapshots::MIN_ARCHIVE_SIZE_BYTES {
            return Err(verify_err(format!(
                "archive is implausibly small ({} bytes)",
                point.size_bytes
            )));
        }

        run_shell(&format!("tar -tzf '{}' > /dev/null", point.archive_file))
            .await
            .map_err(|e| verify_err(format!("archive not listable: {}", e)))?;

        let actual = sha256_file(Path::new(&point.archive_file))
            .await
            .map_err(verify_err)?;
        if actual != point.checksum_sha256 {
            return Err(verify_err(format!(
                "checksum mismatch: expected {}, got {}",
                point.checksum_sha256, actual
            )));
        }

        Ok(())
    }

    pub async fn load(&self, snapshot_id: &str) -> Result<SnapshotPoint, SnapshotError> {
        let metadata_path = self.metadata_path(snapshot_id);
        let content = fs::read_to_string(&metadata_path).await.map_err(|_| {
            SnapshotError::NotFound {
                id: snapshot_id.to_string(),
            }
        })?;
        serde_json::from_str(&content).map_err(|e| SnapshotError::VerificationFailed {
            id: snapshot_id.to_string(),
            reason: format!("unreadable metadata: {}", e),
        })
    }

    /// All snapshots with readable metadata, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotPoint>, SnapshotError> {
        let pattern = format!("{}/*.json", self.snapshots_dir.display());
        let mut points = Vec::new();

        let entries = glob(&pattern).map_err(|e| SnapshotError::CreateFailed {
            label: "*".to_string(),
            reason: e.to_string(),
        })?;
        for entry in entries.flatten() {
            match fs::read_to_string(&entry).await {
                Ok(content) => match serde_json::from_str::<SnapshotPoint>(&content) {
                    Ok(point) => points.push(point),
                    Err(e) => warn!("Skipping unreadable metadata {}: {}", entry.display(), e),
                },
                Err(e) => warn!("Skipping unreadable metadata {}: {}", entry.display(), e),
            }
        }

        points.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(points)
    }

    pub async fn latest(&self) -> Result<Option<SnapshotPoint>, SnapshotError> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Restores a snapshot: verifies the archive, extracts it to a staging
    /// directory, automatically reinstates configuration files and service
    /// enablement, and reports manual follow-up steps for the rest.
    pub async fn restore(&self, snapshot_id: &str) -> Result<RestoreReport, SnapshotError> {
        let point = self.load(snapshot_id).await?;
        self.verify_archive(&point).await?;

        let restore_err = |reason: String| SnapshotError::RestoreFailed {
            id: snapshot_id.to_string(),
            reason,
        };

        let staging_dir = self
            .snapshots_dir
            .join(snapshots::RESTORE_STAGING_DIR)
            .join(&point.id);
        let _ = fs::remove_dir_all(&staging_dir).await;
        fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| restore_err(e.to_string()))?;

        info!("Restoring snapshot '{}' into {}", point.id, staging_dir.display());
        run_shell(&format!(
            "tar -xzf '{}' -C '{}'",
            point.archive_file,
            staging_dir.display()
        ))
        .await
        .map_err(|e| restore_err(format!("extraction failed: {}", e)))?;

        let files_dir = staging_dir.join("files");
        let mut subsystems = Vec::new();

        // Configuration: automatic, bit-identical copy-back
        for path in &point.contents.config_paths {
            restore_staged_path(&files_dir, Path::new(path))
                .await
                .map_err(|e| restore_err(format!("config restore of {} failed: {}", path, e)))?;
        }
        subsystems.push(SubsystemRestore {
            subsystem: "configuration".to_string(),
            action: RestoreAction::Automatic,
            detail: format!(
                "{} configuration paths restored in place",
                point.contents.config_paths.len()
            ),
        });

        // Services: automatic re-enablement from the captured list
        if point.contents.service_state {
            let detail = self.reenable_services(&staging_dir).await;
            subsystems.push(SubsystemRestore {
                subsystem: "services".to_string(),
                action: RestoreAction::Automatic,
                detail,
            });
        }

        // Packages: staged only; selections are not force-applied
        if point.contents.package_state {
            subsystems.push(SubsystemRestore {
                subsystem: "packages".to_string(),
                action: RestoreAction::ManualFollowUp,
                detail: format!(
                    "run: dpkg --set-selections < '{}' && apt-get dselect-upgrade -y",
                    staging_dir.join("packages.list").display()
                ),
            });
        }

        // User data: staged only; overwriting user files is an operator call
        if !point.contents.user_data_paths.is_empty() {
            subsystems.push(SubsystemRestore {
                subsystem: "user_data".to_string(),
                action: RestoreAction::ManualFollowUp,
                detail: format!(
                    "staged under '{}'; copy back the paths you want: {}",
                    files_dir.display(),
                    point.contents.user_data_paths.join(", ")
                ),
            });
        }

        info!("Snapshot '{}' restored", point.id);
        Ok(RestoreReport {
            snapshot_id: point.id,
            staging_dir: staging_dir.display().to_string(),
            subsystems,
        })
    }

    async fn reenable_services(&self, staging_dir: &Path) -> String {
        let services_list = staging_dir.join("services.list");
        let content = match fs::read_to_string(&services_list).await {
            Ok(content) => content,
            Err(e) => return format!("services.list unreadable: {}", e),
        };

        let mut enabled = 0u32;
        let mut failed = 0u32;
        for unit in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match run_shell(&format!("systemctl enable '{}'", unit)).await {
                Ok(_) => enabled += 1,
                Err(e) => {
                    warn!("Could not re-enable unit '{}': {}", unit, e);
                    failed += 1;
                }
            }
        }

        format!("{} units re-enabled, {} failed", enabled, failed)
    }

    /// Emergency capture after a failed rollback, before anyone touches the
    /// now-unknown state. Exempt from retention so it cannot garbage-collect
    /// the evidence.
    pub async fn emergency_snapshot(&self, description: &str) -> Result<SnapshotPoint, SnapshotError> {
        self.snapshot(snapshots::EMERGENCY_LABEL_PREFIX, description)
            .await
    }

    /// Deletes snapshots beyond the retention count, oldest first. Emergency
    /// snapshots are never counted or deleted.
    pub async fn cleanup_old_snapshots(&self) -> Result<u32, SnapshotError> {
        let points: Vec<SnapshotPoint> = self
            .list()
            .await?
            .into_iter()
            .filter(|p| p.label != snapshots::EMERGENCY_LABEL_PREFIX)
            .collect();

        if points.len() <= self.retention_count {
            return Ok(0);
        }

        let mut removed = 0u32;
        for point in &points[self.retention_count..] {
            match self.delete(&point.id).await {
                Ok(()) => {
                    info!("Deleted old snapshot '{}'", point.id);
                    removed += 1;
                }
                Err(e) => warn!("Could not delete snapshot '{}': {}", point.id, e),
            }
        }

        Ok(removed)
    }

    pub async fn delete(&self, snapshot_id: &str) -> Result<(), SnapshotError> {
        let io_err = |e: std::io::Error| SnapshotError::RestoreFailed {
            id: snapshot_id.to_string(),
            reason: e.to_string(),
        };

        match fs::remove_file(self.archive_path(snapshot_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        match fs::remove_file(self.metadata_path(snapshot_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        Ok(())
    }
}

/// Copies a path into the staging files tree with its full directory
/// structure. Returns false when the source does not exist.
async fn stage_path(path: &Path, files_dir: &Path) -> Result<bool, String> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(false);
    }
    // GNU cp rejects absolute sources with --parents, so copy relative
    // to the filesystem root.
    let relative = path.to_string_lossy().trim_start_matches('/').to_string();
    run_shell(&format!(
        "cd / && cp -a --parents '{}' '{}'",
        relative,
        files_dir.display()
    ))
    .await
    .map_err(|e| format!("staging {} failed: {}", path.display(), e))?;
    Ok(true)
}

/// Copies a staged path back to its original location, replacing whatever is
/// there now.
async fn restore_staged_path(files_dir: &Path, original: &Path) -> Result<(), String> {
    let relative = original
        .to_string_lossy()
        .trim_start_matches('/')
        .to_string();
    let staged = files_dir.join(&relative);
    if !fs::try_exists(&staged).await.unwrap_or(false) {
        return Err(format!("{} missing from archive", staged.display()));
    }

    let parent = original
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    run_shell(&format!(
        "rm -rf '{}' && mkdir -p '{}' && cp -a '{}' '{}'",
        original.display(),
        parent,
        staged.display(),
        original.display()
    ))
    .await?;
    Ok(())
}

async fn run_shell(command: &str) -> Result<String, String> {
    debug!("Executing: {}", command);
    let output = AsyncCommand::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok(stdout)
    } else {
        Err(if stderr.is_empty() { stdout } else { stderr })
    }
}

async fn sha256_file(path: &Path) -> Result<String, String> {
    let mut file = fs::File::open(path).await.map_err(|e| e.to_string())?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await.map_err(|e| e.to_string())?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_sources(config_root: &Path) -> BackupSources {
        BackupSources {
            config_paths: vec![config_root.to_path_buf()],
            user_data_paths: Vec::new(),
            capture_package_state: false,
            capture_service_state: false,
        }
    }

    async fn seed_config(root: &Path) {
        fs::create_dir_all(root.join("conf.d")).await.unwrap();
        fs::write(root.join("main.toml"), "retention = 5\n")
            .await
            .unwrap();
        fs::write(root.join("conf.d/extra.toml"), "nice = 10\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_seals_and_verifies() {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        seed_config(&config_root).await;

        let manager = BackupManager::new(dir.path().join("snapshots"), 5, test_sources(&config_root));
        let point = manager.snapshot("standard", "pre-run").await.unwrap();

        assert!(Path::new(&point.archive_file).is_file());
        assert_eq!(point.checksum_sha256.len(), 64);
        manager.verify_archive(&point).await.unwrap();

        // No staging residue
        assert!(!dir
            .path()
            .join("snapshots")
            .join(format!("{}.staging", point.id))
            .exists());
    }

    #[tokio::test]
    async fn test_tampered_archive_fails_verification() {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        seed_config(&config_root).await;

        let manager = BackupManager::new(dir.path().join("snapshots"), 5, test_sources(&config_root));
        let point = manager.snapshot("standard", "pre-run").await.unwrap();

        let mut bytes = std::fs::read(&point.archive_file).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&point.archive_file, bytes).unwrap();

        assert!(matches!(
            manager.verify_archive(&point).await,
            Err(SnapshotError::VerificationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_round_trip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        seed_config(&config_root).await;

        let manager = BackupManager::new(dir.path().join("snapshots"), 5, test_sources(&config_root));
        let point = manager.snapshot("standard", "pre-run").await.unwrap();

        // Mutate the configuration subsystem
        fs::write(config_root.join("main.toml"), "retention = 99\n")
            .await
            .unwrap();
        fs::remove_file(config_root.join("conf.d/extra.toml"))
            .await
            .unwrap();
        fs::write(config_root.join("intruder.toml"), "x = 1\n")
            .await
            .unwrap();

        let report = manager.restore(&point.id).await.unwrap();

        assert_eq!(
            fs::read_to_string(config_root.join("main.toml")).await.unwrap(),
            "retention = 5\n"
        );
        assert_eq!(
            fs::read_to_string(config_root.join("conf.d/extra.toml"))
                .await
                .unwrap(),
            "nice = 10\n"
        );
        assert!(!config_root.join("intruder.toml").exists());

        let config = report
            .subsystems
            .iter()
            .find(|s| s.subsystem == "configuration")
            .unwrap();
        assert_eq!(config.action, RestoreAction::Automatic);
    }

    #[tokio::test]
    async fn test_retention_deletes_oldest_first() {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        seed_config(&config_root).await;

        let manager = BackupManager::new(dir.path().join("snapshots"), 3, test_sources(&config_root));
        let mut ids = Vec::new();
        for i in 0..4 {
            // Spread creation times so oldest-first ordering is unambiguous
            let point = manager.snapshot("standard", &format!("run {}", i)).await.unwrap();
            ids.push(point.id);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let remaining = manager.list().await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(
            !remaining.iter().any(|p| p.id == ids[0]),
            "the oldest snapshot must be the one deleted"
        );
        assert!(remaining.iter().any(|p| p.id == ids[3]));
    }

    #[tokio::test]
    async fn test_emergency_snapshots_exempt_from_retention() {
        let dir = TempDir::new().unwrap();
        let config_root = dir.path().join("etc");
        seed_config(&config_root).await;

        let manager = BackupManager::new(dir.path().join("snapshots"), 1, test_sources(&config_root));
        let emergency = manager.emergency_snapshot("rollback failed").await.unwrap();
        for _ in 0..2 {
            manager.snapshot("standard", "run").await.unwrap();
        }

        let remaining = manager.list().await.unwrap();
        assert_eq!(remaining.len(), 2, "one regular + the emergency snapshot");
        assert!(remaining.iter().any(|p| p.id == emergency.id));
    }

    #[tokio::test]
    async fn test_restore_unknown_id_fails() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(
            dir.path().join("snapshots"),
            3,
            test_sources(&dir.path().join("etc")),
        );
        assert!(matches!(
            manager.restore("missing").await,
            Err(SnapshotError::NotFound { .. })
        ));
    }
}
