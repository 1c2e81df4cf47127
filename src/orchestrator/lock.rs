//! Per-run lock files so only one process drives a run at a time.
//!
//! A lock is claimed by hard-linking a fully written staging file onto
//! `<locks_dir>/<run_id>.lock`. The link fails when the lock already exists, so
//! exactly one claimant wins and readers never see a half-written file. Every
//! holder stamps its own `owner` token and only refreshes or removes a lock file
//! that still carries it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{PilotError, Result};

/// Claim rounds before giving up. Each round past the first follows a
/// reclaimed stale lock or a lock released between the claim and the read.
const CLAIM_ROUNDS: u32 = 3;

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            owner: Uuid::new_v4().simple().to_string(),
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Locks from another host can't be probed and count as dead.
    pub fn is_process_alive(&self) -> bool {
        self.hostname == hostname() && is_process_running(self.pid)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.heartbeat_at);
        // Negative elapsed time (clock skew) counts as stale.
        elapsed.to_std().map(|d| d > threshold).unwrap_or(true)
    }

    pub fn is_valid(&self, threshold: Duration) -> bool {
        self.is_process_alive() && !self.is_stale(threshold)
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

async fn read_info(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_yaml_bw::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

pub struct RunLocks {
    locks_dir: PathBuf,
    stale_threshold: Duration,
    heartbeat_interval: Duration,
}

impl RunLocks {
    pub fn new(locks_dir: &Path, config: &OrchestratorConfig) -> Self {
        Self {
            locks_dir: locks_dir.to_path_buf(),
            stale_threshold: Duration::from_secs(config.lock_stale_threshold_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        }
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", run_id))
    }

    /// Take the run's lock, reclaiming it when the previous holder is dead or
    /// stopped heartbeating. Fails with `RunLocked` while a live holder exists.
    pub async fn acquire(&self, run_id: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.locks_dir).await?;
        let path = self.lock_path(run_id);
        let info = LockInfo::new();

        for round in 0..CLAIM_ROUNDS {
            if claim(&path, &info).await? {
                debug!(run_id, owner = %info.owner, round, "Lock acquired");
                return Ok(LockGuard::start(
                    path,
                    run_id.to_string(),
                    info.owner,
                    self.heartbeat_interval,
                ));
            }

            match read_info(&path).await {
                Ok(Some(held)) if held.is_valid(self.stale_threshold) => {
                    return Err(PilotError::RunLocked {
                        run_id: run_id.to_string(),
                        pid: held.pid,
                    });
                }
                Ok(Some(held)) => {
                    info!(run_id, old_pid = held.pid, "Reclaiming stale lock");
                    reclaim(&path, Some(&held.owner)).await?;
                }
                Ok(None) => debug!(run_id, "Lock released during claim, retrying"),
                Err(e) => {
                    warn!(run_id, error = %e, "Reclaiming unreadable lock");
                    reclaim(&path, None).await?;
                }
            }
        }

        Err(PilotError::LockAcquisitionFailed {
            run_id: run_id.to_string(),
        })
    }

    pub async fn read(&self, run_id: &str) -> Result<Option<LockInfo>> {
        read_info(&self.lock_path(run_id)).await
    }

    /// True when a live process holds a fresh lock on the run.
    pub async fn is_actively_running(&self, run_id: &str) -> bool {
        match self.read(run_id).await {
            Ok(Some(lock)) => lock.is_valid(self.stale_threshold),
            Ok(None) => false,
            Err(e) => {
                debug!(run_id, error = %e, "Unreadable lock file treated as free");
                false
            }
        }
    }
}

/// Create the lock file only if none exists. Returns false when it does.
async fn claim(path: &Path, info: &LockInfo) -> Result<bool> {
    let staging = sibling(path, &format!(".{}.claim", info.owner));
    fs::write(&staging, serde_yaml_bw::to_string(info)?).await?;

    let linked = fs::hard_link(&staging, path).await;
    if let Err(e) = fs::remove_file(&staging).await {
        debug!(path = %staging.display(), error = %e, "Failed to remove lock staging file");
    }

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Move a dead lock aside. The rename hands any given file to one reclaimer
/// only; if the file taken is not the one judged dead, it is linked back.
async fn reclaim(path: &Path, dead_owner: Option<&str>) -> Result<()> {
    let tombstone = sibling(path, &format!(".{}.stale", Uuid::new_v4().simple()));
    match fs::rename(path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let taken = read_info(&tombstone).await.ok().flatten();
    let replaced = match (&taken, dead_owner) {
        (Some(taken), Some(dead)) => taken.owner != dead,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if replaced && let Err(e) = fs::hard_link(&tombstone, path).await {
        warn!(path = %path.display(), error = %e, "Could not restore a lock claimed during reclaim");
    }

    fs::remove_file(&tombstone).await?;
    Ok(())
}

/// Held while a run is being driven. Keeps the heartbeat fresh and removes the
/// lock file on drop, unless another holder has since taken it over.
pub struct LockGuard {
    path: PathBuf,
    run_id: String,
    owner: String,
    stop: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl LockGuard {
    fn start(path: PathBuf, run_id: String, owner: String, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            path.clone(),
            run_id.clone(),
            owner.clone(),
            interval,
            stop.clone(),
        ));

        Self {
            path,
            run_id,
            owner,
            stop,
            heartbeat,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn still_owned(&self) -> std::io::Result<bool> {
        let content = std::fs::read_to_string(&self.path)?;
        let info: LockInfo = serde_yaml_bw::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(info.owner == self.owner)
    }
}

async fn heartbeat(
    path: PathBuf,
    run_id: String,
    owner: String,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => match refresh(&path, &owner).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(run_id, "Lock was taken over, stopping heartbeat");
                    break;
                }
                Err(e) => warn!(run_id, error = %e, "Heartbeat update failed"),
            },
        }
    }
}

async fn refresh(path: &Path, owner: &str) -> Result<bool> {
    let Some(mut info) = read_info(path).await? else {
        return Ok(false);
    };
    if info.owner != owner {
        return Ok(false);
    }

    info.heartbeat_at = Utc::now();
    let staging = sibling(path, &format!(".{}.beat", owner));
    fs::write(&staging, serde_yaml_bw::to_string(&info)?).await?;
    fs::rename(&staging, path).await?;
    Ok(true)
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        self.heartbeat.abort();

        match self.still_owned() {
            Ok(true) => {
                if let Err(e) = std::fs::remove_file(&self.path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(run_id = %self.run_id, error = %e, "Failed to release lock");
                }
            }
            Ok(false) => warn!(run_id = %self.run_id, "Lock held by another driver, leaving it"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Lock file unreadable on release"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio::sync::Barrier;

    use super::*;

    fn locks(dir: &TempDir) -> RunLocks {
        RunLocks::new(dir.path(), &OrchestratorConfig::default())
    }

    fn write_lock(dir: &TempDir, info: &LockInfo) {
        std::fs::write(
            dir.path().join("r-1.lock"),
            serde_yaml_bw::to_string(info).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_second_acquire_is_rejected_while_held() {
        let dir = TempDir::new().unwrap();
        let locks = locks(&dir);

        let guard = locks.acquire("r-1").await.unwrap();
        assert_eq!(guard.run_id(), "r-1");
        assert!(locks.is_actively_running("r-1").await);

        let err = locks.acquire("r-1").await.err().unwrap();
        assert!(matches!(err, PilotError::RunLocked { .. }));

        drop(guard);
        assert!(!dir.path().join("r-1.lock").exists());
        assert!(locks.acquire("r-1").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_acquires_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(locks(&dir));

        for round in 0..100 {
            let run_id = format!("r-{}", round);
            let barrier = Arc::new(Barrier::new(2));
            let mut tasks = Vec::new();
            for _ in 0..2 {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                let run_id = run_id.clone();
                tasks.push(tokio::spawn(async move {
                    barrier.wait().await;
                    locks.acquire(&run_id).await
                }));
            }

            let mut guards = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(guard) => guards.push(guard),
                    Err(e) => assert!(matches!(e, PilotError::RunLocked { .. }), "{}", e),
                }
            }
            assert_eq!(guards.len(), 1, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_dead_pid_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = locks(&dir);
        write_lock(
            &dir,
            &LockInfo {
                pid: i32::MAX as u32,
                ..LockInfo::new()
            },
        );

        assert!(!locks.is_actively_running("r-1").await);
        let guard = locks.acquire("r-1").await.unwrap();
        let held = locks.read("r-1").await.unwrap().unwrap();
        assert_eq!(held.owner, guard.owner());
    }

    #[tokio::test]
    async fn test_garbage_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = locks(&dir);
        std::fs::write(dir.path().join("r-1.lock"), "pid: [").unwrap();

        assert!(locks.acquire("r-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_leaves_a_lock_taken_over_by_another_holder() {
        let dir = TempDir::new().unwrap();
        let locks = locks(&dir);
        let guard = locks.acquire("r-1").await.unwrap();

        let other = LockInfo::new();
        write_lock(&dir, &other);
        drop(guard);

        let held = locks.read("r-1").await.unwrap().unwrap();
        assert_eq!(held.owner, other.owner);
    }

    #[test]
    fn test_stale_heartbeat() {
        let mut info = LockInfo::new();
        assert!(!info.is_stale(Duration::from_secs(60)));
        info.heartbeat_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(info.is_stale(Duration::from_secs(60)));
    }
}
