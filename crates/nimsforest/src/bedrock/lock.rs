//! Distributed bedrock locks over soil CAS.
//!
//! A lock is a soil entry at `bedrock:<name>:lock:<path>`. Acquisition is a
//! real compare-and-set: create at revision 0, or take over an expired write
//! lock at its observed revision. Losing the CAS race means someone else
//! holds the lock. `pending_pr` locks never expire by time; they are
//! released when the PR resolves.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use nimsforest_types::{BedrockLock, ForestError, LockType};
use tracing::debug;

use crate::soil::Soil;

/// Write locks are short-lived; holders should renew if work runs long.
pub const WRITE_LOCK_TTL: Duration = Duration::from_secs(30);

/// Manages the distributed locks of one or more bedrocks.
#[derive(Clone)]
pub struct LockManager {
    soil: Soil,
}

impl LockManager {
    pub fn new(soil: Soil) -> Self {
        Self { soil }
    }

    /// Identity of this process as a lock holder: `<hostname>:<pid>`.
    pub fn holder_identity() -> String {
        format!(
            "{}:{}",
            gethostname::gethostname().to_string_lossy(),
            std::process::id()
        )
    }

    fn key(bedrock: &str, path: &str) -> String {
        format!("bedrock:{}:lock:{}", bedrock, path)
    }

    /// Acquire a lock on `path` within `bedrock`.
    ///
    /// Errors: `locked by <holder>` while a live write lock is held elsewhere;
    /// `awaiting PR approval` while a pending-PR lock exists.
    pub fn acquire(
        &self,
        bedrock: &str,
        path: &str,
        holder: &str,
        lock_type: LockType,
        ttl: Duration,
        pr_ref: Option<String>,
    ) -> Result<BedrockLock> {
        let key = Self::key(bedrock, path);
        let now = Utc::now();
        let lock = BedrockLock {
            holder: holder.to_string(),
            lock_type,
            acquired_at: now,
            ttl_seconds: ttl.as_secs(),
            pr_ref,
            expires_at: match lock_type {
                LockType::Write => Some(now + chrono::Duration::seconds(ttl.as_secs() as i64)),
                LockType::PendingPr => None,
            },
        };
        let data = serde_json::to_vec(&lock)?;

        match self.soil.dig(&key)? {
            None => {
                // Vacant: create-only. A CAS loss means someone else raced us
                // in; report the lock as held.
                match self.soil.bury(&key, &data, 0) {
                    Ok(_) => Ok(lock),
                    Err(e) if is_conflict(&e) => self.report_held(&key),
                    Err(e) => Err(e),
                }
            }
            Some((existing, revision)) => {
                let current: BedrockLock = serde_json::from_slice(&existing)?;
                if current.is_expired(now) {
                    debug!(key = %key, holder = %current.holder, "taking over expired lock");
                    match self.soil.bury(&key, &data, revision) {
                        Ok(_) => Ok(lock),
                        Err(e) if is_conflict(&e) => self.report_held(&key),
                        Err(e) => Err(e),
                    }
                } else {
                    Err(held_error(&current))
                }
            }
        }
    }

    fn report_held(&self, key: &str) -> Result<BedrockLock> {
        match self.soil.dig(key)? {
            Some((data, _)) => {
                let current: BedrockLock = serde_json::from_slice(&data)?;
                Err(held_error(&current))
            }
            // Released between our write and re-read; surface as a generic
            // holder so callers retry.
            None => Err(ForestError::Locked {
                holder: "unknown".to_string(),
            }
            .into()),
        }
    }

    /// Release the lock on `path`, if any.
    pub fn release(&self, bedrock: &str, path: &str) -> Result<()> {
        let key = Self::key(bedrock, path);
        match self.soil.dig(&key)? {
            None => Ok(()),
            Some((_, revision)) => self.soil.delete(&key, revision),
        }
    }

    /// Current lock on `path`, if any.
    pub fn get(&self, bedrock: &str, path: &str) -> Result<Option<BedrockLock>> {
        match self.soil.dig(&Self::key(bedrock, path))? {
            None => Ok(None),
            Some((data, _)) => Ok(Some(serde_json::from_slice(&data)?)),
        }
    }
}

fn held_error(lock: &BedrockLock) -> anyhow::Error {
    match lock.lock_type {
        LockType::Write => ForestError::Locked {
            holder: lock.holder.clone(),
        }
        .into(),
        LockType::PendingPr => ForestError::AwaitingPrApproval {
            pr_ref: lock.pr_ref.clone().unwrap_or_else(|| "unknown".to_string()),
        }
        .into(),
    }
}

fn is_conflict(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ForestError>(),
        Some(ForestError::RevisionConflict { .. })
    )
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn manager(dir: &std::path::Path) -> LockManager {
        LockManager::new(Soil::open(dir).expect("open"))
    }

    #[test]
    fn acquire_vacant_lock_succeeds() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        let lock = locks
            .acquire("docs", "notes.md", "host:1", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("acquire");
        assert_eq!(lock.holder, "host:1");
        assert!(lock.expires_at.is_some());
    }

    #[test]
    fn second_acquire_reports_holder() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        locks
            .acquire("docs", "notes.md", "host:1", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("acquire");

        let err = locks
            .acquire("docs", "notes.md", "host:2", LockType::Write, WRITE_LOCK_TTL, None)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ForestError>(),
            Some(&ForestError::Locked {
                holder: "host:1".to_string()
            })
        );
    }

    #[test]
    fn expired_write_lock_is_taken_over() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        locks
            .acquire(
                "docs",
                "notes.md",
                "host:1",
                LockType::Write,
                Duration::ZERO,
                None,
            )
            .expect("acquire");

        std::thread::sleep(Duration::from_millis(1100));
        let lock = locks
            .acquire("docs", "notes.md", "host:2", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("take over");
        assert_eq!(lock.holder, "host:2");
    }

    #[test]
    fn pending_pr_lock_blocks_with_pr_reference() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        locks
            .acquire(
                "docs",
                "notes.md",
                "host:1",
                LockType::PendingPr,
                WRITE_LOCK_TTL,
                Some("org/repo#42".to_string()),
            )
            .expect("acquire");

        let err = locks
            .acquire("docs", "notes.md", "host:2", LockType::Write, WRITE_LOCK_TTL, None)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ForestError>(),
            Some(&ForestError::AwaitingPrApproval {
                pr_ref: "org/repo#42".to_string()
            })
        );
    }

    #[test]
    fn release_then_reacquire() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        locks
            .acquire("docs", "notes.md", "host:1", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("acquire");
        locks.release("docs", "notes.md").expect("release");
        locks
            .acquire("docs", "notes.md", "host:2", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("reacquire");
    }

    #[test]
    fn release_of_unheld_lock_is_ok() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        locks.release("docs", "unheld.md").expect("release");
    }

    #[test]
    fn get_returns_current_lock() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());
        assert!(locks.get("docs", "notes.md").expect("get").is_none());
        locks
            .acquire("docs", "notes.md", "host:1", LockType::Write, WRITE_LOCK_TTL, None)
            .expect("acquire");
        let lock = locks.get("docs", "notes.md").expect("get").expect("present");
        assert_eq!(lock.holder, "host:1");
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let td = tempdir().expect("tempdir");
        let locks = manager(td.path());

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = locks.clone();
            handles.push(std::thread::spawn(move || {
                locks
                    .acquire(
                        "docs",
                        "contested.md",
                        &format!("host:{}", i),
                        LockType::Write,
                        WRITE_LOCK_TTL,
                        None,
                    )
                    .is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
