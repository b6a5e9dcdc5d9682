//! Git bedrock: a working tree with commit or pull-request write workflow.
//!
//! Extends the unix bedrock by composition. Every mutation runs under the
//! per-bedrock git mutex: stage, commit (a no-op diff is success, not an
//! error), and push when a remote is configured. In pull-request mode the
//! write lands on a fresh branch, a PR is opened through an external helper
//! command, and a `pending_pr` lock guards the path until the PR resolves.
//!
//! Git runs as a subprocess; the program name comes from
//! `NIMSFOREST_GIT_BIN` (default `git`), the PR helper from
//! `NIMSFOREST_PR_BIN` (default `gh`).

use std::env;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use nimsforest_types::{
    BedrockFileInfo, BedrockKind, BedrockManifest, ForestError, LockType,
};
use tracing::{info, warn};

use super::lock::{LockManager, WRITE_LOCK_TTL};
use super::{Bedrock, UnixBedrock};
use crate::cancel::CancelToken;
use crate::config::{BedrockConfig, PrSettings};
use crate::soil::Soil;
use crate::wind::Wind;

const DEFAULT_BRANCH: &str = "main";

/// How writes reach the repository history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitWriteMode {
    Commit,
    PullRequest,
}

impl GitWriteMode {
    fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("commit") => Ok(GitWriteMode::Commit),
            Some("pull_request") => Ok(GitWriteMode::PullRequest),
            Some(other) => bail!("write_mode must be commit or pull_request, got {:?}", other),
        }
    }
}

pub struct GitBedrock {
    unix: UnixBedrock,
    remote: Option<String>,
    branch: String,
    write_mode: GitWriteMode,
    pr: PrSettings,
    locks: Option<LockManager>,
    git_mutex: Mutex<()>,
}

impl GitBedrock {
    pub fn new(config: &BedrockConfig, soil: Option<Soil>) -> Result<Self> {
        let write_mode = GitWriteMode::parse(config.write_mode.as_deref())
            .with_context(|| format!("bedrock {}", config.name))?;
        Ok(Self {
            unix: UnixBedrock::new(config)?,
            remote: config.remote.clone(),
            branch: config
                .branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            write_mode,
            pr: config.pr.clone().unwrap_or_default(),
            locks: soil.map(LockManager::new),
            git_mutex: Mutex::new(()),
        })
    }

    pub fn write_mode(&self) -> GitWriteMode {
        self.write_mode
    }

    fn root(&self) -> &Path {
        self.unix.root()
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new(git_program())
            .args(args)
            .current_dir(self.root())
            .output()
            .context("failed to execute git; is git installed?")?;
        if !out.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn has_worktree(&self) -> bool {
        self.root().join(".git").exists()
    }

    /// Clone the remote (single branch) when no working tree exists yet.
    fn ensure_worktree(&self) -> Result<()> {
        if self.has_worktree() {
            return Ok(());
        }
        let remote = match &self.remote {
            Some(remote) => remote,
            None => bail!(
                "bedrock {} has no working tree at {} and no remote to clone",
                self.unix.name(),
                self.root().display()
            ),
        };
        info!(bedrock = %self.unix.name(), remote = %remote, "cloning working tree");
        let out = Command::new(git_program())
            .args([
                "clone",
                "--single-branch",
                "--branch",
                &self.branch,
                remote,
                ".",
            ])
            .current_dir(self.root())
            .output()
            .context("failed to execute git clone")?;
        if !out.status.success() {
            bail!(
                "git clone failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    /// Fetch and hard-reset to the remote branch. Failures downgrade to a
    /// warning; the bedrock starts with whatever is on disk.
    fn sync(&self) {
        if self.remote.is_none() {
            return;
        }
        let _guard = self.git_mutex.lock().unwrap();
        if let Err(e) = self
            .run_git(&["fetch", "origin", &self.branch])
            .and_then(|_| self.run_git(&["reset", "--hard", &format!("origin/{}", self.branch)]))
        {
            warn!(
                bedrock = %self.unix.name(),
                "sync failed, starting with on-disk state: {:#}", e
            );
        }
    }

    fn commit_staged(&self, message: &str) -> Result<()> {
        let out = Command::new(git_program())
            .args(["commit", "-m", message])
            .current_dir(self.root())
            .output()
            .context("failed to execute git commit")?;
        if out.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
            return Ok(());
        }
        bail!("git commit failed: {}", stderr.trim());
    }

    fn push(&self, refspec: &str, set_upstream: bool) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        if set_upstream {
            self.run_git(&["push", "-u", "origin", refspec])?;
        } else {
            self.run_git(&["push", "origin", refspec])?;
        }
        Ok(())
    }

    fn acquire_write_lock(&self, rel: &str) -> Result<Option<ReleaseOnDrop<'_>>> {
        match &self.locks {
            None => Ok(None),
            Some(locks) => {
                locks.acquire(
                    self.unix.name(),
                    rel,
                    &LockManager::holder_identity(),
                    LockType::Write,
                    WRITE_LOCK_TTL,
                    None,
                )?;
                Ok(Some(ReleaseOnDrop {
                    locks,
                    bedrock: self.unix.name().to_string(),
                    path: rel.to_string(),
                }))
            }
        }
    }

    /// Write in commit mode: one critical section of stage, commit, push.
    fn write_commit(&self, rel: &str, data: &[u8], message: Option<&str>) -> Result<()> {
        let _guard = self.git_mutex.lock().unwrap();
        let _lock = self.acquire_write_lock(rel)?;
        self.unix.write(rel, data, None)?;
        self.run_git(&["add", rel])?;
        let fallback = format!("Update {}", rel);
        self.commit_staged(message.unwrap_or(&fallback))?;
        self.push(&self.branch, false)
    }

    /// Write in pull-request mode: branch, commit, push, open the PR, then
    /// return to the base branch holding a `pending_pr` lock.
    fn write_pull_request(&self, rel: &str, data: &[u8], message: Option<&str>) -> Result<()> {
        let _guard = self.git_mutex.lock().unwrap();

        let base = self.pr.base_branch.clone().unwrap_or_else(|| self.branch.clone());
        let prefix = self.pr.branch_prefix.as_deref().unwrap_or("");
        let branch = format!(
            "{}update-{}-{}",
            prefix,
            safe_path(rel),
            Utc::now().timestamp()
        );

        self.run_git(&["checkout", "-b", &branch])?;
        let result = (|| -> Result<String> {
            self.unix.write(rel, data, None)?;
            self.run_git(&["add", rel])?;
            let fallback = format!("Update {}", rel);
            self.commit_staged(message.unwrap_or(&fallback))?;
            self.push(&branch, true)?;
            self.open_pr(rel, &base, &branch)
        })();

        // Always try to get back onto the base branch.
        if let Err(e) = self.run_git(&["checkout", &base]) {
            warn!(bedrock = %self.unix.name(), "failed to return to {}: {:#}", base, e);
        }

        let pr_ref = result?;
        if let Some(locks) = &self.locks {
            locks.acquire(
                self.unix.name(),
                rel,
                &LockManager::holder_identity(),
                LockType::PendingPr,
                WRITE_LOCK_TTL,
                Some(pr_ref.clone()),
            )?;
        }
        info!(bedrock = %self.unix.name(), pr = %pr_ref, "opened pull request");
        Ok(())
    }

    fn open_pr(&self, rel: &str, base: &str, branch: &str) -> Result<String> {
        let title = self
            .pr
            .title
            .clone()
            .unwrap_or_else(|| format!("Update {}", rel));
        let body = self
            .pr
            .body
            .clone()
            .unwrap_or_else(|| format!("Automated update of `{}`.", rel));

        let mut cmd = Command::new(pr_program());
        cmd.args(["pr", "create", "--base", base, "--head", branch])
            .args(["--title", &title, "--body", &body])
            .current_dir(self.root());
        for reviewer in &self.pr.reviewers {
            cmd.args(["--reviewer", reviewer]);
        }
        for label in &self.pr.labels {
            cmd.args(["--label", label]);
        }

        let out = cmd
            .output()
            .context("failed to execute PR helper; is it installed?")?;
        if !out.status.success() {
            bail!(
                "PR helper failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Observe PR resolution for `rel`: release the `pending_pr` lock so
    /// writers may proceed. Poller or webhook, whichever collaborator sees
    /// the merge/close first, calls this.
    pub fn resolve_pr(&self, rel: &str) -> Result<()> {
        if let Some(locks) = &self.locks {
            locks.release(self.unix.name(), rel)?;
        }
        Ok(())
    }
}

/// Releases a write lock when the critical section ends.
struct ReleaseOnDrop<'a> {
    locks: &'a LockManager,
    bedrock: String,
    path: String,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(&self.bedrock, &self.path) {
            warn!(bedrock = %self.bedrock, path = %self.path, "failed to release lock: {:#}", e);
        }
    }
}

impl Bedrock for GitBedrock {
    fn name(&self) -> &str {
        self.unix.name()
    }

    fn kind(&self) -> BedrockKind {
        BedrockKind::Git
    }

    fn read_only(&self) -> bool {
        self.unix.read_only()
    }

    fn manifest(&self) -> Result<BedrockManifest> {
        let mut manifest = self.unix.manifest()?;
        manifest.kind = BedrockKind::Git;
        manifest.remote = self.remote.clone();
        manifest.branch = Some(self.branch.clone());
        Ok(manifest)
    }

    fn list(&self, rel: &str) -> Result<Vec<BedrockFileInfo>> {
        self.unix.list(rel)
    }

    fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.unix.read(rel)
    }

    fn stat(&self, rel: &str) -> Result<BedrockFileInfo> {
        self.unix.stat(rel)
    }

    fn write(&self, rel: &str, data: &[u8], message: Option<&str>) -> Result<()> {
        if self.read_only() {
            return Err(ForestError::ReadOnly.into());
        }
        // Path safety before any git work.
        self.unix.resolve(rel)?;
        match self.write_mode {
            GitWriteMode::Commit => self.write_commit(rel, data, message),
            GitWriteMode::PullRequest => self.write_pull_request(rel, data, message),
        }
    }

    fn delete(&self, rel: &str, message: Option<&str>) -> Result<()> {
        if self.read_only() {
            return Err(ForestError::ReadOnly.into());
        }
        self.unix.resolve(rel)?;
        let _guard = self.git_mutex.lock().unwrap();
        let _lock = self.acquire_write_lock(rel)?;
        self.unix.delete(rel, None)?;
        self.run_git(&["add", "-A", rel])?;
        let fallback = format!("Delete {}", rel);
        self.commit_staged(message.unwrap_or(&fallback))?;
        self.push(&self.branch, false)
    }

    fn rename(&self, from: &str, to: &str, message: Option<&str>) -> Result<()> {
        if self.read_only() {
            return Err(ForestError::ReadOnly.into());
        }
        self.unix.resolve(from)?;
        self.unix.resolve(to)?;
        let _guard = self.git_mutex.lock().unwrap();
        let _lock = self.acquire_write_lock(from)?;
        self.unix.rename(from, to, None)?;
        self.run_git(&["add", "-A"])?;
        let fallback = format!("Move {} to {}", from, to);
        self.commit_staged(message.unwrap_or(&fallback))?;
        self.push(&self.branch, false)
    }

    fn tree(&self, max_depth: usize) -> Result<String> {
        self.unix.tree(max_depth)
    }

    fn start(&mut self, wind: &Wind, cancel: CancelToken) -> Result<()> {
        self.ensure_worktree()?;
        self.sync();
        self.unix.start(wind, cancel)
    }

    fn stop(&mut self) {
        self.unix.stop();
    }
}

fn git_program() -> String {
    env::var("NIMSFOREST_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn pr_program() -> String {
    env::var("NIMSFOREST_PR_BIN").unwrap_or_else(|_| "gh".to_string())
}

/// Branch-name-safe form of a relative path.
fn safe_path(rel: &str) -> String {
    rel.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn git_config(dir: &Path) -> BedrockConfig {
        BedrockConfig {
            name: "repo".to_string(),
            kind: "git".to_string(),
            path: dir.join("worktree"),
            ..Default::default()
        }
    }

    /// Initialize a local repository the way a deployment would hand one to
    /// the forest: already cloned, identity configured.
    fn init_repo(root: &Path) {
        std::fs::create_dir_all(root).expect("mkdir");
        for args in [
            vec!["init", "--initial-branch", "main"],
            vec!["config", "user.email", "forest@example.com"],
            vec!["config", "user.name", "Forest"],
        ] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(root)
                .output()
                .expect("git");
            assert!(out.status.success(), "git {:?} failed", args);
        }
        std::fs::write(root.join("seed.txt"), b"seed").expect("seed");
        for args in [vec!["add", "."], vec!["commit", "-m", "seed"]] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(root)
                .output()
                .expect("git");
            assert!(out.status.success(), "git {:?} failed", args);
        }
    }

    fn git_stdout(root: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .expect("git");
        assert!(out.status.success());
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[test]
    fn parse_write_mode_accepts_known_values() {
        assert_eq!(GitWriteMode::parse(None).unwrap(), GitWriteMode::Commit);
        assert_eq!(
            GitWriteMode::parse(Some("commit")).unwrap(),
            GitWriteMode::Commit
        );
        assert_eq!(
            GitWriteMode::parse(Some("pull_request")).unwrap(),
            GitWriteMode::PullRequest
        );
        assert!(GitWriteMode::parse(Some("merge")).is_err());
    }

    #[test]
    fn safe_path_flattens_separators() {
        assert_eq!(safe_path("docs/notes.md"), "docs-notes-md");
        assert_eq!(safe_path("a_b-c"), "a_b-c");
    }

    #[test]
    fn write_commit_creates_a_commit() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);

        let bedrock = GitBedrock::new(&config, None).expect("new");
        bedrock
            .write("notes/today.md", b"# Notes", Some("Add notes"))
            .expect("write");

        assert_eq!(
            git_stdout(&config.path, &["log", "-1", "--format=%s"]),
            "Add notes"
        );
        assert_eq!(git_stdout(&config.path, &["status", "--porcelain"]), "");
    }

    #[test]
    fn write_without_message_uses_fallback() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);

        let bedrock = GitBedrock::new(&config, None).expect("new");
        bedrock.write("a.txt", b"data", None).expect("write");
        assert_eq!(
            git_stdout(&config.path, &["log", "-1", "--format=%s"]),
            "Update a.txt"
        );
    }

    #[test]
    fn unchanged_write_is_success_not_error() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);

        let bedrock = GitBedrock::new(&config, None).expect("new");
        bedrock.write("same.txt", b"identical", None).expect("first");
        // Same content again: `nothing to commit` is treated as success.
        bedrock.write("same.txt", b"identical", None).expect("second");
    }

    #[test]
    fn delete_commits_the_removal() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);

        let bedrock = GitBedrock::new(&config, None).expect("new");
        bedrock.write("doomed.txt", b"bye", None).expect("write");
        bedrock.delete("doomed.txt", None).expect("delete");

        assert_eq!(
            git_stdout(&config.path, &["log", "-1", "--format=%s"]),
            "Delete doomed.txt"
        );
        assert!(!config.path.join("doomed.txt").exists());
    }

    #[test]
    fn path_safety_applies_before_git() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);

        let bedrock = GitBedrock::new(&config, None).expect("new");
        let err = bedrock.write("../outside.txt", b"x", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForestError>(),
            Some(ForestError::InvalidPath(_))
        ));
    }

    #[test]
    fn write_takes_and_releases_soil_lock() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);
        let soil = Soil::open(&td.path().join("soil")).expect("soil");

        let bedrock = GitBedrock::new(&config, Some(soil.clone())).expect("new");
        bedrock.write("locked.txt", b"data", None).expect("write");

        // Lock released after the critical section.
        let locks = LockManager::new(soil);
        assert!(locks.get("repo", "locked.txt").expect("get").is_none());
    }

    #[test]
    fn missing_worktree_without_remote_fails_start() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        // No init: bare directory, no remote configured.
        let mut bedrock = GitBedrock::new(&config, None).expect("new");
        let wind = crate::wind::Wind::new(crate::wind::Bus::new());
        let err = bedrock.start(&wind, CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("no remote"));
    }

    #[test]
    fn manifest_reports_git_kind_and_branch() {
        let td = tempdir().expect("tempdir");
        let config = git_config(td.path());
        init_repo(&config.path);
        let bedrock = GitBedrock::new(&config, None).expect("new");
        let manifest = bedrock.manifest().expect("manifest");
        assert_eq!(manifest.kind, BedrockKind::Git);
        assert_eq!(manifest.branch.as_deref(), Some("main"));
    }
}
