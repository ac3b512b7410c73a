//! Git adapter used to measure file-system progress.
//!
//! The supervisor never trusts the agent's own file counts alone, so each
//! iteration snapshots HEAD and the porcelain status before and after the
//! invocation and counts the paths that changed in between. Dirty paths carry
//! a blob hash of their worktree content so that re-editing an already
//! modified file still counts.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::paths::ProjectPaths;

/// Paths per `git hash-object` invocation.
const HASH_BATCH: usize = 256;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
    /// `git hash-object` of the worktree file; `None` when it is absent.
    pub fingerprint: Option<String>,
}

/// Repository state captured around one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub head: Option<String>,
    pub entries: BTreeSet<StatusEntry>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when the working directory is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Full HEAD sha, or `None` for a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!sha.is_empty()).then_some(sha))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths that differ between two commits.
    pub fn changed_between(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", from, to])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Capture HEAD and status, ignoring supervisor-owned files.
    ///
    /// Outside a repository this returns an empty snapshot.
    #[instrument(skip_all)]
    pub fn snapshot(&self) -> Result<Snapshot> {
        if !self.is_repository() {
            debug!("not a git repository, skipping snapshot");
            return Ok(Snapshot::default());
        }
        let mut entries: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !ProjectPaths::is_internal(&entry.path))
            .collect();
        self.fingerprint(&mut entries)?;
        Ok(Snapshot {
            head: self.head_sha()?,
            entries: entries.into_iter().collect(),
        })
    }

    /// Fill in blob hashes for entries whose worktree file exists.
    fn fingerprint(&self, entries: &mut [StatusEntry]) -> Result<()> {
        let mut present: Vec<&mut StatusEntry> = entries
            .iter_mut()
            .filter(|entry| self.workdir.join(&entry.path).is_file())
            .collect();
        for chunk in present.chunks_mut(HASH_BATCH) {
            let mut args = vec!["hash-object", "--"];
            args.extend(chunk.iter().map(|entry| entry.path.as_str()));
            let out = self.run_capture(&args)?;
            let hashes: Vec<&str> = out.lines().map(str::trim).collect();
            if hashes.len() != chunk.len() {
                return Err(anyhow!(
                    "git hash-object returned {} hashes for {} paths",
                    hashes.len(),
                    chunk.len()
                ));
            }
            for (entry, hash) in chunk.iter_mut().zip(hashes) {
                entry.fingerprint = Some(hash.to_string());
            }
        }
        Ok(())
    }

    /// Count distinct paths changed between two snapshots.
    ///
    /// A path counts when its status entry or content hash is new or
    /// different, or when it appears in commits made between the two HEADs.
    #[instrument(skip_all)]
    pub fn count_changes(&self, before: &Snapshot, after: &Snapshot) -> u32 {
        let mut paths: BTreeSet<String> = after
            .entries
            .difference(&before.entries)
            .map(|entry| entry.path.clone())
            .collect();

        match (&before.head, &after.head) {
            (Some(old), Some(new)) if old != new => match self.changed_between(old, new) {
                Ok(committed) => paths.extend(
                    committed
                        .into_iter()
                        .filter(|path| !ProjectPaths::is_internal(path)),
                ),
                Err(err) => warn!(err = %err, "failed to diff commits"),
            },
            (None, Some(_)) => {
                // First commit made during the iteration.
                match self.run_capture(&["ls-tree", "-r", "--name-only", "HEAD"]) {
                    Ok(out) => paths.extend(
                        out.lines()
                            .map(str::trim)
                            .filter(|path| !path.is_empty() && !ProjectPaths::is_internal(path))
                            .map(str::to_string),
                    ),
                    Err(err) => warn!(err = %err, "failed to list initial commit"),
                }
            }
            _ => {}
        }

        debug!(files_changed = paths.len(), "counted changed files");
        paths.len() as u32
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
            fingerprint: None,
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path,
        fingerprint: None,
    })
}
