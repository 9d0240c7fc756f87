use crate::error::PatchError;
use crate::exec::patch::UnifiedDiff;
use crate::indexer::scan::{ScanOptions, walk_files};
use crate::model::WORKTREE_REVISION;
use git2::{
    ApplyLocation, Diff, IndexAddOption, ObjectType, Oid, Repository, ResetType, Signature,
    StatusOptions, TreeWalkMode, TreeWalkResult,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Applies candidate patches to a directory the session owns exclusively.
pub trait PatchApplier: Send {
    /// Directory build and test commands run in.
    fn workdir(&self) -> &Path;

    /// Restore the pristine baseline, discarding earlier attempts.
    fn reset(&mut self) -> Result<(), PatchError>;

    /// Reset, then apply `patch` on top of the baseline.
    fn apply(&mut self, patch: &UnifiedDiff) -> Result<(), PatchError>;

    /// Keep the directory on disk after the applier is dropped.
    fn persist(&mut self) {}
}

/// A throwaway copy of a repository at one revision, committed once as a
/// baseline so every attempt starts from the same tree. Removed from disk on drop unless
/// persisted.
pub struct WorkingCheckout {
    dir: Option<TempDir>,
    root: PathBuf,
    repo: Repository,
    baseline: Oid,
}

fn corrupted(context: &str, err: impl std::fmt::Display) -> PatchError {
    PatchError::CheckoutCorrupted(format!("{context}: {err}"))
}

impl WorkingCheckout {
    /// Materialize `revision` of `source` and commit it. When `source` is a
    /// git repository and `revision` names a commit, the files come from that
    /// commit's tree. Otherwise the working tree is copied, honouring ignore
    /// rules unless `no_ignore`.
    pub fn create(source: &Path, revision: &str, no_ignore: bool) -> Result<Self, PatchError> {
        let dir = tempfile::Builder::new()
            .prefix("repograph-checkout-")
            .tempdir()
            .map_err(|err| corrupted("create checkout dir", err))?;

        let (origin, files) = match export_commit(source, revision, dir.path())? {
            Some(files) => ("commit", files),
            None => ("worktree", copy_worktree(source, dir.path(), no_ignore)?),
        };

        let repo = Repository::init(dir.path()).map_err(|err| corrupted("git init", err))?;
        let baseline = commit_all(&repo).map_err(|err| corrupted("baseline commit", err))?;
        tracing::debug!(
            source = %source.display(),
            revision,
            origin,
            checkout = %dir.path().display(),
            files,
            "checkout created"
        );
        Ok(Self {
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            repo,
            baseline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn baseline(&self) -> String {
        self.baseline.to_string()
    }

    /// Paths differing from the baseline, untracked files included.
    pub fn dirty_paths(&self) -> Result<Vec<String>, PatchError> {
        let mut options = StatusOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self
            .repo
            .statuses(Some(&mut options))
            .map_err(|err| corrupted("status", err))?;
        let mut paths: Vec<String> = statuses
            .iter()
            .filter(|entry| !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// Write the tree of the commit `revision` resolves to under `dest`.
/// `None` when `source` is not a git repository or `revision` is not a commit
/// there. Symlinks and submodules are left out.
fn export_commit(source: &Path, revision: &str, dest: &Path) -> Result<Option<usize>, PatchError> {
    if revision == WORKTREE_REVISION {
        return Ok(None);
    }
    let Ok(repo) = Repository::open(source) else {
        return Ok(None);
    };
    let Some(commit) = repo
        .revparse_single(revision)
        .ok()
        .and_then(|object| object.peel_to_commit().ok())
    else {
        tracing::debug!(revision, "revision is not a commit, copying the working tree");
        return Ok(None);
    };
    let tree = commit.tree().map_err(|err| corrupted("read commit tree", err))?;

    let mut blobs: Vec<(String, Oid)> = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        let is_file = entry.kind() == Some(ObjectType::Blob) && entry.filemode() != 0o120000;
        if let (true, Some(name)) = (is_file, entry.name()) {
            blobs.push((format!("{dir}{name}"), entry.id()));
        }
        TreeWalkResult::Ok
    })
    .map_err(|err| corrupted("walk commit tree", err))?;

    for (rel, id) in &blobs {
        let blob = repo
            .find_blob(*id)
            .map_err(|err| corrupted(&format!("read {rel}"), err))?;
        let path = dest.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| corrupted("create dir", err))?;
        }
        fs::write(&path, blob.content()).map_err(|err| corrupted(&format!("write {rel}"), err))?;
    }
    Ok(Some(blobs.len()))
}

fn copy_worktree(source: &Path, dest: &Path, no_ignore: bool) -> Result<usize, PatchError> {
    let mut copied = 0usize;
    for path in walk_files(source, ScanOptions::new(no_ignore)) {
        let Ok(rel) = path.strip_prefix(source) else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| corrupted("create dir", err))?;
        }
        fs::copy(&path, &target)
            .map_err(|err| corrupted(&format!("copy {}", rel.display()), err))?;
        copied += 1;
    }
    Ok(copied)
}

fn commit_all(repo: &Repository) -> Result<Oid, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("repograph", "repograph@localhost")?;
    repo.commit(Some("HEAD"), &sig, &sig, "baseline", &tree, &[])
}

impl PatchApplier for WorkingCheckout {
    fn workdir(&self) -> &Path {
        &self.root
    }

    fn reset(&mut self) -> Result<(), PatchError> {
        let commit = self
            .repo
            .find_commit(self.baseline)
            .map_err(|err| corrupted("find baseline", err))?;
        self.repo
            .reset(commit.as_object(), ResetType::Hard, None)
            .map_err(|err| corrupted("hard reset", err))?;

        let mut options = StatusOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let untracked: Vec<String> = self
            .repo
            .statuses(Some(&mut options))
            .map_err(|err| corrupted("status", err))?
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        for rel in untracked {
            let path = self.root.join(&rel);
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|err| corrupted(&format!("clean {rel}"), err))?;
        }

        let leftover = self.dirty_paths()?;
        if !leftover.is_empty() {
            return Err(PatchError::CheckoutCorrupted(format!(
                "checkout still dirty after reset: {}",
                leftover.join(", ")
            )));
        }
        Ok(())
    }

    fn apply(&mut self, patch: &UnifiedDiff) -> Result<(), PatchError> {
        self.reset()?;
        let rendered = patch.render();
        let diff = Diff::from_buffer(rendered.as_bytes())
            .map_err(|err| PatchError::Malformed(err.message().to_string()))?;
        self.repo
            .apply(&diff, ApplyLocation::WorkDir, None)
            .map_err(|err| PatchError::DoesNotApply(err.message().to_string()))
    }

    #[allow(deprecated)]
    fn persist(&mut self) {
        if let Some(dir) = self.dir.take() {
            let kept = dir.into_path();
            tracing::debug!(checkout = %kept.display(), "checkout kept");
        }
    }
}
