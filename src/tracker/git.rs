use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use fs2::FileExt;
use git2::{Index, IndexEntry, IndexTime, Oid, Repository, Signature};
use tracing::warn;

use crate::errors::FinalizeError;

/// Lock file inside the git directory serialising mender commits on one repository.
const COMMIT_LOCK_FILE: &str = "mender-commit.lock";

/// How far back from HEAD an earlier commit of the same issue is looked for.
const REUSE_SEARCH_DEPTH: usize = 500;

const MODE_BLOB: u32 = 0o100644;
const MODE_BLOB_EXECUTABLE: u32 = 0o100755;

/// Produces the single version-control commit of a RESOLVED issue.
///
/// Each commit's tree is HEAD's tree plus exactly the given paths, built in an
/// in-memory index, so whatever else sits in the shared index or working tree
/// never leaks into it. Commits from concurrent finalizations are serialised
/// through a lock file in the git directory.
pub struct GitCommitter {
    repo: Repository,
    workdir: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitCommitter {
    pub fn open(project_dir: &Path) -> Result<Self, FinalizeError> {
        let repo = Repository::open(project_dir)
            .map_err(|e| FinalizeError::Commit(format!("Failed to open git repository: {}", e)))?;
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| FinalizeError::Commit("Repository has no working directory".into()))?;
        Ok(Self {
            repo,
            workdir,
            author_name: "mender".to_string(),
            author_email: "mender@localhost".to_string(),
        })
    }

    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        self.author_name = name.to_string();
        self.author_email = email.to_string();
        self
    }

    /// Commit exactly `paths` (relative to the working directory) with `message`.
    ///
    /// If a recent commit on HEAD already carries `message` it is returned
    /// instead, so retrying a finalize that crashed after committing never
    /// commits twice.
    pub fn commit_paths(&self, paths: &[PathBuf], message: &str) -> Result<String, FinalizeError> {
        let _lock = self.lock()?;

        if let Some(existing) = self.find_commit_by_message(message) {
            return Ok(existing.to_string());
        }

        let head = self.get_head_commit();
        let mut index = Index::new().map_err(commit_error)?;
        if let Some(head) = &head {
            index
                .read_tree(&head.tree().map_err(commit_error)?)
                .map_err(commit_error)?;
        }

        for path in paths {
            let key = index_key(path)?;
            let absolute = self.workdir.join(path);
            if absolute.is_file() {
                let id = self.repo.blob_path(&absolute).map_err(commit_error)?;
                let mode = index
                    .get_path(Path::new(&key), 0)
                    .map(|entry| entry.mode)
                    .unwrap_or_else(|| file_mode(&absolute));
                let size = absolute.metadata().map(|m| m.len()).unwrap_or(0);
                index.add(&blob_entry(&key, id, mode, size)).map_err(commit_error)?;
            } else if index.get_path(Path::new(&key), 0).is_some() {
                // Deleted by IMPLEMENT; drop it from the tree.
                index.remove(Path::new(&key), 0).map_err(commit_error)?;
            }
        }

        let tree_id = index.write_tree_to(&self.repo).map_err(commit_error)?;
        let tree = self.repo.find_tree(tree_id).map_err(commit_error)?;
        let sig = Signature::now(&self.author_name, &self.author_email).map_err(commit_error)?;

        // Handle unborn branch (new repo with no commits yet)
        let parents: Vec<&git2::Commit<'_>> = head.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(commit_error)?;

        self.sync_worktree_index(paths);
        Ok(commit_id.to_string())
    }

    /// Move the branch back off `sha` if it is still HEAD. Returns whether it did.
    ///
    /// Used when the archive step fails after committing, so the commit does not
    /// outlive the unfinished finalization.
    pub fn revert_head(&self, sha: &str) -> Result<bool, FinalizeError> {
        let _lock = self.lock()?;

        let Ok(mut head) = self.repo.head() else {
            return Ok(false);
        };
        let commit = head.peel_to_commit().map_err(commit_error)?;
        if commit.id().to_string() != sha {
            return Ok(false);
        }

        match commit.parent(0) {
            Ok(parent) => {
                head.set_target(parent.id(), "mender: roll back unarchived finalize")
                    .map_err(commit_error)?;
            }
            // Root commit: the branch becomes unborn again.
            Err(_) => head.delete().map_err(commit_error)?,
        }
        Ok(true)
    }

    /// Take the repository-wide commit lock. Released when the file is dropped.
    fn lock(&self) -> Result<File, FinalizeError> {
        let path = self.repo.path().join(COMMIT_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| FinalizeError::Commit(format!("{}: {}", path.display(), e)))?;
        file.lock_exclusive()
            .map_err(|e| FinalizeError::Commit(format!("{}: {}", path.display(), e)))?;
        Ok(file)
    }

    fn find_commit_by_message(&self, message: &str) -> Option<Oid> {
        self.get_head_commit()?;
        let mut walk = self.repo.revwalk().ok()?;
        walk.push_head().ok()?;
        walk.simplify_first_parent().ok()?;
        walk.filter_map(Result::ok)
            .take(REUSE_SEARCH_DEPTH)
            .find(|oid| {
                self.repo
                    .find_commit(*oid)
                    .map(|c| c.message() == Some(message))
                    .unwrap_or(false)
            })
    }

    /// Bring the shared index in line with the new HEAD for `paths` only.
    fn sync_worktree_index(&self, paths: &[PathBuf]) {
        let result = self.repo.index().and_then(|mut index| {
            index.read(false)?;
            for path in paths {
                if self.workdir.join(path).is_file() {
                    index.add_path(path)?;
                } else if index.get_path(path, 0).is_some() {
                    index.remove_path(path)?;
                }
            }
            index.write()
        });
        if let Err(e) = result {
            warn!(error = %e.message(), "failed to update the working index after commit");
        }
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }
}

/// Index key of a working-tree path: `/`-separated, relative and without `..`.
fn index_key(path: &Path) -> Result<String, FinalizeError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                FinalizeError::Commit(format!("non UTF-8 path {}", path.display()))
            })?),
            Component::CurDir => {}
            _ => {
                return Err(FinalizeError::Commit(format!(
                    "path {} is not inside the repository",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(FinalizeError::Commit("empty path".into()));
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    match path.metadata() {
        Ok(meta) if meta.permissions().mode() & 0o111 != 0 => MODE_BLOB_EXECUTABLE,
        _ => MODE_BLOB,
    }
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    MODE_BLOB
}

fn blob_entry(key: &str, id: Oid, mode: u32, size: u64) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: size as u32,
        id,
        flags: key.len().min(0xfff) as u16,
        flags_extended: 0,
        path: key.as_bytes().to_vec(),
    }
}

fn commit_error(e: git2::Error) -> FinalizeError {
    FinalizeError::Commit(e.message().to_string())
}
