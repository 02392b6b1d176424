//! In-memory version-control transport for tests.
//!
//! [`FakeVcs`] implements [`VcsTransport`] over a commit DAG held in memory.
//! Working trees are real directories: checkouts write files to disk and the
//! status is computed by comparing the directory with the checked-out tree, so
//! catalog scanning works unchanged on top of the fake.
//!
//! Remotes are keyed by URL. Each local working copy carries a marker file in
//! `.git/` naming its in-memory record, so working copies survive being
//! renamed (as the clone manager does when promoting a staging clone).
//!
//! Failure injection: [`FakeVcs::set_offline`], [`FakeVcs::set_auth_failure`],
//! [`FakeVcs::fail_next`] and [`FakeVcs::set_latency`]. Every executed
//! operation is counted by [`GitOp::name`].

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use walkdir::WalkDir;

use crate::core::BkstgError;
use crate::git::{GitOp, GitOutput, MergeOutcome, VcsTransport};

const MARKER_FILE: &str = "FAKE_REPO";

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Commit {
    parents: Vec<String>,
    tree: Tree,
    depth: usize,
}

#[derive(Debug, Clone)]
struct LocalRepo {
    url: String,
    current: String,
    branches: HashMap<String, String>,
    tracking: HashMap<String, String>,
    sparse: Vec<String>,
    unmerged: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    commits: HashMap<String, Commit>,
    remotes: HashMap<String, HashMap<String, String>>,
    repos: HashMap<String, LocalRepo>,
    next_id: u64,
    offline: bool,
    auth_failure: bool,
    latency: Duration,
    injected: HashMap<String, VecDeque<BkstgError>>,
    calls: HashMap<String, usize>,
}

impl State {
    fn new_commit(&mut self, parents: Vec<String>, tree: Tree) -> String {
        self.next_id += 1;
        let id = hex::encode(Sha256::digest(format!("commit-{}", self.next_id).as_bytes()))[..40]
            .to_string();
        let depth = parents
            .iter()
            .filter_map(|p| self.commits.get(p))
            .map(|c| c.depth + 1)
            .max()
            .unwrap_or(0);
        self.commits.insert(
            id.clone(),
            Commit {
                parents,
                tree,
                depth,
            },
        );
        id
    }

    fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone())
                && let Some(commit) = self.commits.get(&next)
            {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    fn merge_base(&self, a: &str, b: &str) -> Option<String> {
        let left = self.ancestors(a);
        let right = self.ancestors(b);
        left.intersection(&right)
            .max_by_key(|id| self.commits.get(*id).map_or(0, |c| c.depth))
            .cloned()
    }

    fn tree(&self, id: &str) -> Tree {
        self.commits.get(id).map(|c| c.tree.clone()).unwrap_or_default()
    }

    /// Three-way merge of trees; the conflicting paths on conflict.
    fn merge_trees(&self, ours: &str, theirs: &str) -> Result<Tree, Vec<String>> {
        let base = self.merge_base(ours, theirs).map(|b| self.tree(&b)).unwrap_or_default();
        let ours = self.tree(ours);
        let theirs = self.tree(theirs);

        let paths: HashSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
        let mut merged = Tree::new();
        let mut conflicts = Vec::new();
        for path in paths {
            let b = base.get(path);
            let o = ours.get(path);
            let t = theirs.get(path);
            let pick = if o == t || t == b {
                o
            } else if o == b {
                t
            } else {
                conflicts.push(path.clone());
                continue;
            };
            if let Some(content) = pick {
                merged.insert(path.clone(), content.clone());
            }
        }
        if conflicts.is_empty() {
            Ok(merged)
        } else {
            conflicts.sort();
            Err(conflicts)
        }
    }
}

fn fake_error(operation: &str, stderr: impl Into<String>) -> anyhow::Error {
    BkstgError::GitCommandError {
        operation: operation.to_string(),
        stderr: stderr.into(),
    }
    .into()
}

fn in_sparse(path: &str, sparse: &[String]) -> bool {
    sparse.is_empty() || sparse.iter().any(|dir| path == dir || path.starts_with(&format!("{dir}/")))
}

/// Files in a working directory, excluding `.git`.
fn read_worktree(root: &Path) -> Tree {
    let mut files = Tree::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let key = rel.to_string_lossy().replace('\\', "/");
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            files.insert(key, content);
        }
    }
    files
}

fn materialize(root: &Path, tree: &Tree, sparse: &[String]) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    for (rel, content) in tree.iter().filter(|(p, _)| in_sparse(p, sparse)) {
        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}

/// Porcelain-like status lines for a working directory against `head`.
fn status_lines(
    root: &Path,
    head: &Tree,
    sparse: &[String],
    unmerged: &[String],
) -> Vec<(String, String)> {
    let disk = read_worktree(root);
    let mut lines: Vec<(String, String)> =
        unmerged.iter().map(|path| ("UU".to_string(), path.clone())).collect();
    for (path, content) in disk.iter().filter(|(p, _)| !unmerged.contains(p)) {
        match head.get(path) {
            None => lines.push(("??".to_string(), path.clone())),
            Some(committed) if committed != content => lines.push((" M".to_string(), path.clone())),
            Some(_) => {}
        }
    }
    for path in head.keys().filter(|p| !unmerged.contains(p)) {
        if in_sparse(path, sparse) && !disk.contains_key(path) {
            lines.push((" D".to_string(), path.clone()));
        }
    }
    lines.sort_by(|a, b| a.1.cmp(&b.1));
    lines
}

/// In-memory [`VcsTransport`].
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<State>,
}

impl FakeVcs {
    /// Creates an empty fake with no remotes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    /// Creates a remote at `url` whose `branch` holds one commit with `files`.
    pub fn add_remote(&self, url: &str, branch: &str, files: &[(&str, &str)]) -> String {
        self.with_state(|state| {
            let tree = files.iter().map(|(p, c)| ((*p).to_string(), (*c).to_string())).collect();
            let id = state.new_commit(Vec::new(), tree);
            state.remotes.entry(url.to_string()).or_default().insert(branch.to_string(), id.clone());
            id
        })
    }

    /// Adds a commit on top of the remote `branch`, writing `files`.
    pub fn remote_commit(&self, url: &str, branch: &str, files: &[(&str, &str)]) -> String {
        self.with_state(|state| {
            let parent = state.remotes.get(url).and_then(|b| b.get(branch)).cloned();
            let mut tree = parent.as_deref().map(|p| state.tree(p)).unwrap_or_default();
            for (path, content) in files {
                tree.insert((*path).to_string(), (*content).to_string());
            }
            let id = state.new_commit(parent.into_iter().collect(), tree);
            state.remotes.entry(url.to_string()).or_default().insert(branch.to_string(), id.clone());
            id
        })
    }

    /// Head commit of the remote `branch`.
    #[must_use]
    pub fn remote_head(&self, url: &str, branch: &str) -> Option<String> {
        self.with_state(|state| state.remotes.get(url).and_then(|b| b.get(branch)).cloned())
    }

    /// Branch names present on the remote.
    #[must_use]
    pub fn remote_branches(&self, url: &str) -> Vec<String> {
        self.with_state(|state| {
            let mut names: Vec<String> =
                state.remotes.get(url).map(|b| b.keys().cloned().collect()).unwrap_or_default();
            names.sort();
            names
        })
    }

    fn repo_id(path: &Path) -> Option<String> {
        std::fs::read_to_string(path.join(".git").join(MARKER_FILE))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Head commit of the working copy at `path`.
    #[must_use]
    pub fn head(&self, path: &Path) -> Option<String> {
        let id = Self::repo_id(path)?;
        self.with_state(|state| {
            state.repos.get(&id).and_then(|repo| repo.branches.get(&repo.current).cloned())
        })
    }

    /// Remote-tracking commit of `branch` in the working copy at `path`.
    #[must_use]
    pub fn tracking(&self, path: &Path, branch: &str) -> Option<String> {
        let id = Self::repo_id(path)?;
        self.with_state(|state| state.repos.get(&id).and_then(|r| r.tracking.get(branch).cloned()))
    }

    /// Checked-out branch of the working copy at `path`.
    #[must_use]
    pub fn current_branch(&self, path: &Path) -> Option<String> {
        let id = Self::repo_id(path)?;
        self.with_state(|state| state.repos.get(&id).map(|r| r.current.clone()))
    }

    /// Writes a file into the working tree without committing.
    pub fn write_file(&self, path: &Path, rel: &str, content: &str) {
        let target = path.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap_or_default();
        }
        std::fs::write(target, content).unwrap_or_default();
    }

    /// Writes `files` and commits them on the checked-out branch.
    pub fn local_commit(&self, path: &Path, files: &[(&str, &str)]) -> String {
        for (rel, content) in files {
            self.write_file(path, rel, content);
        }
        let id = Self::repo_id(path).unwrap_or_default();
        self.with_state(|state| {
            let Some(repo) = state.repos.get(&id).cloned() else {
                return String::new();
            };
            let parent = repo.branches.get(&repo.current).cloned().unwrap_or_default();
            let mut tree = state.tree(&parent);
            for (rel, content) in files {
                tree.insert((*rel).to_string(), (*content).to_string());
            }
            let commit = state.new_commit(vec![parent], tree);
            if let Some(repo) = state.repos.get_mut(&id) {
                repo.branches.insert(repo.current.clone(), commit.clone());
            }
            commit
        })
    }

    /// Paths that differ between the working tree and HEAD.
    #[must_use]
    pub fn dirty_paths(&self, path: &Path) -> Vec<String> {
        let Some(id) = Self::repo_id(path) else {
            return Vec::new();
        };
        let (head, sparse, unmerged) = self.with_state(|state| {
            state.repos.get(&id).map_or((Tree::new(), Vec::new(), Vec::new()), |repo| {
                let head = repo.branches.get(&repo.current).map(|c| state.tree(c)).unwrap_or_default();
                (head, repo.sparse.clone(), repo.unmerged.clone())
            })
        });
        status_lines(path, &head, &sparse, &unmerged).into_iter().map(|(_, p)| p).collect()
    }

    /// Fails every network operation with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|state| state.offline = offline);
    }

    /// Fails every network operation with an authentication error.
    pub fn set_auth_failure(&self, failing: bool) {
        self.with_state(|state| state.auth_failure = failing);
    }

    /// Delays every network operation.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|state| state.latency = latency);
    }

    /// Makes the next operation named `op` fail with `error`.
    pub fn fail_next(&self, op: &str, error: BkstgError) {
        self.with_state(|state| {
            state.injected.entry(op.to_string()).or_default().push_back(error);
        });
    }

    /// Number of executed operations named `op`.
    #[must_use]
    pub fn call_count(&self, op: &str) -> usize {
        self.with_state(|state| state.calls.get(op).copied().unwrap_or(0))
    }

    /// Number of executed operations that are not read-only.
    #[must_use]
    pub fn mutating_calls(&self) -> usize {
        const MUTATING: &[&str] = &[
            "clone", "reset", "clean", "merge-ff", "merge", "merge-abort", "add", "commit", "push",
            "create-branch", "checkout",
        ];
        self.with_state(|state| MUTATING.iter().filter_map(|op| state.calls.get(*op)).sum())
    }

    fn resolve(state: &State, repo: &LocalRepo, reference: &str) -> Option<String> {
        if reference == "HEAD" {
            return repo.branches.get(&repo.current).cloned();
        }
        if let Some(branch) = reference.strip_prefix("origin/") {
            return repo.tracking.get(branch).cloned();
        }
        if let Some(id) = repo.branches.get(reference) {
            return Some(id.clone());
        }
        state.commits.contains_key(reference).then(|| reference.to_string())
    }

    fn network_check(state: &State, op: &GitOp, url: &str) -> Result<()> {
        if state.auth_failure {
            return Err(BkstgError::AuthenticationFailed {
                url: url.to_string(),
                detail: "fatal: Authentication failed".to_string(),
            }
            .into());
        }
        if state.offline {
            return Err(BkstgError::NetworkError {
                operation: op.name().to_string(),
                reason: "Could not resolve host: github.com".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn clone_into(&self, target: &Path, url: &str, branch: &str, sparse: &[String]) -> Result<()> {
        let (id, tree) = self.with_state(|state| -> Result<(String, Tree)> {
            Self::network_check(state, &GitOp::SparseClone {
                url: url.to_string(),
                branch: branch.to_string(),
                sparse_paths: Vec::new(),
            }, url)?;
            let head = state
                .remotes
                .get(url)
                .and_then(|b| b.get(branch))
                .cloned()
                .ok_or_else(|| BkstgError::CloneFailed {
                    url: url.to_string(),
                    reason: format!("Remote branch {branch} not found"),
                })?;
            let id = uuid::Uuid::new_v4().to_string();
            state.repos.insert(
                id.clone(),
                LocalRepo {
                    url: url.to_string(),
                    current: branch.to_string(),
                    branches: HashMap::from([(branch.to_string(), head.clone())]),
                    tracking: HashMap::from([(branch.to_string(), head.clone())]),
                    sparse: sparse.to_vec(),
                    unmerged: Vec::new(),
                },
            );
            Ok((id, state.tree(&head)))
        })?;

        std::fs::create_dir_all(target.join(".git"))?;
        std::fs::write(target.join(".git").join(MARKER_FILE), &id)?;
        materialize(target, &tree, sparse)
    }

    fn execute_local(&self, path: &Path, op: GitOp) -> Result<GitOutput> {
        let id = Self::repo_id(path).ok_or_else(|| {
            fake_error(op.name(), format!("fatal: not a git repository: {}", path.display()))
        })?;
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut repo = state
            .repos
            .get(&id)
            .cloned()
            .ok_or_else(|| fake_error(op.name(), "fatal: unknown repository"))?;

        let mut checkout: Option<String> = None;
        let output = match &op {
            GitOp::SparseClone { .. } => return Err(fake_error("clone", "already exists")),
            GitOp::Fetch { branch } => {
                Self::network_check(&state, &op, &repo.url)?;
                let head = state
                    .remotes
                    .get(&repo.url)
                    .and_then(|b| b.get(branch))
                    .cloned()
                    .ok_or_else(|| fake_error("fetch", format!("couldn't find remote ref {branch}")))?;
                repo.tracking.insert(branch.clone(), head);
                GitOutput::Done
            }
            GitOp::RevParse { reference } => GitOutput::Text(
                Self::resolve(&state, &repo, reference)
                    .ok_or_else(|| fake_error("rev-parse", format!("unknown revision {reference}")))?,
            ),
            GitOp::IsAncestor { ancestor, descendant } => {
                let a = Self::resolve(&state, &repo, ancestor)
                    .ok_or_else(|| fake_error("is-ancestor", "bad revision"))?;
                let d = Self::resolve(&state, &repo, descendant)
                    .ok_or_else(|| fake_error("is-ancestor", "bad revision"))?;
                GitOutput::Flag(state.ancestors(&d).contains(&a))
            }
            GitOp::CountCommits { from, to } => {
                let f = Self::resolve(&state, &repo, from)
                    .ok_or_else(|| fake_error("rev-list", "bad revision"))?;
                let t = Self::resolve(&state, &repo, to)
                    .ok_or_else(|| fake_error("rev-list", "bad revision"))?;
                let excluded = state.ancestors(&f);
                GitOutput::Count(state.ancestors(&t).difference(&excluded).count())
            }
            GitOp::TrialMerge { ours, theirs } => {
                let o = Self::resolve(&state, &repo, ours)
                    .ok_or_else(|| fake_error("merge-tree", "bad revision"))?;
                let t = Self::resolve(&state, &repo, theirs)
                    .ok_or_else(|| fake_error("merge-tree", "bad revision"))?;
                GitOutput::Merge(match state.merge_trees(&o, &t) {
                    Ok(_) => MergeOutcome::Clean,
                    Err(conflicts) => MergeOutcome::Conflict(conflicts),
                })
            }
            GitOp::ResetHard { reference } => {
                let target = Self::resolve(&state, &repo, reference)
                    .ok_or_else(|| fake_error("reset", format!("unknown revision {reference}")))?;
                repo.branches.insert(repo.current.clone(), target.clone());
                repo.unmerged.clear();
                checkout = Some(target);
                GitOutput::Done
            }
            GitOp::CleanUntracked => {
                let head = repo.branches.get(&repo.current).map(|c| state.tree(c)).unwrap_or_default();
                for (code, rel) in status_lines(path, &head, &repo.sparse, &repo.unmerged) {
                    if code == "??" {
                        std::fs::remove_file(path.join(rel))?;
                    }
                }
                GitOutput::Done
            }
            GitOp::MergeFastForward { reference } => {
                let head = Self::resolve(&state, &repo, "HEAD").unwrap_or_default();
                let target = Self::resolve(&state, &repo, reference)
                    .ok_or_else(|| fake_error("merge", "bad revision"))?;
                if !state.ancestors(&target).contains(&head) {
                    return Err(fake_error("merge", "fatal: Not possible to fast-forward, aborting."));
                }
                repo.branches.insert(repo.current.clone(), target.clone());
                checkout = Some(target);
                GitOutput::Done
            }
            GitOp::Merge { reference } => {
                let head = Self::resolve(&state, &repo, "HEAD").unwrap_or_default();
                let target = Self::resolve(&state, &repo, reference)
                    .ok_or_else(|| fake_error("merge", "bad revision"))?;
                if state.ancestors(&head).contains(&target) {
                    GitOutput::Merge(MergeOutcome::Clean)
                } else if state.ancestors(&target).contains(&head) {
                    repo.branches.insert(repo.current.clone(), target.clone());
                    checkout = Some(target);
                    GitOutput::Merge(MergeOutcome::Clean)
                } else {
                    match state.merge_trees(&head, &target) {
                        Ok(tree) => {
                            let merged = state.new_commit(vec![head, target], tree);
                            repo.branches.insert(repo.current.clone(), merged.clone());
                            checkout = Some(merged);
                            GitOutput::Merge(MergeOutcome::Clean)
                        }
                        Err(conflicts) => {
                            // Left in progress until staged, aborted or reset
                            repo.unmerged.clone_from(&conflicts);
                            GitOutput::Merge(MergeOutcome::Conflict(conflicts))
                        }
                    }
                }
            }
            GitOp::AbortMerge => {
                repo.unmerged.clear();
                GitOutput::Done
            }
            GitOp::Stage { paths } => {
                repo.unmerged.retain(|p| !paths.is_empty() && !paths.contains(p));
                GitOutput::Done
            }
            GitOp::StatusPorcelain => {
                let head = repo.branches.get(&repo.current).map(|c| state.tree(c)).unwrap_or_default();
                let text = status_lines(path, &head, &repo.sparse, &repo.unmerged)
                    .into_iter()
                    .map(|(code, p)| format!("{code} {p}\n"))
                    .collect::<String>();
                GitOutput::Text(text)
            }
            GitOp::Commit { message: _, paths } => {
                if !repo.unmerged.is_empty() {
                    return Err(fake_error(
                        "commit",
                        "error: Committing is not possible because you have unmerged files.",
                    ));
                }
                let parent = repo.branches.get(&repo.current).cloned().unwrap_or_default();
                let head_tree = state.tree(&parent);
                let dirty: Vec<String> = status_lines(path, &head_tree, &repo.sparse, &[])
                    .into_iter()
                    .map(|(_, p)| p)
                    .filter(|p| paths.is_empty() || paths.contains(p))
                    .collect();
                if dirty.is_empty() {
                    return Err(fake_error("commit", "nothing to commit, working tree clean"));
                }
                let mut tree = head_tree;
                for rel in dirty {
                    match std::fs::read_to_string(path.join(&rel)) {
                        Ok(content) => {
                            tree.insert(rel, content);
                        }
                        Err(_) => {
                            tree.remove(&rel);
                        }
                    }
                }
                let commit = state.new_commit(vec![parent], tree);
                repo.branches.insert(repo.current.clone(), commit);
                GitOutput::Done
            }
            GitOp::Push { branch, .. } => {
                Self::network_check(&state, &op, &repo.url)?;
                let local = repo
                    .branches
                    .get(branch)
                    .cloned()
                    .ok_or_else(|| fake_error("push", format!("src refspec {branch} does not match any")))?;
                let remote_head = state.remotes.get(&repo.url).and_then(|b| b.get(branch)).cloned();
                if let Some(remote_head) = remote_head
                    && !state.ancestors(&local).contains(&remote_head)
                {
                    return Err(fake_error("push", "! [rejected] (non-fast-forward)"));
                }
                state
                    .remotes
                    .entry(repo.url.clone())
                    .or_default()
                    .insert(branch.clone(), local.clone());
                repo.tracking.insert(branch.clone(), local);
                GitOutput::Done
            }
            GitOp::CreateBranch { name } => {
                if repo.branches.contains_key(name) {
                    return Err(fake_error("checkout", format!("a branch named '{name}' already exists")));
                }
                let head = Self::resolve(&state, &repo, "HEAD").unwrap_or_default();
                repo.branches.insert(name.clone(), head);
                repo.current = name.clone();
                GitOutput::Done
            }
            GitOp::Checkout { branch } => {
                let current = Self::resolve(&state, &repo, "HEAD").unwrap_or_default();
                let target = match repo.branches.get(branch) {
                    Some(id) => id.clone(),
                    None => repo
                        .tracking
                        .get(branch)
                        .cloned()
                        .ok_or_else(|| fake_error("checkout", format!("pathspec '{branch}' did not match")))?,
                };
                repo.branches.insert(branch.clone(), target.clone());
                repo.current = branch.clone();
                if target != current {
                    checkout = Some(target);
                }
                GitOutput::Done
            }
            GitOp::CurrentBranch => GitOutput::Text(repo.current.clone()),
            GitOp::RemoteUrl => GitOutput::Text(repo.url.clone()),
        };

        let tree = checkout.map(|c| state.tree(&c));
        let sparse = repo.sparse.clone();
        state.repos.insert(id, repo);
        drop(state);

        if let Some(tree) = tree {
            materialize(path, &tree, &sparse)?;
        }
        Ok(output)
    }
}

#[async_trait]
impl VcsTransport for FakeVcs {
    async fn execute(&self, repo: &Path, op: GitOp) -> Result<GitOutput> {
        let (latency, injected) = self.with_state(|state| {
            *state.calls.entry(op.name().to_string()).or_default() += 1;
            let injected = state.injected.get_mut(op.name()).and_then(VecDeque::pop_front);
            (state.latency, injected)
        });

        if let GitOp::SparseClone { .. } = op {
            std::fs::create_dir_all(repo)?;
        }
        if op.is_network() && !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = injected {
            return Err(error.into());
        }

        match op {
            GitOp::SparseClone { url, branch, sparse_paths } => {
                self.clone_into(repo, &url, &branch, &sparse_paths)?;
                Ok(GitOutput::Done)
            }
            other => self.execute_local(repo, other),
        }
    }
}
