//! Git test helper utilities
//!
//! Drives the real `git` binary to build fixture repositories: a bare
//! "remote" reachable through a `file://` URL, plus scratch working copies
//! that push to it the way a teammate would.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Git command builder for tests
///
/// Use this instead of raw `std::process::Command` for git operations in
/// tests.
pub struct TestGit {
    repo_path: PathBuf,
}

impl TestGit {
    fn run_git_command(&self, args: &[&str], action: &str) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| action.to_string())?;

        if !output.status.success() {
            bail!("{} failed: {}", action, String::from_utf8_lossy(&output.stderr));
        }

        Ok(output)
    }

    /// Create a new TestGit instance for the given repository path
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Return the repository path
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// `file://` URL of this repository
    pub fn file_url(&self) -> String {
        format!("file://{}", self.repo_path.display())
    }

    /// Initialize a bare repository whose HEAD points at `branch`
    pub fn init_bare(&self, branch: &str) -> Result<()> {
        std::fs::create_dir_all(&self.repo_path)?;
        self.run_git_command(&["init", "--bare"], "Failed to initialize bare git repository")?;
        self.run_git_command(
            &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
            &format!("Failed to set HEAD to branch: {branch}"),
        )?;
        Ok(())
    }

    /// Clone `url` into this path and configure a test identity
    pub fn clone_from(&self, url: &str) -> Result<()> {
        let parent = self.repo_path.parent().context("Clone target has no parent")?;
        std::fs::create_dir_all(parent)?;
        let output = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(&self.repo_path)
            .output()
            .context("Failed to run git clone")?;
        if !output.status.success() {
            bail!("git clone failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        self.config_user()
    }

    /// Initialize a non-bare repository on `branch`
    pub fn init(&self, branch: &str) -> Result<()> {
        std::fs::create_dir_all(&self.repo_path)?;
        self.run_git_command(&["init"], "Failed to initialize git repository")?;
        self.run_git_command(
            &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
            &format!("Failed to set HEAD to branch: {branch}"),
        )?;
        self.config_user()
    }

    /// Configure git user for tests
    pub fn config_user(&self) -> Result<()> {
        self.run_git_command(
            &["config", "user.email", "test@bkstg.example"],
            "Failed to configure git user email",
        )?;
        self.run_git_command(&["config", "user.name", "Test User"], "Failed to configure git user name")?;
        Ok(())
    }

    /// Write a file relative to the repository root, creating parents
    pub fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.repo_path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Add all files to staging
    pub fn add_all(&self) -> Result<()> {
        self.run_git_command(&["add", "-A"], "Failed to add files to git")?;
        Ok(())
    }

    /// Create a commit with the given message
    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_git_command(&["commit", "-m", message], "Failed to create git commit")?;
        Ok(())
    }

    /// Write `files`, stage everything and commit
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) -> Result<String> {
        for (relative, content) in files {
            self.write_file(relative, content)?;
        }
        self.add_all()?;
        self.commit(message)?;
        self.rev_parse_head()
    }

    /// Fetch `origin` without touching the working tree
    pub fn fetch(&self) -> Result<()> {
        self.run_git_command(&["fetch", "origin"], "Failed to fetch")?;
        Ok(())
    }

    /// Merge `reference` into the current branch. Returns whether it merged
    /// cleanly; a conflicting merge is left in progress.
    pub fn merge(&self, reference: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["merge", "--no-edit", reference])
            .current_dir(&self.repo_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("Failed to merge {reference}"))?;
        Ok(output.status.success())
    }

    /// Push the current branch to `origin`
    pub fn push(&self) -> Result<()> {
        self.run_git_command(&["push", "origin", "HEAD"], "Failed to push")?;
        Ok(())
    }

    /// Get current commit SHA
    pub fn rev_parse_head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Resolve any reference to a commit SHA
    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        let output = self
            .run_git_command(&["rev-parse", reference], &format!("Failed to resolve {reference}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Names of the branches in this repository
    pub fn branches(&self) -> Result<Vec<String>> {
        let output = self.run_git_command(
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            "Failed to list branches",
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
    }

    /// Get the current branch name
    pub fn get_current_branch(&self) -> Result<String> {
        let output = self
            .run_git_command(&["branch", "--show-current"], "Failed to get current branch name")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Get porcelain status output
    pub fn status_porcelain(&self) -> Result<String> {
        let output = self.run_git_command(&["status", "--porcelain"], "Failed to get git status")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// A bare remote plus a teammate's working copy that pushes to it.
pub struct RemoteFixture {
    /// The bare repository
    pub bare: TestGit,
    /// Working copy used to publish commits
    pub author: TestGit,
    /// Branch the fixture publishes to
    pub branch: String,
}

impl RemoteFixture {
    /// Creates `<root>/remote.git` on `branch` with an initial commit of
    /// `files`.
    pub fn create(root: &Path, branch: &str, files: &[(&str, &str)]) -> Result<Self> {
        let bare = TestGit::new(root.join("remote.git"));
        bare.init_bare(branch)?;

        let author = TestGit::new(root.join("author"));
        author.init(branch)?;
        author.run_git_command(
            &["remote", "add", "origin", &bare.file_url()],
            "Failed to add remote: origin",
        )?;
        author.commit_files(files, "Initial catalog")?;
        author.push()?;

        Ok(Self {
            bare,
            author,
            branch: branch.to_string(),
        })
    }

    /// `file://` URL of the remote.
    pub fn url(&self) -> String {
        self.bare.file_url()
    }

    /// Commits `files` as the teammate and pushes them.
    pub fn publish(&self, files: &[(&str, &str)], message: &str) -> Result<String> {
        let sha = self.author.commit_files(files, message)?;
        self.author.push()?;
        Ok(sha)
    }

    /// Head of the remote branch.
    pub fn head(&self) -> Result<String> {
        self.bare.rev_parse(&format!("refs/heads/{}", self.branch))
    }
}
