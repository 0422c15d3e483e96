//! Grading-asset repository synchronization.
//!
//! Runs once at process startup, before the worker loop touches the
//! broker: clone-or-open the configured repository at the grader root,
//! fetch origin, and check out the configured commit or ref.

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{AutotagOption, CertificateCheckStatus, Cred, FetchOptions, Oid, RemoteCallbacks, Repository};

use crate::config::CredentialsConfig;

/// Authentication decisions for the sync fetch, injected at call time.
pub trait SyncAuth: Send + Sync {
    /// Accept or reject the remote host's certificate.
    fn check_certificate(&self, host: &str) -> bool;
    /// Produce credentials for the remote.
    fn credentials(&self, url: &str, username: Option<&str>) -> Result<Cred, git2::Error>;
}

/// SSH key pair taken from the worker configuration. With no key
/// configured it falls back to whatever default the transport offers,
/// which is enough for public HTTPS remotes and local paths.
pub struct SshKeyAuth {
    public_key: Option<std::path::PathBuf>,
    private_key: Option<std::path::PathBuf>,
    passphrase: Option<String>,
}

impl From<&CredentialsConfig> for SshKeyAuth {
    fn from(credentials: &CredentialsConfig) -> Self {
        Self {
            public_key: credentials.public_key.clone(),
            private_key: credentials.private_key.clone(),
            passphrase: credentials.passphrase.clone(),
        }
    }
}

impl SyncAuth for SshKeyAuth {
    fn check_certificate(&self, _host: &str) -> bool {
        true
    }

    fn credentials(&self, _url: &str, username: Option<&str>) -> Result<Cred, git2::Error> {
        match &self.private_key {
            Some(private_key) => Cred::ssh_key(
                username.unwrap_or("git"),
                self.public_key.as_deref(),
                private_key,
                self.passphrase.as_deref(),
            ),
            None => Cred::default(),
        }
    }
}

/// Materialize `repo_url` at `dest`, checked out at `target` (a commit
/// hash, a branch name, or a full refname).
pub fn sync(
    repo_url: &str,
    target: &str,
    dest: &Path,
    auth: &dyn SyncAuth,
) -> Result<(), git2::Error> {
    tracing::info!(url = repo_url, target, dest = %dest.display(), "syncing grading assets");
    let repo = open_or_clone(repo_url, dest, auth)?;
    fetch_origin(&repo, auth)?;

    if is_commit_hash(target) {
        repo.set_head_detached(Oid::from_str(target)?)?;
    } else if target.starts_with("refs/") {
        repo.set_head(target)?;
    } else {
        let object = repo.revparse_single(&format!("refs/remotes/origin/{target}"))?;
        repo.set_head_detached(object.id())?;
    }

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;

    let head = repo.head()?;
    let head_id = head
        .target()
        .map(|oid| oid.to_string())
        .unwrap_or_default();
    tracing::info!(head = %head_id, "grading assets synced");
    Ok(())
}

fn open_or_clone(
    repo_url: &str,
    dest: &Path,
    auth: &dyn SyncAuth,
) -> Result<Repository, git2::Error> {
    if let Ok(repo) = Repository::open(dest) {
        let origin_matches = repo
            .find_remote("origin")
            .map(|remote| remote.url() == Some(repo_url))
            .unwrap_or(false);
        if origin_matches {
            return Ok(repo);
        }
        // Origin moved; a fresh clone is simpler than rewiring remotes.
        drop(repo);
        std::fs::remove_dir_all(dest)
            .map_err(|err| git2::Error::from_str(&format!("remove {}: {err}", dest.display())))?;
    }

    tracing::info!(url = repo_url, "cloning grading assets");
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options(auth));
    builder.clone(repo_url, dest)
}

fn fetch_origin(repo: &Repository, auth: &dyn SyncAuth) -> Result<(), git2::Error> {
    let mut remote = repo.find_remote("origin")?;
    let mut options = fetch_options(auth);
    remote.fetch(&[] as &[&str], Some(&mut options), None)
}

fn fetch_options(auth: &dyn SyncAuth) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, _allowed| auth.credentials(url, username));
    callbacks.certificate_check(move |_cert, host| {
        if auth.check_certificate(host) {
            Ok(CertificateCheckStatus::CertificateOk)
        } else {
            Err(git2::Error::from_str("remote certificate rejected"))
        }
    });

    let mut options = FetchOptions::new();
    options
        .remote_callbacks(callbacks)
        .download_tags(AutotagOption::All);
    options
}

fn is_commit_hash(target: &str) -> bool {
    target.len() == 40 && target.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    struct AnonymousAuth;

    impl SyncAuth for AnonymousAuth {
        fn check_certificate(&self, _host: &str) -> bool {
            true
        }

        fn credentials(&self, _url: &str, _username: Option<&str>) -> Result<Cred, git2::Error> {
            Cred::default()
        }
    }

    /// Seed a repository with one commit; returns its branch name and id.
    fn seed_remote(dir: &Path) -> (String, Oid) {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("grade.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("grade.sh")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("seed", "seed@example.com").unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "seed grading assets", &tree, &[])
            .unwrap();
        let branch = repo.head().unwrap().shorthand().unwrap().to_string();
        (branch, oid)
    }

    #[test]
    fn clones_and_checks_out_branch() {
        let remote = tempfile::tempdir().unwrap();
        let (branch, oid) = seed_remote(remote.path());
        let workdir = tempfile::tempdir().unwrap();
        let dest = workdir.path().join("assets");

        sync(remote.path().to_str().unwrap(), &branch, &dest, &AnonymousAuth).unwrap();

        assert!(dest.join("grade.sh").exists());
        let cloned = Repository::open(&dest).unwrap();
        assert_eq!(cloned.head().unwrap().target(), Some(oid));
    }

    #[test]
    fn checks_out_detached_commit_hash() {
        let remote = tempfile::tempdir().unwrap();
        let (_, oid) = seed_remote(remote.path());
        let workdir = tempfile::tempdir().unwrap();
        let dest = workdir.path().join("assets");

        sync(
            remote.path().to_str().unwrap(),
            &oid.to_string(),
            &dest,
            &AnonymousAuth,
        )
        .unwrap();

        let cloned = Repository::open(&dest).unwrap();
        assert_eq!(cloned.head().unwrap().target(), Some(oid));
    }

    #[test]
    fn reuses_existing_clone() {
        let remote = tempfile::tempdir().unwrap();
        let (branch, _) = seed_remote(remote.path());
        let workdir = tempfile::tempdir().unwrap();
        let dest = workdir.path().join("assets");
        let url = remote.path().to_str().unwrap().to_string();

        sync(&url, &branch, &dest, &AnonymousAuth).unwrap();
        // Second run opens the existing clone and fetches instead of
        // cloning from scratch.
        sync(&url, &branch, &dest, &AnonymousAuth).unwrap();

        assert!(dest.join("grade.sh").exists());
    }

    #[test]
    fn recognizes_commit_hashes() {
        assert!(is_commit_hash("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_hash("main"));
        assert!(!is_commit_hash("0123456789abcdef"));
        assert!(!is_commit_hash("z123456789abcdef0123456789abcdef01234567"));
    }
}
