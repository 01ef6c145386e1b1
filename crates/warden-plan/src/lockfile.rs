//! Dependency lockfile hashing

use std::io;
use std::path::Path;

use crate::hash::{ContentHash, FieldHasher};

/// Lockfiles looked for at the repository root, in hashing order
pub const DEFAULT_LOCKFILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "requirements.txt",
    "go.sum",
    "pubspec.lock",
    "Gemfile.lock",
    "composer.lock",
];

/// Hash recorded when the repository has none of the lockfiles
#[must_use]
pub fn no_lockfiles_hash() -> ContentHash {
    ContentHash::compute(b"no_lockfiles")
}

/// Hash every existing lockfile under `root`
///
/// Missing files are skipped; if none exist the sentinel from
/// [`no_lockfiles_hash`] is returned.
///
/// # Errors
/// I/O errors other than not-found
pub fn compute_lockfile_hash<S: AsRef<str>>(root: &Path, names: &[S]) -> io::Result<ContentHash> {
    let mut hasher = FieldHasher::new();
    let mut found = 0usize;
    for name in names {
        let name = name.as_ref();
        match std::fs::read(root.join(name)) {
            Ok(bytes) => {
                hasher = hasher.field(name, &bytes);
                found += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    if found == 0 {
        tracing::debug!(root = %root.display(), "no lockfiles present");
        return Ok(no_lockfiles_hash());
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_when_nothing_present() {
        let dir = tempfile::tempdir().unwrap();
        let h = compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap();
        assert_eq!(h, no_lockfiles_hash());
    }

    #[test]
    fn changes_when_lockfile_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "flask==3.0.0\n").unwrap();
        let before = compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap();
        assert_ne!(before, no_lockfiles_hash());
        assert_eq!(before, compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap());

        std::fs::write(dir.path().join("requirements.txt"), "flask==3.0.0\nrequests\n").unwrap();
        let after = compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn new_lockfile_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "version = 3\n").unwrap();
        let before = compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        assert_ne!(before, compute_lockfile_hash(dir.path(), DEFAULT_LOCKFILES).unwrap());
    }
}
