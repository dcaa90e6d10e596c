//! Path safety for the host-filesystem backend.
//!
//! Grounded on `original_source/9p/fs.c`'s `fs9p_path_is_safe` /
//! `fs9p_resolve_path`: reject `..` and absolute components, then verify
//! the canonicalized target is at or under the canonicalized root. The
//! source treats "`realpath()` returned the input unchanged" as "the
//! file doesn't exist yet, fall back to parent-directory validation" —
//! flagged in spec.md §9 as fragile should `realpath` ever legitimately
//! return its input. This implementation sidesteps that ambiguity
//! entirely by using `canonicalize`'s own `Err` (not a string
//! comparison) as the "doesn't exist" signal; see DESIGN.md.

use std::path::{Path, PathBuf};

use ninep::error::{self, errno::*, string};

/// Rejects `..` and any component that looks absolute. `.` is legal —
/// callers resolve it to "stay put" without ever reaching here.
pub fn validate_component(name: &str) -> Result<(), error::Error> {
    if name.is_empty() || name == ".." || name.starts_with('/') {
        return Err(error::Error::no(EACCES, string::EACCES_ESCAPE));
    }
    Ok(())
}

/// Appends `name` to the slash-separated relative path `base` ("" means
/// the served root itself).
pub fn join(base: &str, name: &str) -> String {
    if name == "." || name.is_empty() {
        return base.to_owned();
    }
    if base.is_empty() { name.to_owned() } else { format!("{base}/{name}") }
}

/// Verifies that `root.join(relative)` — or, if that path doesn't yet
/// exist, its parent directory — canonicalizes to `root` or a
/// descendant of it. Escape attempts fail with
/// `string::EACCES_ESCAPE`.
pub async fn verify_under_root(root: &Path, relative: &str) -> Result<(), error::Error> {
    let root_canon = tokio::fs::canonicalize(root)
        .await
        .map_err(|_| error::Error::no(EACCES, string::EACCES_ESCAPE))?;
    let target = root.join(relative);

    match tokio::fs::canonicalize(&target).await {
        Ok(canon) => require_within(&root_canon, &canon),
        Err(_) => {
            let parent = target.parent().unwrap_or(root);
            let parent_canon = tokio::fs::canonicalize(parent)
                .await
                .map_err(|_| error::Error::no(EACCES, string::EACCES_ESCAPE))?;
            require_within(&root_canon, &parent_canon)
        }
    }
}

fn require_within(root_canon: &Path, candidate: &Path) -> Result<(), error::Error> {
    if candidate == root_canon || candidate.starts_with(root_canon) {
        Ok(())
    } else {
        Err(error::Error::no(EACCES, string::EACCES_ESCAPE))
    }
}

/// Joins `root` with the backend-relative path, for the final host
/// syscall. Caller must have already validated the path via
/// [`verify_under_root`].
pub fn host_path(root: &Path, relative: &str) -> PathBuf {
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dotdot_and_absolute_components() {
        assert!(validate_component("..").is_err());
        assert!(validate_component("/etc").is_err());
        assert!(validate_component("etc").is_ok());
        assert!(validate_component(".").is_ok());
    }

    #[tokio::test]
    async fn escape_via_symlink_is_rejected() {
        let dir = tempdir();
        let root = dir.path().join("root");
        tokio::fs::create_dir(&root).await.unwrap();
        let outside = dir.path().join("outside");
        tokio::fs::create_dir(&outside).await.unwrap();
        #[cfg(unix)]
        tokio::fs::symlink(&outside, root.join("escape")).await.unwrap();

        #[cfg(unix)]
        assert!(verify_under_root(&root, "escape").await.is_err());
    }

    #[tokio::test]
    async fn nonexistent_file_validates_via_parent() {
        let dir = tempdir();
        let root = dir.path().join("root");
        tokio::fs::create_dir(&root).await.unwrap();
        assert!(verify_under_root(&root, "new-file.txt").await.is_ok());
    }

    fn tempdir() -> TempDirGuard {
        let path = std::env::temp_dir().join(format!("ninepfs-path-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        TempDirGuard(path)
    }

    struct TempDirGuard(PathBuf);
    impl TempDirGuard {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}
