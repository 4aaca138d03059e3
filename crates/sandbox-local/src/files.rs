use std::io;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

/// Copy a file or a directory tree. Symbolic links inside the tree are
/// skipped; a source that is itself a link is rejected.
pub async fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
        .await
        .map_err(io::Error::other)?
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    let walker = WalkDir::new(from).follow_links(false).follow_root_links(false);
    for entry in walker {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let target = if relative.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            if entry.depth() == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a symbolic link", from.display()),
                ));
            }
            debug!(path = %entry.path().display(), "skipping symbolic link");
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
        }
    }
    Ok(())
}

/// Apparent size of the regular files in a tree, in bytes. Links are not
/// followed and unreadable entries are skipped.
pub async fn tree_size(root: &Path) -> u64 {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_nested_directories() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("top.txt"), "top").unwrap();
        std::fs::write(src.path().join("a/b/deep.txt"), "deep").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy_recursive(src.path(), &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(target.join("top.txt")).unwrap(), "top");
        assert_eq!(
            std::fs::read_to_string(target.join("a/b/deep.txt")).unwrap(),
            "deep"
        );
        assert_eq!(tree_size(&target).await, 7);
    }

    #[tokio::test]
    async fn copies_single_file_into_new_parent() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        let target = src.path().join("nested/dir/f.txt");
        copy_recursive(&file, &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "x");
    }

    #[tokio::test]
    async fn links_inside_the_tree_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "host").unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("kept.txt"), "kept").unwrap();
        std::os::unix::fs::symlink(outside.path(), src.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(".", src.path().join("loop")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy_recursive(src.path(), &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(target.join("kept.txt")).unwrap(), "kept");
        assert!(!target.join("escape").exists());
        assert!(!target.join("loop").exists());
        assert_eq!(tree_size(src.path()).await, 4);
    }

    #[tokio::test]
    async fn linked_source_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("root");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = copy_recursive(&link, &dir.path().join("out")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            copy_recursive(&dir.path().join("nope"), &dir.path().join("out"))
                .await
                .is_err()
        );
    }
}
