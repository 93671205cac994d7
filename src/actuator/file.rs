use super::{ActionOutcome, FileSystem};
use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Filesystem adapter over `tokio::fs`.
pub struct LocalFileSystem;

fn io_failure(verb: &str, path: &str, err: std::io::Error) -> ActionOutcome {
    ActionOutcome::failed(format!("{} {} failed: {}", verb, path, err))
}

async fn ensure_parent(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read(&self, path: &str) -> ActionOutcome {
        let started = Instant::now();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => ActionOutcome::ok(content).timed_from(started),
            Err(err) => io_failure("read", path, err).timed_from(started),
        }
    }

    async fn write(&self, path: &str, content: &str, append: bool) -> ActionOutcome {
        let started = Instant::now();
        let result = async {
            ensure_parent(path).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => ActionOutcome::ok(format!("wrote {} bytes to {}", content.len(), path))
                .timed_from(started),
            Err(err) => io_failure("write", path, err).timed_from(started),
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> ActionOutcome {
        let started = Instant::now();
        let result = async {
            ensure_parent(to).await?;
            tokio::fs::rename(from, to).await
        }
        .await;
        match result {
            Ok(()) => ActionOutcome::ok(format!("moved {} to {}", from, to)).timed_from(started),
            Err(err) => io_failure("move", from, err).timed_from(started),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> ActionOutcome {
        let started = Instant::now();
        let result = async {
            ensure_parent(to).await?;
            tokio::fs::copy(from, to).await
        }
        .await;
        match result {
            Ok(bytes) => ActionOutcome::ok(format!("copied {} bytes from {} to {}", bytes, from, to))
                .timed_from(started),
            Err(err) => io_failure("copy", from, err).timed_from(started),
        }
    }

    async fn delete(&self, path: &str) -> ActionOutcome {
        let started = Instant::now();
        match tokio::fs::remove_file(path).await {
            Ok(()) => ActionOutcome::ok(format!("deleted {}", path)).timed_from(started),
            Err(err) => io_failure("delete", path, err).timed_from(started),
        }
    }

    async fn create_dir(&self, path: &str) -> ActionOutcome {
        let started = Instant::now();
        match tokio::fs::create_dir_all(path).await {
            Ok(()) => ActionOutcome::ok(format!("created {}", path)).timed_from(started),
            Err(err) => io_failure("create folder", path, err).timed_from(started),
        }
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> ActionOutcome {
        let started = Instant::now();
        let result = if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        };
        match result {
            Ok(()) => ActionOutcome::ok(format!("removed {}", path)).timed_from(started),
            Err(err) => io_failure("delete folder", path, err).timed_from(started),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn write_creates_parents_and_read_returns_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = p(&dir, "nested/a.txt");
        let fs = LocalFileSystem;

        assert!(fs.write(&path, "one", false).await.success);
        assert!(fs.write(&path, "two", true).await.success);
        let read = fs.read(&path).await;
        assert!(read.success);
        assert_eq!(read.output.as_deref(), Some("onetwo"));

        assert!(fs.write(&path, "three", false).await.success);
        assert_eq!(fs.read(&path).await.output.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn move_copy_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFileSystem;
        let a = p(&dir, "a.txt");
        let b = p(&dir, "sub/b.txt");
        let c = p(&dir, "c.txt");

        fs.write(&a, "data", false).await;
        assert!(fs.copy(&a, &c).await.success);
        assert!(fs.move_path(&a, &b).await.success);
        assert!(!Path::new(&a).exists());
        assert!(Path::new(&b).exists());
        assert!(fs.delete(&c).await.success);
        assert!(!Path::new(&c).exists());
    }

    #[tokio::test]
    async fn folders_and_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFileSystem;
        let folder = p(&dir, "x");

        assert!(fs.create_dir(&folder).await.success);
        fs.write(&format!("{}/a.txt", folder), "a", false).await;
        assert!(!fs.remove_dir(&folder, false).await.success);
        assert!(fs.remove_dir(&folder, true).await.success);

        let missing = fs.read(&p(&dir, "missing.txt")).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().starts_with("read"));
    }
}
