use std::path::Path;

use tokio::fs;
use tokio::sync::Mutex;

/// Reads and, on demand, prunes a plain-text list of subscription URLs —
/// one per line, `#`-prefixed lines are comments (§4.2). Pruning is
/// serialized so concurrent workers removing different dead sources don't
/// clobber each other's rewrite of the file.
pub struct SourceList {
    path: std::path::PathBuf,
    write_lock: Mutex<()>,
}

impl SourceList {
    pub fn new(path: impl AsRef<Path>) -> Self {
        SourceList {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<String>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Remove the first line matching `url` exactly, preserving comments
    /// and the order of everything else.
    pub async fn remove(&self, url: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        let text = match fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut removed = false;
        let mut kept = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if !removed && trimmed == url {
                removed = true;
                continue;
            }
            kept.push(line.to_string());
        }

        if removed {
            fs::write(&self.path, kept.join("\n") + "\n").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_skips_blank_lines_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.txt");
        tokio::fs::write(&path, "# comment\nhttp://a\n\nhttp://b\n").await.unwrap();

        let list = SourceList::new(&path);
        let sources = list.read().await.unwrap();
        assert_eq!(sources, vec!["http://a", "http://b"]);
    }

    #[tokio::test]
    async fn remove_drops_only_the_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.txt");
        tokio::fs::write(&path, "http://a\nhttp://b\nhttp://c\n").await.unwrap();

        let list = SourceList::new(&path);
        list.remove("http://b").await.unwrap();

        let remaining = list.read().await.unwrap();
        assert_eq!(remaining, vec!["http://a", "http://c"]);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let list = SourceList::new("/nonexistent/path/sources.txt");
        assert_eq!(list.read().await.unwrap(), Vec::<String>::new());
    }
}
