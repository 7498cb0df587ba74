//! Transport collaborators
//!
//! Rendering a visual code, scanning one, and handing a file to the user's
//! mail or share sheet all live outside this crate. These traits are the
//! seams; the bundled implementations work on plain files so the CLI and
//! tests can drive a full transfer without a camera.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// A file ready to be mailed or saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub subject: String,
    pub body: String,
    pub bytes: Vec<u8>,
}

/// Turns code text into a displayable symbol
pub trait CodeRenderer: Send + Sync {
    /// File extension of rendered output
    fn extension(&self) -> &str;

    /// Render one code
    fn render(&self, text: &str) -> Result<Vec<u8>>;
}

/// Produces the text of one captured code
#[async_trait]
pub trait CodeScanner: Send + Sync {
    /// Next captured text, or `None` when the user stops scanning
    async fn scan(&self) -> Result<Option<String>>;
}

/// Delivers an attachment to the user
#[async_trait]
pub trait AttachmentSink: Send + Sync {
    async fn deliver(&self, attachment: &Attachment) -> Result<()>;
}

/// Renders codes as their raw text
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextRenderer;

impl CodeRenderer for PlainTextRenderer {
    fn extension(&self) -> &str {
        "txt"
    }

    fn render(&self, text: &str) -> Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }
}

/// Render every code into `dir` as `code-01.<ext>`, `code-02.<ext>`, ...
pub async fn write_codes(
    renderer: &dyn CodeRenderer,
    codes: &[String],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).await?;

    let width = codes.len().to_string().len().max(2);
    let mut paths = Vec::with_capacity(codes.len());
    for (i, code) in codes.iter().enumerate() {
        let path = dir.join(format!(
            "code-{:0width$}.{}",
            i + 1,
            renderer.extension(),
            width = width
        ));
        fs::write(&path, renderer.render(code)?).await?;
        debug!(path = %path.display(), "Wrote code");
        paths.push(path);
    }
    Ok(paths)
}

/// Reads captured code text from files, one file per scan
#[derive(Debug)]
pub struct FileScanner {
    pending: Mutex<VecDeque<PathBuf>>,
}

impl FileScanner {
    /// Scan `paths` in the given order
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending: Mutex::new(paths.into_iter().collect()),
        }
    }
}

#[async_trait]
impl CodeScanner for FileScanner {
    async fn scan(&self) -> Result<Option<String>> {
        let Some(path) = self.pending.lock().await.pop_front() else {
            return Ok(None);
        };
        let text = fs::read_to_string(&path).await.map_err(|e| {
            Error::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Some(text))
    }
}

/// Saves attachments into a directory
#[derive(Debug, Clone)]
pub struct DirectoryAttachmentSink {
    dir: PathBuf,
}

impl DirectoryAttachmentSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where an attachment will be written
    pub fn path_for(&self, attachment: &Attachment) -> PathBuf {
        self.dir.join(&attachment.file_name)
    }
}

#[async_trait]
impl AttachmentSink for DirectoryAttachmentSink {
    async fn deliver(&self, attachment: &Attachment) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(attachment);
        fs::write(&path, &attachment.bytes).await?;
        debug!(path = %path.display(), subject = %attachment.subject, "Saved attachment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_codes_numbers_files() {
        let dir = TempDir::new().unwrap();
        let codes = vec!["first".to_string(), "second".to_string()];
        let paths = write_codes(&PlainTextRenderer, &codes, dir.path()).await.unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("code-01.txt"));
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_file_scanner_reads_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "A").unwrap();
        std::fs::write(&b, "B").unwrap();

        let scanner = FileScanner::new(vec![b, a]);
        assert_eq!(scanner.scan().await.unwrap(), Some("B".to_string()));
        assert_eq!(scanner.scan().await.unwrap(), Some("A".to_string()));
        assert_eq!(scanner.scan().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_scanner_missing_file() {
        let scanner = FileScanner::new(vec![PathBuf::from("/definitely/not/here.txt")]);
        assert!(matches!(scanner.scan().await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_directory_sink_writes_attachment() {
        let dir = TempDir::new().unwrap();
        let sink = DirectoryAttachmentSink::new(dir.path().join("out"));
        let attachment = Attachment {
            file_name: "backup.json".to_string(),
            subject: "Backup".to_string(),
            body: "See attached".to_string(),
            bytes: b"{}".to_vec(),
        };
        sink.deliver(&attachment).await.unwrap();
        assert_eq!(std::fs::read(sink.path_for(&attachment)).unwrap(), b"{}");
    }
}
