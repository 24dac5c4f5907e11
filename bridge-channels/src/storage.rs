use crate::types::StoredFile;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

/// Attachment storage rooted at a configured directory.
///
/// Files land under `<root>/<YYYY>/<MM>/<DD>/<ulid>.<ext>` so names never collide; callers keep the
/// root-relative path.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[tracing::instrument(level = "debug", skip_all, fields(bytes = bytes.len()))]
    pub async fn save(
        &self,
        bytes: &[u8],
        original_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<StoredFile> {
        self.save_at(bytes, original_name, mime_type, Utc::now())
            .await
    }

    async fn save_at(
        &self,
        bytes: &[u8],
        original_name: Option<&str>,
        mime_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StoredFile> {
        let extension = original_name
            .and_then(extension_of)
            .or_else(|| mime_type.and_then(extension_for_mime))
            .unwrap_or("bin");
        let day_dir = now.format("%Y/%m/%d").to_string();
        let generated = format!("{}.{}", ulid::Ulid::new().to_string().to_lowercase(), extension);
        let relative_path = format!("{day_dir}/{generated}");

        let absolute = self.root.join(&relative_path);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create attachment dir {}", parent.display()))?;
        }
        tokio::fs::write(&absolute, bytes)
            .await
            .with_context(|| format!("write attachment {}", absolute.display()))?;

        let file_name = original_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or(generated);
        let file_type = mime_type
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .unwrap_or(DEFAULT_FILE_TYPE)
            .to_string();

        tracing::debug!(path = %relative_path, "attachment stored");
        Ok(StoredFile {
            relative_path,
            file_name,
            file_type,
        })
    }

    /// Maps a stored relative path back to disk. Paths escaping the root are refused.
    pub fn resolve(&self, relative_path: &str) -> Option<PathBuf> {
        let candidate = Path::new(relative_path);
        let safe = candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || relative_path.is_empty() {
            return None;
        }
        Some(self.root.join(candidate))
    }
}

fn extension_of(name: &str) -> Option<&str> {
    let (_, ext) = name.trim().rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    Some(match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/amr" => "amr",
        "video/mp4" => "mp4",
        "application/pdf" => "pdf",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn save_writes_under_dated_directory_with_unique_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path());
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        let first = storage
            .save_at(b"abc", Some("report.PDF"), None, now)
            .await
            .expect("save");
        let second = storage
            .save_at(b"abc", Some("report.PDF"), None, now)
            .await
            .expect("save");

        assert!(first.relative_path.starts_with("2024/03/09/"));
        assert!(first.relative_path.ends_with(".PDF"));
        assert_ne!(first.relative_path, second.relative_path);
        assert_eq!(first.file_name, "report.PDF");
        assert_eq!(first.file_type, DEFAULT_FILE_TYPE);

        let on_disk = storage.resolve(&first.relative_path).expect("resolve");
        assert_eq!(std::fs::read(on_disk).expect("read"), b"abc");
    }

    #[tokio::test]
    async fn save_falls_back_to_mime_extension_and_generated_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path());
        let stored = storage
            .save(b"\x89PNG", None, Some("image/png"))
            .await
            .expect("save");
        assert!(stored.relative_path.ends_with(".png"));
        assert!(stored.file_name.ends_with(".png"));
        assert_eq!(stored.file_type, "image/png");
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let storage = FileStorage::new("/srv/files");
        assert!(storage.resolve("../etc/passwd").is_none());
        assert!(storage.resolve("/etc/passwd").is_none());
        assert!(storage.resolve("").is_none());
        assert_eq!(
            storage.resolve("2024/01/01/a.jpg"),
            Some(PathBuf::from("/srv/files/2024/01/01/a.jpg"))
        );
    }
}
