use std::path::PathBuf;

use crate::HashError;

/// A file handed to the pipeline: a path plus descriptive metadata.
///
/// Only the bytes behind `path` feed a digest; `name` and `mime_type`
/// are informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl SourceFile {
    /// Stats `path` and guesses a MIME type from its extension.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HashError> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .unwrap_or_default()
            .to_string_lossy()
            .to_ascii_lowercase();
        Ok(Self {
            mime_type: ext_to_mime_type(&ext).to_string(),
            path,
            name,
            size,
        })
    }

    /// Overrides the guessed MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

/// Maps a file extension to a content type.
fn ext_to_mime_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_reads_size_and_name() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Holiday.JPG");
        std::fs::write(&path, b"12345").unwrap();

        let file = SourceFile::open(&path).unwrap();
        assert_eq!(file.name, "Holiday.JPG");
        assert_eq!(file.size, 5);
        assert_eq!(file.mime_type, "image/jpeg");
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive.xyz");
        std::fs::write(&path, b"").unwrap();
        let file = SourceFile::open(&path).unwrap();
        assert_eq!(file.mime_type, "application/octet-stream");
        assert_eq!(file.with_mime_type("image/png").mime_type, "image/png");
    }

    #[test]
    fn open_missing_file_fails() {
        assert!(SourceFile::open("/nonexistent/imgup/file.png").is_err());
    }
}
