use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// The xpath of a document's main content blob.
pub const MAIN_XPATH: &str = "content";

/// Where the bytes of a blob being written come from.
///
/// A source can be opened any number of times; each call to
/// [`BlobSource::open`] yields a fresh reader positioned at the start.
#[derive(Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// In-memory bytes (cheaply clonable).
    Bytes(Bytes),
    /// A file already on local disk.
    File(PathBuf),
}

impl BlobSource {
    /// Source backed by in-memory bytes.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    /// Source backed by a local file.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Open a fresh reader over the full content.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            Self::Bytes(data) => Ok(Box::new(Cursor::new(data.clone()))),
            Self::File(path) => Ok(Box::new(File::open(path)?)),
        }
    }

    /// Content length in bytes.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            Self::Bytes(data) => Ok(data.len() as u64),
            Self::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    /// Returns `true` if the source holds no bytes.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The backing file, when the source already lives on disk.
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::Bytes(_) => None,
            Self::File(path) => Some(path),
        }
    }
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(data) => write!(f, "BlobSource::Bytes({} bytes)", data.len()),
            Self::File(path) => write!(f, "BlobSource::File({})", path.display()),
        }
    }
}

/// Everything a store needs to know to write one blob.
///
/// `doc_id` and `xpath` identify the owning document property; they are
/// required by the document-id key strategy and by record providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobContext {
    pub source: BlobSource,
    pub doc_id: Option<String>,
    pub xpath: Option<String>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

impl BlobContext {
    /// Context for an anonymous blob.
    pub fn new(source: BlobSource) -> Self {
        Self {
            source,
            doc_id: None,
            xpath: None,
            filename: None,
            mime_type: None,
        }
    }

    /// Attach the owning document and property path.
    pub fn with_doc(mut self, doc_id: impl Into<String>, xpath: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self.xpath = Some(xpath.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Returns `true` if the blob is the document's main content.
    ///
    /// A missing xpath counts as the main content.
    pub fn is_main_content(&self) -> bool {
        self.xpath.as_deref().map_or(true, |x| x == MAIN_XPATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(source: &BlobSource) -> Vec<u8> {
        let mut out = Vec::new();
        source.open().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn bytes_source_reopens_from_start() {
        let source = BlobSource::from_bytes(&b"hello"[..]);
        assert_eq!(read_all(&source), b"hello");
        assert_eq!(read_all(&source), b"hello");
        assert_eq!(source.len().unwrap(), 5);
        assert!(source.file().is_none());
    }

    #[test]
    fn file_source_reads_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"on disk").unwrap();
        let source = BlobSource::from_file(tmp.path());
        assert_eq!(read_all(&source), b"on disk");
        assert_eq!(source.len().unwrap(), 7);
        assert_eq!(source.file(), Some(tmp.path()));
    }

    #[test]
    fn debug_does_not_dump_content() {
        let source = BlobSource::from_bytes(vec![0u8; 1024]);
        assert_eq!(format!("{source:?}"), "BlobSource::Bytes(1024 bytes)");
    }

    #[test]
    fn main_content_detection() {
        let source = BlobSource::from_bytes(&b"x"[..]);
        assert!(BlobContext::new(source.clone()).is_main_content());
        assert!(BlobContext::new(source.clone())
            .with_doc("doc1", MAIN_XPATH)
            .is_main_content());
        assert!(!BlobContext::new(source)
            .with_doc("doc1", "files/0/file")
            .is_main_content());
    }
}
