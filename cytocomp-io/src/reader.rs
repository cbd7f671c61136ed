//! Memory-mapped file readers.
//!

use crate::Result;
use cytocomp_core::ChannelTable;
use cytocomp_fcs::{parse_fcs_with_preview, EventReader, FcsFile, PREVIEW_CAP};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
#[derive(Clone)]
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<[u8]> for MappedFileReader {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Where a background apply job gets its raw bytes from.
///
/// In-memory buffers are shared immutably; files are mapped again inside the job.
#[derive(Clone, Debug)]
pub enum EventSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl EventSource {
    /// Makes the raw bytes available (the `reading` phase of an apply).
    ///
    /// # Errors
    /// Returns an error if a file source cannot be opened or mapped.
    pub fn load(&self) -> Result<SourceBytes> {
        match self {
            Self::Bytes(bytes) => Ok(SourceBytes::Shared(Arc::clone(bytes))),
            Self::File(path) => Ok(SourceBytes::Mapped(MappedFileReader::open(path)?)),
        }
    }
}

impl From<Vec<u8>> for EventSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

/// Raw bytes of an [`EventSource`].
pub enum SourceBytes {
    Shared(Arc<[u8]>),
    Mapped(MappedFileReader),
}

impl AsRef<[u8]> for SourceBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Shared(bytes) => &bytes[..],
            Self::Mapped(reader) => reader.as_bytes(),
        }
    }
}

/// An FCS file reader with memory-mapped I/O.
pub struct FcsFileReader {
    reader: MappedFileReader,
    file: FcsFile,
}

impl FcsFileReader {
    /// Opens and decodes an FCS file with the default preview cap.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or fails to decode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_preview(path, PREVIEW_CAP)
    }

    /// Opens and decodes an FCS file, sampling at most `preview_cap` events.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or fails to decode.
    pub fn open_with_preview<P: AsRef<Path>>(path: P, preview_cap: usize) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        let file = parse_fcs_with_preview(reader.as_bytes(), preview_cap)?;
        Ok(Self { reader, file })
    }

    /// Decoded metadata and preview.
    #[must_use]
    pub fn file(&self) -> &FcsFile {
        &self.file
    }

    /// Consumes the reader, keeping the decoded file.
    #[must_use]
    pub fn into_file(self) -> FcsFile {
        self.file
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// Random access to event records.
    ///
    /// # Errors
    /// Returns an error if the mapping no longer holds the declared DATA segment.
    pub fn events(&self) -> Result<EventReader<'_>> {
        Ok(self.file.reader(self.reader.as_bytes())?)
    }

    /// Reads every event, uncorrected.
    ///
    /// # Errors
    /// Returns an error if the mapping no longer holds the declared DATA segment.
    pub fn read_all(&self) -> Result<ChannelTable> {
        Ok(self.events()?.read_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mapped_file_reader() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let reader = MappedFileReader::open(file.path()).unwrap();
        assert_eq!(reader.len(), 64);
        assert!(!reader.is_empty());
        assert_eq!(reader.as_bytes(), &data[..]);
        assert_eq!(reader.path(), file.path());
    }

    #[test]
    fn test_event_source_bytes_and_file_agree() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..32).rev().collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let in_memory = EventSource::from(data.clone()).load().unwrap();
        let mapped = EventSource::File(file.path().to_path_buf()).load().unwrap();
        assert_eq!(in_memory.as_ref(), mapped.as_ref());
        assert_eq!(mapped.as_ref(), &data[..]);
    }

    #[test]
    fn test_fcs_reader_rejects_non_fcs() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 80]).unwrap();
        file.flush().unwrap();
        assert!(matches!(
            FcsFileReader::open(file.path()),
            Err(crate::Error::Fcs(cytocomp_fcs::Error::MalformedHeader(_)))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let source = EventSource::File(PathBuf::from("/nonexistent/sample.fcs"));
        assert!(matches!(source.load(), Err(crate::Error::Io(_))));
    }
}
