//! Local file source adapter. Also the fallback for URLs without a scheme.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use super::{MIN_SYNC_BUFFER, SourceAdapter, SourceHandle};
use crate::Result;

pub struct FileSource;

struct FileHandle {
    file: File,
    content_pos: u64,
    content_len: u64,
}

impl SourceAdapter for FileSource {
    fn url_protocol(&self) -> &str {
        "file"
    }

    fn buffer_size(&self) -> usize {
        MIN_SYNC_BUFFER
    }

    fn open(&self, url: &str, offset: u64) -> Result<Box<dyn SourceHandle>> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        debug!(path, offset, "opening file source");
        let mut file = File::open(path)?;
        let content_len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(FileHandle {
            file,
            content_pos: offset,
            content_len,
        }))
    }
}

impl SourceHandle for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.content_len > 0 && self.content_pos >= self.content_len {
            return Ok(0);
        }
        let n = self.file.read(buf)?;
        self.content_pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.content_pos = offset;
        Ok(())
    }

    fn content_pos(&self) -> u64 {
        self.content_pos
    }

    fn content_len(&self) -> u64 {
        self.content_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_and_seeks() -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"0123456789")?;
        let url = tmp.path().to_str().unwrap().to_string();

        let mut handle = FileSource.open(&url, 2)?;
        assert_eq!(handle.content_len(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf)?, 4);
        assert_eq!(&buf, b"2345");
        assert_eq!(handle.content_pos(), 6);

        handle.seek(0)?;
        assert_eq!(handle.read(&mut buf)?, 4);
        assert_eq!(&buf, b"0123");

        handle.seek(10)?;
        assert_eq!(handle.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn missing_file_errors() {
        assert!(FileSource.open("/definitely/not/here.mp3", 0).is_err());
    }
}
