//! Asynchronous JSONL tail reader with file rotation detection

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Where reading starts when the file is (re)opened for the first time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    Beginning,
    End,
}

pub struct TailReader {
    path: PathBuf,
    start: TailStart,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    position: u64,
    poll_interval: Duration,
}

impl TailReader {
    pub fn new(path: PathBuf, start: TailStart) -> Self {
        Self {
            path,
            start,
            file: None,
            inode: None,
            position: 0,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Open the file at the configured start position
    pub async fn start(&mut self) -> std::io::Result<()> {
        self.open(self.start).await?;
        log::info!("📖 Started tailing: {}", self.path.display());
        Ok(())
    }

    async fn open(&mut self, start: TailStart) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;

        #[cfg(unix)]
        {
            self.inode = Some(file.metadata().await?.ino());
        }

        let mut reader = BufReader::new(file);
        self.position = match start {
            TailStart::End => reader.seek(SeekFrom::End(0)).await?,
            TailStart::Beginning => 0,
        };
        self.file = Some(reader);
        Ok(())
    }

    /// Read the next non-empty line, waiting for new data if necessary
    ///
    /// A rotated or truncated file is reopened from its beginning.
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        if self.file.is_none() {
            self.start().await?;
        }

        loop {
            if self.detect_rotation().await? {
                log::info!("🔄 File rotation detected, reopening: {}", self.path.display());
                self.open(TailStart::Beginning).await?;
            }

            let Some(ref mut reader) = self.file else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "File not opened",
                ));
            };

            let mut line = String::new();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                sleep(self.poll_interval).await;
                continue;
            }
            self.position += read as u64;

            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }

    /// Rotated: the inode changed (unix) or the file shrank below our position
    async fn detect_rotation(&self) -> std::io::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Between rename and re-creation; keep reading the old handle
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        #[cfg(unix)]
        {
            if self.inode.map_or(false, |old| old != metadata.ino()) {
                return Ok(true);
            }
        }

        Ok(metadata.len() < self.position)
    }
}
