//! File-backed [`Flasher`].
//!
//! Chunks are appended to `update.bin.part` in the image directory.  Applying
//! syncs the file and renames it to `update.bin`, which the boot stage picks
//! up on the next restart.  Aborting removes the partial file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use remise_core::{ACK, NAK};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::application::ota_service::{FlashError, Flasher, FlasherFactory};

const PARTIAL_NAME: &str = "update.bin.part";
const IMAGE_NAME: &str = "update.bin";

/// Writes the received image to a file in `dir`.
#[derive(Debug)]
pub struct FileFlasher {
    dir: PathBuf,
    max_image_size: u64,
    file: Option<File>,
    written: u64,
}

impl FileFlasher {
    pub fn new(dir: PathBuf, max_image_size: u64) -> Self {
        Self {
            dir,
            max_image_size,
            file: None,
            written: 0,
        }
    }

    /// A factory producing one `FileFlasher` per OTA connection.
    pub fn factory(dir: PathBuf, max_image_size: u64) -> FlasherFactory {
        Arc::new(move || Box::new(FileFlasher::new(dir.clone(), max_image_size)) as Box<dyn Flasher>)
    }

    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(PARTIAL_NAME)
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_NAME)
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), FlashError> {
        if self.written + chunk.len() as u64 > self.max_image_size {
            return Err(FlashError::TooLarge {
                max: self.max_image_size,
            });
        }

        if self.file.is_none() {
            fs::create_dir_all(&self.dir).await?;
            let path = self.partial_path();
            debug!("flasher: opening {}", path.display());
            self.file = Some(File::create(&path).await?);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl Flasher for FileFlasher {
    async fn write(&mut self, chunk: &[u8]) -> u8 {
        match self.write_chunk(chunk).await {
            Ok(()) => ACK,
            Err(e) => {
                warn!("flasher: {e}");
                NAK
            }
        }
    }

    async fn apply(&mut self) -> Result<(), FlashError> {
        let Some(mut file) = self.file.take() else {
            return Err(FlashError::NothingWritten);
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let image = self.image_path();
        fs::rename(self.partial_path(), &image).await?;
        info!(
            "flasher: {} bytes written to {}, image ready for restart",
            self.written,
            image.display()
        );
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = fs::remove_file(self.partial_path()).await {
                debug!("flasher: could not remove partial image: {e}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("remise-flasher-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_write_and_apply_produces_image() {
        // Arrange
        let dir = scratch_dir();
        let mut flasher = FileFlasher::new(dir.clone(), 1024);

        // Act
        assert_eq!(flasher.write(&[1, 2, 3]).await, ACK);
        assert_eq!(flasher.write(&[4, 5]).await, ACK);
        flasher.apply().await.unwrap();

        // Assert
        assert_eq!(std::fs::read(dir.join(IMAGE_NAME)).unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(!dir.join(PARTIAL_NAME).exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_nothing_is_created_before_first_write() {
        let dir = scratch_dir();
        let mut flasher = FileFlasher::new(dir.clone(), 1024);

        assert!(matches!(
            flasher.apply().await,
            Err(FlashError::NothingWritten)
        ));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_oversized_image_is_nak() {
        let dir = scratch_dir();
        let mut flasher = FileFlasher::new(dir.clone(), 4);

        assert_eq!(flasher.write(&[0; 3]).await, ACK);
        assert_eq!(flasher.write(&[0; 2]).await, NAK);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_abort_removes_partial_image() {
        let dir = scratch_dir();
        let mut flasher = FileFlasher::new(dir.clone(), 1024);
        flasher.write(&[1]).await;

        flasher.abort().await;
        flasher.abort().await;

        assert!(!dir.join(PARTIAL_NAME).exists());
        assert!(!dir.join(IMAGE_NAME).exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
