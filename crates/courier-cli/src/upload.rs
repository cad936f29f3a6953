//! The `upload-movie` task and its local demo handler.
//!
//! The handler only checks that the file is readable and reports its size.
//! Hosting-provider uploads plug in here as another `Handler<UploadPayload>`.

use std::path::PathBuf;

use async_trait::async_trait;
use courier_core::typed::{Handler, Task};
use courier_core::HandlerError;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<u64>,
    pub title: String,
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

impl Task for UploadPayload {
    const TYPE: &'static str = "upload-movie";
}

impl UploadPayload {
    /// An episode upload carries both numbers, a movie neither.
    pub fn check(&self) -> Result<(), HandlerError> {
        match (self.season, self.episode) {
            (Some(_), None) | (None, Some(_)) => Err(HandlerError::InvalidPayload(format!(
                "{}: season and episode must be given together",
                self.upload_id
            ))),
            _ => Ok(()),
        }
    }
}

pub struct UploadMovieHandler;

#[async_trait]
impl Handler<UploadPayload> for UploadMovieHandler {
    async fn handle(&self, task: UploadPayload) -> Result<(), HandlerError> {
        task.check()?;
        let metadata = tokio::fs::metadata(&task.file_path).await.map_err(|e| {
            HandlerError::new(format!(
                "{}: cannot read {}: {e}",
                task.upload_id,
                task.file_path.display()
            ))
        })?;
        if !metadata.is_file() {
            return Err(HandlerError::new(format!(
                "{}: {} is not a regular file",
                task.upload_id,
                task.file_path.display()
            )));
        }
        info!(
            upload_id = %task.upload_id,
            title = %task.title,
            tmdb_id = ?task.tmdb_id,
            season = ?task.season,
            episode = ?task.episode,
            bytes = metadata.len(),
            "upload file ready"
        );
        Ok(())
    }
}
