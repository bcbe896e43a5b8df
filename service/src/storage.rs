use std::path::{Path, PathBuf};

const ARTIFACT_FILE_NAME: &str = "copia_literal.pdf";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("artifact not found at path: {path}")]
    NotFound { path: String },
    #[error("{message}")]
    Io { message: String },
}

/// Filesystem home for the certified-copy PDFs. Constructed once at
/// startup and handed into request contexts by reference; artifacts live
/// at `{owner_id}/{analysis_id}/copia_literal.pdf` under the root.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
}

impl ArtifactStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|error| StorageError::Io {
                message: format!("failed to create storage root: {error}"),
            })?;
        tracing::info!(
            target: "titulos.storage",
            path = %self.root.display(),
            "storage_root_ready",
        );
        Ok(())
    }

    /// Persist a PDF and return its storage path relative to the root.
    /// Writing the same analysis twice overwrites in place.
    pub async fn save_pdf(
        &self,
        owner_id: &str,
        analysis_id: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let relative = Path::new(owner_id).join(analysis_id).join(ARTIFACT_FILE_NAME);
        let destination = self.root.join(&relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StorageError::Io {
                    message: format!("failed to create artifact directory: {error}"),
                })?;
        }
        tokio::fs::write(&destination, bytes)
            .await
            .map_err(|error| StorageError::Io {
                message: format!("failed to write artifact: {error}"),
            })?;

        let relative = relative.to_string_lossy().into_owned();
        tracing::info!(
            target: "titulos.storage",
            user_id = %owner_id,
            analysis_id = %analysis_id,
            path = %relative,
            "pdf_saved",
        );
        Ok(relative)
    }

    /// Resolve a stored relative path to an absolute one, verifying the
    /// file actually exists.
    pub async fn resolve_pdf(&self, storage_path: &str) -> Result<PathBuf, StorageError> {
        let full_path = self.root.join(storage_path);
        match tokio::fs::try_exists(&full_path).await {
            Ok(true) => Ok(full_path),
            Ok(false) => Err(StorageError::NotFound {
                path: storage_path.to_string(),
            }),
            Err(error) => Err(StorageError::Io {
                message: format!("failed to stat artifact: {error}"),
            }),
        }
    }
}
