use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::analysis::{AnalysisStatus, Carga};
use crate::config::Config;

/// Users and analyses behind one write lock. Every mutation commits under
/// the lock and is snapshotted to disk before the call returns, which gives
/// each store operation the per-call atomicity the rest of the service
/// relies on.
#[derive(Clone)]
pub struct TitulosStore {
    state: Arc<RwLock<TitulosStoreState>>,
    path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("{message}")]
    AlreadyExists { message: String },
    #[error("{message}")]
    InvalidState { message: String },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub requested_by: String,
    pub oficina: String,
    pub partida: String,
    pub area_registral: String,
    pub status: AnalysisStatus,
    pub total_asientos: Option<i64>,
    pub pdf_path: Option<String>,
    pub informe: Option<String>,
    pub cargas_encontradas: Option<Vec<Carga>>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub claude_cost_usd: Option<BigDecimal>,
    pub progress_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub requested_by: String,
    pub oficina: String,
    pub partida: String,
    pub area_registral: String,
}

/// Merge-only result update: absent fields leave the stored value
/// untouched. `status` is the only field the callback always rewrites.
#[derive(Debug, Clone, Default)]
pub struct ResultUpdate {
    pub total_asientos: Option<i64>,
    pub cargas_encontradas: Option<Vec<Carga>>,
    pub informe: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pdf_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TitulosStoreState {
    users: HashMap<String, UserRecord>,
    users_by_email: HashMap<String, String>,
    analyses: HashMap<String, AnalysisRecord>,
}

impl TitulosStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.store_path.clone();
        let state = Self::load_state(path.as_ref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, StoreError> {
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        self.mutate(move |state| {
            if state.users_by_email.contains_key(&email) {
                return Err(StoreError::AlreadyExists {
                    message: "A user with this email already exists".to_string(),
                });
            }

            let now = Utc::now();
            let user = UserRecord {
                id: format!("user_{}", Uuid::new_v4().simple()),
                email: email.clone(),
                password_hash,
                created_at: now,
                updated_at: now,
            };
            state.users_by_email.insert(email, user.id.clone());
            state.users.insert(user.id.clone(), user.clone());
            Ok(user)
        })
        .await
    }

    pub async fn find_user_by_email(&self, email: &str) -> Option<UserRecord> {
        let state = self.state.read().await;
        let id = state.users_by_email.get(email)?;
        state.users.get(id).cloned()
    }

    pub async fn find_user_by_id(&self, user_id: &str) -> Option<UserRecord> {
        let state = self.state.read().await;
        state.users.get(user_id).cloned()
    }

    // ------------------------------------------------------------------
    // Analyses
    // ------------------------------------------------------------------

    pub async fn create_analysis(&self, input: NewAnalysis) -> Result<AnalysisRecord, StoreError> {
        self.mutate(move |state| {
            let now = Utc::now();
            let record = AnalysisRecord {
                id: format!("an_{}", Uuid::new_v4().simple()),
                requested_by: input.requested_by,
                oficina: input.oficina,
                partida: input.partida,
                area_registral: input.area_registral,
                status: AnalysisStatus::Pending,
                total_asientos: None,
                pdf_path: None,
                informe: None,
                cargas_encontradas: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                duration_seconds: None,
                claude_cost_usd: None,
                progress_log: None,
                created_at: now,
                updated_at: now,
            };
            state.analyses.insert(record.id.clone(), record.clone());
            Ok(record)
        })
        .await
    }

    /// Ownership-scoped fetch. A record owned by someone else reads the
    /// same as a missing one, so ids never leak across accounts.
    pub async fn get_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<AnalysisRecord, StoreError> {
        let state = self.state.read().await;
        state
            .analyses
            .get(analysis_id)
            .filter(|record| record.requested_by == owner_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Unscoped fetch for the workflow callback path, which does not act
    /// on behalf of an end user.
    pub async fn get_analysis_unscoped(
        &self,
        analysis_id: &str,
    ) -> Result<AnalysisRecord, StoreError> {
        let state = self.state.read().await;
        state
            .analyses
            .get(analysis_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Page through one owner's analyses, newest first. Returns the rows
    /// for the requested page and the total count of the filtered set.
    pub async fn list_analyses(
        &self,
        owner_id: &str,
        page: u64,
        per_page: u64,
        status: Option<AnalysisStatus>,
    ) -> Result<(Vec<AnalysisRecord>, u64), StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<AnalysisRecord> = state
            .analyses
            .values()
            .filter(|record| record.requested_by == owner_id)
            .filter(|record| status.map_or(true, |wanted| record.status == wanted))
            .cloned()
            .collect();
        rows.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.id.cmp(&left.id))
        });

        let total = rows.len() as u64;
        let offset = page.saturating_sub(1).saturating_mul(per_page) as usize;
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(per_page as usize)
            .collect();
        Ok((rows, total))
    }

    pub async fn update_status(
        &self,
        analysis_id: &str,
        status: AnalysisStatus,
        error_message: Option<String>,
    ) -> Result<AnalysisRecord, StoreError> {
        let analysis_id = analysis_id.to_string();
        let record = self
            .mutate(move |state| {
                let record = state
                    .analyses
                    .get_mut(&analysis_id)
                    .ok_or(StoreError::NotFound)?;
                record.status = status;
                if let Some(message) = error_message {
                    record.error_message = Some(message);
                }
                record.updated_at = Utc::now();
                Ok(record.clone())
            })
            .await?;
        tracing::info!(
            target: "titulos.store",
            analysis_id = %record.id,
            status = status.as_str(),
            "analysis_status_updated",
        );
        Ok(record)
    }

    /// Apply a result delivery. `duration_seconds` is derived when the same
    /// call carries both timestamps: whole seconds, clamped to zero when
    /// the interval is negative.
    pub async fn update_result(
        &self,
        analysis_id: &str,
        status: AnalysisStatus,
        update: ResultUpdate,
    ) -> Result<AnalysisRecord, StoreError> {
        let analysis_id = analysis_id.to_string();
        let record = self
            .mutate(move |state| {
                let record = state
                    .analyses
                    .get_mut(&analysis_id)
                    .ok_or(StoreError::NotFound)?;
                record.status = status;
                if let Some(total_asientos) = update.total_asientos {
                    record.total_asientos = Some(total_asientos);
                }
                if let Some(cargas) = update.cargas_encontradas {
                    record.cargas_encontradas = Some(cargas);
                }
                if let Some(informe) = update.informe {
                    record.informe = Some(informe);
                }
                if let Some(message) = update.error_message {
                    record.error_message = Some(message);
                }
                if let Some(started_at) = update.started_at {
                    record.started_at = Some(started_at);
                }
                if let Some(completed_at) = update.completed_at {
                    record.completed_at = Some(completed_at);
                }
                if let Some(pdf_path) = update.pdf_path {
                    record.pdf_path = Some(pdf_path);
                }
                if let (Some(started_at), Some(completed_at)) =
                    (update.started_at, update.completed_at)
                {
                    record.duration_seconds =
                        Some((completed_at - started_at).num_seconds().max(0));
                }
                record.updated_at = Utc::now();
                Ok(record.clone())
            })
            .await?;
        tracing::info!(
            target: "titulos.store",
            analysis_id = %record.id,
            status = status.as_str(),
            duration_seconds = record.duration_seconds,
            "analysis_result_updated",
        );
        Ok(record)
    }

    /// Hard delete. Refused while the workflow is still processing the
    /// record; terminal and pending records may be removed.
    pub async fn delete_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        let analysis_id = analysis_id.to_string();
        let owner_id = owner_id.to_string();
        self.mutate(move |state| {
            let record = state
                .analyses
                .get(&analysis_id)
                .filter(|record| record.requested_by == owner_id)
                .ok_or(StoreError::NotFound)?;
            if record.status == AnalysisStatus::Processing {
                return Err(StoreError::InvalidState {
                    message: format!(
                        "Analysis {analysis_id} cannot be deleted while it is processing"
                    ),
                });
            }
            state.analyses.remove(&analysis_id);
            Ok(())
        })
        .await
    }

    /// Cancel an in-flight analysis: pending and processing records flip to
    /// failed with a fixed message; terminal records are left untouched.
    pub async fn cancel_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<AnalysisRecord, StoreError> {
        let analysis_id = analysis_id.to_string();
        let owner_id = owner_id.to_string();
        self.mutate(move |state| {
            let record = state
                .analyses
                .get_mut(&analysis_id)
                .filter(|record| record.requested_by == owner_id)
                .ok_or(StoreError::NotFound)?;
            if !record.status.is_in_flight() {
                return Err(StoreError::InvalidState {
                    message: format!(
                        "Analysis {analysis_id} cannot be cancelled: current status is '{}'",
                        record.status.as_str()
                    ),
                });
            }
            record.status = AnalysisStatus::Failed;
            record.error_message = Some("Cancelled by user".to_string());
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    pub async fn has_in_flight_duplicate(
        &self,
        owner_id: &str,
        oficina: &str,
        partida: &str,
    ) -> bool {
        let state = self.state.read().await;
        state.analyses.values().any(|record| {
            record.requested_by == owner_id
                && record.oficina == oficina
                && record.partida == partida
                && record.status.is_in_flight()
        })
    }

    // ------------------------------------------------------------------
    // Snapshot persistence
    // ------------------------------------------------------------------

    fn load_state(path: Option<&PathBuf>) -> TitulosStoreState {
        let Some(path) = path else {
            return TitulosStoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return TitulosStoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "titulos.store",
                    path = %path.display(),
                    error = %error,
                    "failed to read store snapshot; booting with empty state",
                );
                return TitulosStoreState::default();
            }
        };

        match serde_json::from_str::<TitulosStoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "titulos.store",
                    path = %path.display(),
                    error = %error,
                    "failed to parse store snapshot; booting with empty state",
                );
                TitulosStoreState::default()
            }
        }
    }

    async fn persist_state(&self, snapshot: &TitulosStoreState) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StoreError::Persistence {
                    message: format!("failed to prepare store directory: {error}"),
                })?;
        }

        let payload =
            serde_json::to_vec(snapshot).map_err(|error| StoreError::Persistence {
                message: format!("failed to encode store snapshot: {error}"),
            })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| StoreError::Persistence {
                message: format!("failed to write store snapshot: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| StoreError::Persistence {
                message: format!("failed to finalize store snapshot: {error}"),
            })?;

        Ok(())
    }

    async fn mutate<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut TitulosStoreState) -> Result<T, StoreError>,
    {
        let (result, snapshot) = {
            let mut state = self.state.write().await;
            let result = operation(&mut state)?;
            (result, state.clone())
        };

        self.persist_state(&snapshot).await?;
        Ok(result)
    }
}
