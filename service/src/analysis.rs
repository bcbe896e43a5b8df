use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api_envelope::PaginationMeta;
use crate::store::{AnalysisRecord, NewAnalysis, StoreError, TitulosStore};
use crate::workflow_client::{WorkflowClient, WorkflowError};

/// Registry branches that can serve a copia literal request.
pub const VALID_OFICINAS: &[&str] = &[
    "LIMA",
    "AREQUIPA",
    "TRUJILLO",
    "CHICLAYO",
    "CUSCO",
    "HUANCAYO",
    "PIURA",
    "IQUITOS",
    "TACNA",
    "ICA",
    "PUNO",
    "AYACUCHO",
    "JUNIN",
    "LAMBAYEQUE",
    "ANCASH",
    "CAJAMARCA",
    "LORETO",
    "UCAYALI",
    "SAN_MARTIN",
    "TUMBES",
    "MOQUEGUA",
    "MADRE_DE_DIOS",
    "HUANUCO",
    "PASCO",
    "APURIMAC",
    "AMAZONAS",
    "HUANCAVELICA",
];

const DEFAULT_AREA_REGISTRAL: &str = "Propiedad Inmueble Predial";
const MAX_AREA_REGISTRAL_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending and processing records are the only ones still in flight;
    /// completed and failed are terminal.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// An encumbrance found in the registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Carga {
    pub tipo: String,
    pub detalle: String,
    #[serde(default)]
    pub vigente: bool,
    #[serde(default)]
    pub fecha: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAnalysisRequest {
    pub oficina: String,
    pub partida: String,
    #[serde(default = "default_area_registral")]
    pub area_registral: String,
}

fn default_area_registral() -> String {
    DEFAULT_AREA_REGISTRAL.to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisCreatedResponse {
    pub id: String,
    pub status: AnalysisStatus,
    pub oficina: String,
    pub partida: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummaryResponse {
    pub id: String,
    pub oficina: String,
    pub partida: String,
    pub status: AnalysisStatus,
    pub total_asientos: Option<i64>,
    pub cargas_count: usize,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisDetailResponse {
    pub id: String,
    pub oficina: String,
    pub partida: String,
    pub area_registral: String,
    pub status: AnalysisStatus,
    pub total_asientos: Option<i64>,
    pub informe: Option<String>,
    pub cargas_encontradas: Vec<Carga>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub claude_cost_usd: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisServiceError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{message}")]
    Duplicate { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Orchestrates the analysis lifecycle: validate, reject in-flight
/// duplicates, persist as pending, hand off to the workflow engine, and
/// flip the record to failed when the hand-off does not go through.
#[derive(Clone)]
pub struct AnalysisService {
    store: TitulosStore,
    workflow: Option<WorkflowClient>,
}

impl AnalysisService {
    pub fn new(store: TitulosStore, workflow: Option<WorkflowClient>) -> Self {
        Self { store, workflow }
    }

    pub async fn create_analysis(
        &self,
        request: CreateAnalysisRequest,
        owner_id: &str,
    ) -> Result<AnalysisCreatedResponse, AnalysisServiceError> {
        let oficina = validate_oficina(&request.oficina)?;
        let partida = validate_partida(&request.partida)?;
        let area_registral = validate_area_registral(&request.area_registral)?;

        if self
            .store
            .has_in_flight_duplicate(owner_id, &oficina, &partida)
            .await
        {
            tracing::warn!(
                target: "titulos.analysis",
                user_id = %owner_id,
                oficina = %oficina,
                partida = %partida,
                "analysis_duplicate_rejected",
            );
            return Err(AnalysisServiceError::Duplicate {
                message: format!(
                    "An analysis for partida '{partida}' in oficina '{oficina}' is already in progress"
                ),
            });
        }

        let record = self
            .store
            .create_analysis(NewAnalysis {
                requested_by: owner_id.to_string(),
                oficina: oficina.clone(),
                partida: partida.clone(),
                area_registral,
            })
            .await?;
        tracing::info!(
            target: "titulos.analysis",
            analysis_id = %record.id,
            user_id = %owner_id,
            "analysis_record_created",
        );

        let trigger_result = match self.workflow.as_ref() {
            Some(client) => {
                client
                    .trigger(&record.id, &oficina, &partida, &record.area_registral)
                    .await
            }
            None => Err(WorkflowError::Unconfigured),
        };

        if let Err(error) = trigger_result {
            tracing::error!(
                target: "titulos.analysis",
                analysis_id = %record.id,
                error = %error,
                "workflow_trigger_failed",
            );
            let marked = self
                .store
                .update_status(
                    &record.id,
                    AnalysisStatus::Failed,
                    Some(format!("Failed to trigger analysis workflow: {error}")),
                )
                .await;
            if let Err(store_error) = marked {
                tracing::error!(
                    target: "titulos.analysis",
                    analysis_id = %record.id,
                    error = %store_error,
                    "failed_record_rollback_failed",
                );
            }
            return Err(AnalysisServiceError::Workflow(error));
        }

        Ok(AnalysisCreatedResponse {
            id: record.id,
            status: record.status,
            oficina: record.oficina,
            partida: record.partida,
            created_at: record.created_at,
        })
    }

    pub async fn get_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<AnalysisDetailResponse, AnalysisServiceError> {
        let record = self.store.get_analysis(analysis_id, owner_id).await?;
        Ok(map_to_detail(record))
    }

    pub async fn list_analyses(
        &self,
        owner_id: &str,
        page: u64,
        per_page: u64,
        status: Option<AnalysisStatus>,
    ) -> Result<(Vec<AnalysisSummaryResponse>, PaginationMeta), AnalysisServiceError> {
        let (rows, total) = self
            .store
            .list_analyses(owner_id, page, per_page, status)
            .await?;
        let summaries = rows.into_iter().map(map_to_summary).collect();
        Ok((
            summaries,
            PaginationMeta {
                page,
                per_page,
                total,
            },
        ))
    }

    pub async fn cancel_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<AnalysisDetailResponse, AnalysisServiceError> {
        let record = self.store.cancel_analysis(analysis_id, owner_id).await?;
        tracing::info!(
            target: "titulos.analysis",
            analysis_id = %analysis_id,
            "analysis_cancelled",
        );
        Ok(map_to_detail(record))
    }

    pub async fn delete_analysis(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<(), AnalysisServiceError> {
        self.store.delete_analysis(analysis_id, owner_id).await?;
        tracing::info!(
            target: "titulos.analysis",
            analysis_id = %analysis_id,
            "analysis_deleted",
        );
        Ok(())
    }

    pub async fn get_pdf_storage_path(
        &self,
        analysis_id: &str,
        owner_id: &str,
    ) -> Result<Option<String>, AnalysisServiceError> {
        let record = self.store.get_analysis(analysis_id, owner_id).await?;
        Ok(record.pdf_path)
    }
}

pub fn validate_oficina(raw: &str) -> Result<String, AnalysisServiceError> {
    let normalized = raw.trim().to_uppercase();
    if VALID_OFICINAS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(AnalysisServiceError::Validation {
            field: "oficina",
            message: format!("Invalid oficina '{raw}'"),
        })
    }
}

pub fn validate_partida(raw: &str) -> Result<String, AnalysisServiceError> {
    let cleaned = raw.trim();
    let digits_only = cleaned.chars().all(|character| character.is_ascii_digit());
    if digits_only && (6..=12).contains(&cleaned.len()) {
        Ok(cleaned.to_string())
    } else {
        Err(AnalysisServiceError::Validation {
            field: "partida",
            message: "Partida must contain only digits and be between 6 and 12 characters long"
                .to_string(),
        })
    }
}

pub fn validate_area_registral(raw: &str) -> Result<String, AnalysisServiceError> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Err(AnalysisServiceError::Validation {
            field: "area_registral",
            message: "area_registral cannot be empty".to_string(),
        });
    }
    if cleaned.chars().count() > MAX_AREA_REGISTRAL_CHARS {
        return Err(AnalysisServiceError::Validation {
            field: "area_registral",
            message: format!(
                "area_registral is too long (max {MAX_AREA_REGISTRAL_CHARS} characters)"
            ),
        });
    }
    Ok(cleaned.to_string())
}

fn map_to_detail(record: AnalysisRecord) -> AnalysisDetailResponse {
    AnalysisDetailResponse {
        id: record.id,
        oficina: record.oficina,
        partida: record.partida,
        area_registral: record.area_registral,
        status: record.status,
        total_asientos: record.total_asientos,
        informe: record.informe,
        cargas_encontradas: record.cargas_encontradas.unwrap_or_default(),
        error_message: record.error_message,
        started_at: record.started_at,
        completed_at: record.completed_at,
        duration_seconds: record.duration_seconds,
        claude_cost_usd: record.claude_cost_usd,
        created_at: record.created_at,
    }
}

fn map_to_summary(record: AnalysisRecord) -> AnalysisSummaryResponse {
    AnalysisSummaryResponse {
        id: record.id,
        oficina: record.oficina,
        partida: record.partida,
        status: record.status,
        total_asientos: record.total_asientos,
        cargas_count: record
            .cargas_encontradas
            .as_ref()
            .map_or(0, std::vec::Vec::len),
        duration_seconds: record.duration_seconds,
        created_at: record.created_at,
        completed_at: record.completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oficina_is_normalized_case_insensitively() {
        assert_eq!(validate_oficina(" lima ").expect("valid"), "LIMA");
        assert_eq!(
            validate_oficina("madre_de_dios").expect("valid"),
            "MADRE_DE_DIOS"
        );
    }

    #[test]
    fn unknown_oficina_is_rejected() {
        assert!(matches!(
            validate_oficina("ATLANTIS"),
            Err(AnalysisServiceError::Validation { field: "oficina", .. })
        ));
    }

    #[test]
    fn partida_accepts_six_to_twelve_digits() {
        assert_eq!(validate_partida(" 123456 ").expect("valid"), "123456");
        assert_eq!(
            validate_partida("123456789012").expect("valid"),
            "123456789012"
        );
    }

    #[test]
    fn partida_rejects_bad_shapes() {
        for raw in ["12345", "1234567890123", "12345a78", "", "P0123456"] {
            assert!(
                matches!(
                    validate_partida(raw),
                    Err(AnalysisServiceError::Validation { field: "partida", .. })
                ),
                "partida '{raw}' should be rejected"
            );
        }
    }

    #[test]
    fn area_registral_bounds() {
        assert_eq!(validate_area_registral("  Predial  ").expect("valid"), "Predial");
        assert!(validate_area_registral("   ").is_err());
        assert!(validate_area_registral(&"x".repeat(201)).is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisStatus::Failed,
        ] {
            assert_eq!(AnalysisStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AnalysisStatus::parse("cancelled"), None);
    }

    #[test]
    fn terminal_statuses_are_not_in_flight() {
        assert!(AnalysisStatus::Pending.is_in_flight());
        assert!(AnalysisStatus::Processing.is_in_flight());
        assert!(!AnalysisStatus::Completed.is_in_flight());
        assert!(!AnalysisStatus::Failed.is_in_flight());
    }
}
