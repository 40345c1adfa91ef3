use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// Failures raised by the attendance store. The variants are split by the
/// phase of `replace_all` they happened in, because a failure after the clear
/// phase leaves the session without any attendance.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tempo esgotado aguardando o banco de presenças: {0}")]
    Timeout(String),

    #[error("falha ao limpar as presenças da aula {session_id}: {message}")]
    ClearFailed { session_id: String, message: String },

    #[error("presenças da aula {session_id} foram apagadas mas as novas não foram salvas: {message}")]
    RepopulateFailed {
        session_id: String,
        message: String,
        retryable: bool,
    },

    #[error("falha ao consultar presenças: {0}")]
    Query(String),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::RepopulateFailed { retryable, .. } => *retryable,
            StoreError::ClearFailed { .. } | StoreError::Query(_) => false,
        }
    }
}

/// True when SQLite gave up waiting on a lock held by another connection.
pub fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Maps a read-side SQLite error onto the store error kinds.
pub fn query_error(e: rusqlite::Error) -> StoreError {
    if is_busy(&e) {
        StoreError::Timeout(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryProblem {
    pub index: usize,
    pub student_id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registro não encontrado ({entity}): {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{} {} de presença {}", problems.len(), if problems.len() == 1 { "registro" } else { "registros" }, if problems.len() == 1 { "rejeitado" } else { "rejeitados" })]
    Validation { problems: Vec<EntryProblem> },

    #[error("Nenhuma presença foi marcada")]
    EmptyBatch,

    #[error("Nenhuma presença válida encontrada")]
    NoValidRows { errors: Vec<String> },

    #[error("Arquivo deve conter pelo menos uma linha de dados")]
    EmptySheet,

    #[error("não foi possível ler a planilha: {0}")]
    UnreadableSheet(String),

    #[error("planilha tem {rows} linhas de dados, o limite é {limit}")]
    TooManyRows { rows: usize, limit: usize },

    #[error("importação interrompida após {processed} linhas")]
    Cancelled { processed: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation { .. } => "validation_failed",
            EngineError::EmptyBatch => "empty_batch",
            EngineError::NoValidRows { .. } => "no_valid_rows",
            EngineError::EmptySheet => "empty_sheet",
            EngineError::UnreadableSheet(_) => "unreadable_sheet",
            EngineError::TooManyRows { .. } => "too_many_rows",
            EngineError::Cancelled { .. } => "import_cancelled",
            EngineError::Store(StoreError::Timeout(_)) => "store_timeout",
            EngineError::Store(StoreError::ClearFailed { .. }) => "attendance_clear_failed",
            EngineError::Store(StoreError::RepopulateFailed { .. }) => {
                "attendance_cleared_not_saved"
            }
            EngineError::Store(StoreError::Query(_)) => "db_query_failed",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            EngineError::Cancelled { .. } => true,
            EngineError::Store(e) => e.retryable(),
            _ => false,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(query_error(e))
    }
}
