use std::fmt;

use crate::extractor::ExtractionFailure;

#[derive(Debug)]
pub enum ReconcileError {
    Extraction(ExtractionFailure),
    AlignmentInfeasible(String),
    PersistenceFailure(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Config(String),
    Other(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Extraction(e) => write!(f, "Extraction failure: {}", e),
            ReconcileError::AlignmentInfeasible(e) => write!(f, "Alignment infeasible: {}", e),
            ReconcileError::PersistenceFailure(e) => write!(f, "Persistence failure: {}", e),
            ReconcileError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ReconcileError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            ReconcileError::Json(e) => write!(f, "JSON error: {}", e),
            ReconcileError::Io(e) => write!(f, "IO error: {}", e),
            ReconcileError::Config(e) => write!(f, "Configuration error: {}", e),
            ReconcileError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<ExtractionFailure> for ReconcileError {
    fn from(err: ExtractionFailure) -> Self {
        ReconcileError::Extraction(err)
    }
}

impl From<bincode::error::EncodeError> for ReconcileError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ReconcileError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for ReconcileError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ReconcileError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Json(err)
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        ReconcileError::Io(err)
    }
}

impl From<String> for ReconcileError {
    fn from(err: String) -> Self {
        ReconcileError::Other(err)
    }
}

impl From<&str> for ReconcileError {
    fn from(err: &str) -> Self {
        ReconcileError::Other(err.to_string())
    }
}
