//! Ingestion error types

use clinforge_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported file type '{extension}' for {path}")]
    UnsupportedFormat { path: String, extension: String },

    #[error("PDF parse error for {path}: {message}")]
    PdfParseError { path: String, message: String },

    #[error("Conversion failed for {path}: {message}")]
    ConversionError { path: String, message: String },

    #[error("Invalid source locator: {0}")]
    InvalidLocator(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::FileNotFound(path) => AppError::not_found("file", path),
            IngestionError::UnsupportedFormat { .. } | IngestionError::InvalidLocator(_) => {
                AppError::validation(e.to_string())
            }
            IngestionError::PdfParseError { .. } | IngestionError::ConversionError { .. } => {
                AppError::Conversion {
                    message: e.to_string(),
                }
            }
            IngestionError::IoError(io) => AppError::from(io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_app_error_kinds() {
        let err: AppError = IngestionError::FileNotFound("/tmp/x.pdf".into()).into();
        assert!(matches!(err, AppError::NotFound { .. }));

        let err: AppError = IngestionError::UnsupportedFormat {
            path: "a.xyz".into(),
            extension: "xyz".into(),
        }
        .into();
        assert!(matches!(err, AppError::Validation { .. }));

        let err: AppError = IngestionError::ConversionError {
            path: "a.docx".into(),
            message: "exit 1".into(),
        }
        .into();
        assert!(matches!(err, AppError::Conversion { .. }));
    }
}
