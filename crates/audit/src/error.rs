use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Audit writer is gone")]
    WriterGone,
}

pub type Result<T> = std::result::Result<T, AuditError>;
