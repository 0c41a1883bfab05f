/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid voucher: {0}")]
    InvalidVoucher(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] prost::EncodeError),

    #[error("deserialization error: {0}")]
    DeserializationError(#[from] prost::DecodeError),

    #[error("invalid text encoding: {0}")]
    TextEncoding(#[from] base64::DecodeError),

    #[error("missing required field: {0}")]
    MissingField(String),
}
