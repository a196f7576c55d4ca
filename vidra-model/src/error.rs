use thiserror::Error;

/// Errors raised while constructing or normalizing model values.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("invalid attribute {name}: {value}")]
    InvalidAttribute { name: String, value: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;
