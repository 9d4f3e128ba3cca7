use broker_provider::ProviderError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Discovery failed and there was nothing cached to fall back to.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(#[source] ProviderError),

    /// Discovery succeeded but does not list this model.
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}
