use fox_link::LinkError;
use fox_radio::SamplerError;
use fox_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("rover unavailable: {0}")]
    LinkUnavailable(String),

    #[error("radio unavailable: {0}")]
    SamplerUnavailable(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("could not save calibration: {0}")]
    Io(String),
}

impl ControlError {
    pub(crate) fn busy(what: &str, state: impl std::fmt::Display) -> Self {
        ControlError::Busy(format!("cannot {} while {}", what, state))
    }

    pub(crate) fn not_initialized() -> Self {
        ControlError::LinkUnavailable("drivers not initialized".into())
    }
}

impl From<LinkError> for ControlError {
    fn from(e: LinkError) -> Self {
        ControlError::LinkUnavailable(e.to_string())
    }
}

impl From<SamplerError> for ControlError {
    fn from(e: SamplerError) -> Self {
        ControlError::SamplerUnavailable(e.to_string())
    }
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(msg) => ControlError::InvalidParameter(msg),
            other => ControlError::Io(other.to_string()),
        }
    }
}
