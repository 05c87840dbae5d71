use crate::tlv::TlvError;

/// Error kinds shared across the forwarder.
///
/// Control operations (face open, FIB insert, NDT update) return these to the
/// management thread. Data-plane hot paths never surface errors; they count
/// the event and drop the packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FwdError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("allocation failed")]
    Alloc,
    #[error("capacity exhausted")]
    Capacity,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("too large")]
    TooLarge,
    #[error("face is down")]
    FaceDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TlvError> for FwdError {
    fn from(e: TlvError) -> Self {
        FwdError::Decode(e.to_string())
    }
}
