#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    #[error("no active upstream key available within the acquire timeout")]
    NoKeyAvailable,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyPoolError {
    #[error("unknown key identifier")]
    NotFound,
    #[error("key is currently leased")]
    KeyBusy,
}
