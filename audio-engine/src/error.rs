use audio_backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no active audio device")]
    NoActiveDevice,
    #[error("failed to open audio source: {0}")]
    SourceOpen(String),
    #[error("decode failure: {0}")]
    Decode(String),
    #[error("source is not seekable")]
    Unseekable,
}
