#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Timeout waiting for peripheral response!")]
    Timeout,
    #[error("No face detected!")]
    NoFace,
    #[error("Multiple faces detected!")]
    MultipleFaces,
    #[error("Frame too dark!")]
    TooDark,
    #[error("Gallery cache unreadable: {0}")]
    StoreCorrupt(String),
    #[error("Gallery rebuild produced no entries - add source images and retry")]
    NoGalleryAvailable,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type LockResult<T> = std::result::Result<T, Error>;
