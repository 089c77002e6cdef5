#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error with profile: {0}")]
    Profile(String),

    #[error("opendal error: {0}")]
    OpenDal(Box<opendal::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no operator found")]
    NoOperator,

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("settings error: {0}")]
    Settings(#[from] pool_settings::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<opendal::Error> for Error {
    fn from(error: opendal::Error) -> Self {
        Error::OpenDal(Box::new(error))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
