use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("patch error: {0}")]
    Patch(#[from] json_patch::PatchError),

    #[error("cache did not observe the post-patch version within the poll window")]
    CacheStale,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("cloud provider error: {0}")]
    Cloud(String),

    #[error("http error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
