use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A request to the cluster API failed.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cluster cache has not completed its initial sync")]
    CacheNotReady,

    /// A thread panicked while holding the store writer.
    #[error("cluster cache table for {0} is poisoned")]
    CachePoisoned(&'static str),

    /// Events can only be applied by hand while no watch owns the store.
    #[error("cluster cache for {0} is fed by a live watch")]
    WatchActive(&'static str),

    #[error("unknown log level `{0}`, expected one of: error, info, debug")]
    UnknownLogLevel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
