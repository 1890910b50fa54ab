use objwatch_core::{SourceError, UnknownEventKind};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("list failed for {target}: {source}")]
    List {
        target: String,
        #[source]
        source: SourceError,
    },
    #[error("watch could not be opened for {target}: {source}")]
    WatchOpen {
        target: String,
        #[source]
        source: SourceError,
    },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid target {target}: {reason}")]
    Invalid { target: String, reason: String },
    #[error("duplicate target name: {0}")]
    DuplicateName(String),
    #[error("target {0}: pull mode is not handled by the watch engine")]
    UnsupportedMode(String),
    #[error(transparent)]
    UnknownKind(#[from] UnknownEventKind),
}
