//! The list/watch seam. The engine only talks to the API server through
//! [`ListWatchSource`], so tests can script a server and the kube-backed
//! implementation stays in `objwatch-kubehub`.

use futures::stream::BoxStream;

use crate::WatchEvent;

/// Namespace and selectors a list/watch call is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
}

/// Result of a full list.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// `None` when the server did not report one.
    pub resource_version: Option<String>,
    pub items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The resourceVersion is too old; a full relist is required.
    #[error("resource version gone: {0}")]
    Gone(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl SourceError {
    pub fn is_gone(&self) -> bool {
        matches!(self, SourceError::Gone(_))
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

#[async_trait::async_trait]
pub trait ListWatchSource: Send + Sync {
    async fn list(&self, scope: &Scope) -> Result<ListResult, SourceError>;

    /// Open a watch starting after `resource_version`.
    async fn watch(&self, scope: &Scope, resource_version: &str) -> Result<WatchStream, SourceError>;
}
