use std::path::PathBuf;

/// Error type for registry reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Filesystem failure while touching the registry file
    #[error("registry I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A record could not be encoded as a JSON line
    #[error("encode registry record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
