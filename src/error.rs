use crate::artifact::ArtifactKind;
use crate::data::StackOffsetType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A keyed lookup missed: function, comment, patch, struct, stack
    /// variable or tree entry.
    #[error("{0} not found")]
    NotFound(String),

    /// The state tree has no `metadata.toml`.
    #[error("metadata not found in state tree")]
    MetadataNotFound,

    /// A required field had the wrong TOML type.
    #[error("type mismatch for `{field}`: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("malformed {kind} record: {source}")]
    Malformed {
        kind: ArtifactKind,
        #[source]
        source: toml::de::Error,
    },

    #[error("`{path}` is not valid UTF-8: {source}")]
    NotUtf8 {
        path: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("cannot convert stack offset from {from:?} to {to:?}")]
    UnsupportedConversion {
        from: StackOffsetType,
        to: StackOffsetType,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Git error: {0}")]
    Git(String),
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
