use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("document is not valid utf-8: {0}")]
    InvalidUtf8(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "collection {collection} was built with {stored_model} ({stored_dimensions} dims), \
         not {model} ({dimensions} dims)"
    )]
    ModelMismatch {
        collection: String,
        stored_model: String,
        stored_dimensions: usize,
        model: String,
        dimensions: usize,
    },

    #[error("remote mirror unusable: {0}")]
    Mirror(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("{backend} returned {status} for {path}")]
    Status {
        backend: String,
        status: u16,
        path: String,
    },

    #[error("missing storage credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid storage config: {0}")]
    Config(String),

    #[error("invalid remote path: {0}")]
    InvalidPath(String),

    #[error("malformed listing: {0}")]
    Xml(String),
}

impl StorageError {
    /// Whether retrying later could succeed. Authentication and configuration
    /// problems never heal on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(_) => true,
            StorageError::Http(error) => !error.is_builder() && !error.is_decode(),
            StorageError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            StorageError::Url(_)
            | StorageError::MissingCredentials(_)
            | StorageError::Config(_)
            | StorageError::InvalidPath(_)
            | StorageError::Xml(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {0}")]
    Status(u16),

    #[error("embedding response was empty")]
    Empty,

    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum LexiconError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lexicon is not valid json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("lexicon must be an object of categories")]
    NotAMapping,

    #[error("category {category} is malformed: {details}")]
    MalformedCategory { category: String, details: String },

    #[error("keyword pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

#[cfg(test)]
mod tests {
    use super::StorageError;

    #[test]
    fn server_errors_are_transient_and_auth_errors_are_fatal() {
        let busy = StorageError::Status {
            backend: "azure".to_string(),
            status: 503,
            path: "vector_index/law_text/records.jsonl".to_string(),
        };
        let denied = StorageError::Status {
            backend: "azure".to_string(),
            status: 403,
            path: "vector_index".to_string(),
        };

        assert!(busy.is_transient());
        assert!(!denied.is_transient());
        assert!(!StorageError::MissingCredentials("AZURE_STORAGE_KEY".to_string()).is_transient());
    }
}
