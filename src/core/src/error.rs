use std::fmt;

use thiserror::Error;

/// Pipeline stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Resolving the image and acquiring layer blobs
    Fetch,
    /// Parsing a layer archive
    Decode,
    /// Applying decoded entries to the snapshot
    Fold,
    /// Writing the flattened archive
    Encode,
    /// Moving the finished archive into place
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Decode => "decode",
            Stage::Fold => "fold",
            Stage::Encode => "encode",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Squash error types
#[derive(Error, Debug)]
pub enum SquashError {
    /// Image reference could not be parsed or resolved
    #[error("Invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Manifest declares zero layers
    #[error("Image {0} declares no layers")]
    EmptyImage(String),

    /// Layer is not a tar, tar+gzip or tar+zstd blob
    #[error("Layer {index} has unsupported media type '{media_type}'")]
    UnsupportedMediaType { index: usize, media_type: String },

    /// A declared layer could not be retrieved
    #[error("Failed to fetch layer {index} ({digest}): {source}")]
    LayerFetchFailed {
        index: usize,
        digest: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Archive header could not be parsed
    #[error("Malformed archive: {0}")]
    MalformedArchive(String),

    /// Member content is shorter than its header declares
    #[error("Truncated stream: {path} declares {expected} bytes, only {actual} available")]
    TruncatedStream {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Member path escapes the archive root
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Run was cancelled before completion
    #[error("Squash cancelled")]
    Cancelled,

    /// Error annotated with the stage (and layer) it occurred in
    #[error("{stage} failed{}: {source}", layer_suffix(.layer))]
    Stage {
        stage: Stage,
        layer: Option<usize>,
        #[source]
        source: Box<SquashError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn layer_suffix(layer: &Option<usize>) -> String {
    match layer {
        Some(index) => format!(" (layer {})", index),
        None => String::new(),
    }
}

impl SquashError {
    /// Wrap this error with the stage it occurred in.
    ///
    /// An error that already carries a stage is returned unchanged so the
    /// innermost annotation wins.
    pub fn at(self, stage: Stage, layer: Option<usize>) -> Self {
        match self {
            err @ SquashError::Stage { .. } => err,
            err => SquashError::Stage {
                stage,
                layer,
                source: Box::new(err),
            },
        }
    }

    /// Stage annotation, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SquashError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Layer index annotation, if any.
    pub fn layer(&self) -> Option<usize> {
        match self {
            SquashError::Stage { layer, .. } => *layer,
            SquashError::UnsupportedMediaType { index, .. }
            | SquashError::LayerFetchFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The underlying error with stage wrappers removed.
    pub fn root_cause(&self) -> &SquashError {
        match self {
            SquashError::Stage { source, .. } => source.root_cause(),
            err => err,
        }
    }

    /// Whether the error came from the image source (bad reference, fetch
    /// failure, unsupported layer type).
    pub fn is_source_error(&self) -> bool {
        matches!(
            self.root_cause(),
            SquashError::InvalidReference { .. }
                | SquashError::EmptyImage(_)
                | SquashError::UnsupportedMediaType { .. }
                | SquashError::LayerFetchFailed { .. }
                | SquashError::RegistryError { .. }
        )
    }

    /// Whether the error reports corrupt or hostile archive content.
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self.root_cause(),
            SquashError::MalformedArchive(_)
                | SquashError::TruncatedStream { .. }
                | SquashError::PathTraversal(_)
        )
    }
}

impl From<serde_json::Error> for SquashError {
    fn from(err: serde_json::Error) -> Self {
        SquashError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SquashError {
    fn from(err: serde_yaml::Error) -> Self {
        SquashError::SerializationError(err.to_string())
    }
}

/// Result type alias for squash operations
pub type Result<T> = std::result::Result<T, SquashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Fetch.to_string(), "fetch");
        assert_eq!(Stage::Decode.to_string(), "decode");
        assert_eq!(Stage::Fold.to_string(), "fold");
        assert_eq!(Stage::Encode.to_string(), "encode");
        assert_eq!(Stage::Publish.to_string(), "publish");
    }

    #[test]
    fn test_empty_image_display() {
        let error = SquashError::EmptyImage("alpine:3.19".to_string());
        assert_eq!(error.to_string(), "Image alpine:3.19 declares no layers");
    }

    #[test]
    fn test_unsupported_media_type_display() {
        let error = SquashError::UnsupportedMediaType {
            index: 2,
            media_type: "application/vnd.in-toto+json".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Layer 2 has unsupported media type 'application/vnd.in-toto+json'"
        );
    }

    #[test]
    fn test_layer_fetch_failed_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = SquashError::LayerFetchFailed {
            index: 1,
            digest: "sha256:abc".to_string(),
            source: Box::new(io),
        };
        assert!(error.to_string().contains("layer 1 (sha256:abc)"));
        assert!(std::error::Error::source(&error).is_some());
        assert_eq!(error.layer(), Some(1));
    }

    #[test]
    fn test_truncated_stream_display() {
        let error = SquashError::TruncatedStream {
            path: "usr/bin/env".to_string(),
            expected: 100,
            actual: 12,
        };
        assert_eq!(
            error.to_string(),
            "Truncated stream: usr/bin/env declares 100 bytes, only 12 available"
        );
    }

    #[test]
    fn test_stage_wrapper_display_with_layer() {
        let error = SquashError::MalformedArchive("bad checksum".to_string())
            .at(Stage::Decode, Some(3));
        assert_eq!(
            error.to_string(),
            "decode failed (layer 3): Malformed archive: bad checksum"
        );
        assert_eq!(error.stage(), Some(Stage::Decode));
        assert_eq!(error.layer(), Some(3));
    }

    #[test]
    fn test_stage_wrapper_display_without_layer() {
        let error = SquashError::Other("rename failed".to_string()).at(Stage::Publish, None);
        assert_eq!(error.to_string(), "publish failed: rename failed");
    }

    #[test]
    fn test_innermost_stage_wins() {
        let error = SquashError::Cancelled
            .at(Stage::Fold, Some(1))
            .at(Stage::Encode, None);
        assert_eq!(error.stage(), Some(Stage::Fold));
        assert!(matches!(error.root_cause(), SquashError::Cancelled));
    }

    #[test]
    fn test_error_classification() {
        let source = SquashError::EmptyImage("x".to_string()).at(Stage::Fetch, None);
        assert!(source.is_source_error());
        assert!(!source.is_codec_error());

        let codec = SquashError::PathTraversal("../etc/passwd".to_string());
        assert!(codec.is_codec_error());
        assert!(!codec.is_source_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: SquashError = io_error.into();
        assert!(matches!(error, SquashError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: SquashError = result.unwrap_err().into();
        assert!(matches!(error, SquashError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: SquashError = result.unwrap_err().into();
        assert!(matches!(error, SquashError::SerializationError(_)));
    }
}
