use std::path::PathBuf;

use thiserror::Error;

pub type TiResult<T> = Result<T, TiError>;

#[derive(Debug, Error)]
pub enum TiError {
    #[error("invalid montage '{montage}': {reason}")]
    Configuration { montage: String, reason: String },

    #[error("field samples do not align: {0}")]
    InputMismatch(String),

    #[error("{tool} failed ({status}): {excerpt}")]
    ExternalTool {
        tool: String,
        status: String,
        excerpt: String,
    },

    #[error("missing required artifacts: {}", .missing.join(", "))]
    FileVerification { missing: Vec<String> },

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

impl TiError {
    pub fn config(montage: impl Into<String>, reason: impl Into<String>) -> Self {
        TiError::Configuration {
            montage: montage.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TiError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        TiError::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable label used in completion reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TiError::Configuration { .. } => "configuration",
            TiError::InputMismatch(_) => "input_mismatch",
            TiError::ExternalTool { .. } => "external_tool",
            TiError::FileVerification { .. } => "file_verification",
            TiError::Timeout { .. } => "timeout",
            TiError::Io { .. } => "io",
            TiError::Parse { .. } => "parse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(TiError::config("m", "bad").kind(), "configuration");
        assert_eq!(TiError::InputMismatch("x".into()).kind(), "input_mismatch");
        assert_eq!(TiError::Timeout { seconds: 3 }.kind(), "timeout");
    }

    #[test]
    fn verification_message_lists_every_missing_path() {
        let err = TiError::FileVerification {
            missing: vec!["a.json".into(), "b.nii.gz".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing required artifacts: a.json, b.nii.gz"
        );
    }

    #[test]
    fn configuration_message_names_the_montage() {
        let err = TiError::config("L_Insula", "pair count 3");
        assert!(err.to_string().contains("L_Insula"));
    }
}
