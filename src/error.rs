// error.rs

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Every failure a store operation can surface to its caller.
#[derive(Debug, Error)]
pub enum ProfileStoreError {
    #[error("Profile store file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Profile store is corrupt: {0}")]
    Corruption(String),

    #[error(
        "Sample '{sample}' has allele '{allele}' at locus '{locus}' which is absent from the stored mapping \
         ({offending_rows} incoming row(s) affected). Append refuses to extend mappings; run a rebuild over \
         the union of all inputs instead."
    )]
    UnknownAllele {
        sample: String,
        locus: String,
        allele: String,
        offending_rows: usize,
    },

    #[error("No profiles found in {what}")]
    EmptyInput { what: String },

    #[error("Could not acquire lock on {} within {:?}", dir.display(), timeout)]
    LockTimeout { dir: PathBuf, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProfileStoreError> = std::result::Result<T, E>;

impl ProfileStoreError {
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        ProfileStoreError::Corruption(message.into())
    }

    pub(crate) fn empty_input(what: impl Into<String>) -> Self {
        ProfileStoreError::EmptyInput { what: what.into() }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        ProfileStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            message.into(),
        ))
    }

    /// Process exit code for this error kind, shared by every front-end.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProfileStoreError::NotFound { .. } | ProfileStoreError::EmptyInput { .. } => 2,
            ProfileStoreError::UnknownAllele { .. } => 3,
            ProfileStoreError::LockTimeout { .. } => 4,
            ProfileStoreError::Corruption(_) => 5,
            ProfileStoreError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_allele_message_asks_for_rebuild() {
        let err = ProfileStoreError::UnknownAllele {
            sample: "S9".to_string(),
            locus: "locus_2".to_string(),
            allele: "17".to_string(),
            offending_rows: 1,
        };
        let message = err.to_string();
        assert!(message.contains("rebuild"));
        assert!(message.contains("S9"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn empty_input_names_its_origin() {
        let err = ProfileStoreError::empty_input("incoming/*.tsv");
        assert!(err.to_string().contains("incoming/*.tsv"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn io_errors_convert_through_question_mark() {
        fn failing() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(failing(), Err(ProfileStoreError::Io(_))));
    }
}
