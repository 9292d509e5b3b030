use thiserror::Error;

#[derive(Error, Debug)]
pub enum SopsGitError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Mangling error: {0}")]
    Mangle(String),

    #[error("The file was not found: {0}")]
    NotFound(String),

    #[error("Please commit all modified files")]
    DirtyWorktree,

    #[error("Please finish rebasing")]
    Rebasing,

    #[error("Not on a branch")]
    NotOnBranch,

    #[error("Not in a git repository")]
    NotInGitRepo,

    #[error("Invalid or absent encryption recipients")]
    InvalidRecipients,

    #[error("MAC mismatch: file may have been tampered with")]
    MacMismatch,

    #[error("Could not unwrap the data key with available identities")]
    NoDataKey,

    #[error("Metadata not found")]
    MetadataNotFound,

    #[error("Command failed: {0}")]
    Subprocess(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SopsGitError>;

impl SopsGitError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SopsGitError::NotFound(_))
    }
}
