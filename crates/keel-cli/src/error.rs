//! Error types for the CLI

use std::path::PathBuf;

use keel_move::MoveError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Move(#[from] MoveError),

    #[error(transparent)]
    Common(#[from] keel_common::Error),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code: 2 for problems found before any change, 3 when a
    /// run stopped part-way, 130 on interrupt, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Move(e) => e.exit_code(),
            _ => 1,
        }
    }

    /// Extra lines telling the operator what state the clusters are in
    pub fn details(&self) -> Vec<String> {
        let Error::Move(MoveError::Aborted {
            migrated, deleted, ..
        }) = self
        else {
            return Vec::new();
        };

        let mut lines = Vec::new();
        if !migrated.is_empty() {
            lines.push(format!("{} object(s) already exist on the target:", migrated.len()));
            lines.extend(migrated.iter().map(|id| format!("  {}", id.display())));
        }
        if !deleted.is_empty() {
            lines.push(format!("{} object(s) already deleted from the source:", deleted.len()));
            lines.extend(deleted.iter().map(|id| format!("  {}", id.display())));
        }
        if !migrated.is_empty() {
            lines.push("Re-running the move adopts the objects already on the target.".to_string());
        }
        lines
    }
}
