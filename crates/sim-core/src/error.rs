//! Failure kinds shared by every pipeline stage.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// A physical or resource input outside its documented domain.
    #[error("invalid parameter {name} = {value}: expected {expected}")]
    InvalidParameter {
        name: String,
        value: String,
        expected: String,
    },

    /// An external program exited non-zero. `output` holds its combined stdout/stderr.
    #[error("{program} exited with status {status}\n{output}")]
    ExternalProcessFailure {
        program: String,
        status: String,
        output: String,
    },

    /// A post-condition on generated output does not hold.
    #[error("consistency check failed: {0}")]
    ConsistencyFailure(String),

    /// A stage was invoked before the artifact it depends on was written.
    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
}

impl SimError {
    pub fn invalid(name: &str, value: impl ToString, expected: &str) -> Self {
        SimError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Checks `ok` and reports `name = value` as out of `expected` otherwise.
pub fn ensure_param(ok: bool, name: &str, value: impl ToString, expected: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(SimError::invalid(name, value, expected))
    }
}
