use thiserror::Error;
use url::Url;

use davbox_core::{AccountSpec, Credentials, RemoteOperation};

const MAX_FILENAME_LENGTH: usize = 250;

/// Where an operation runs. Consecutive queue items with equal targets
/// reuse the lane's cached client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub account: Option<String>,
    pub base_url: Url,
    pub credentials: Credentials,
}

impl Target {
    pub fn account_spec(&self) -> AccountSpec {
        AccountSpec {
            name: self.account.clone(),
            base_url: self.base_url.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn owner(&self) -> &str {
        self.account.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is missing a remote path")]
    MissingPath,
    #[error("invalid file name: {0}")]
    InvalidName(String),
}

/// Inbound request as received from a caller. Validation happens once,
/// at enqueue time; malformed requests never reach a queue.
#[derive(Debug, Clone)]
pub enum OperationRequest {
    Rename {
        target: Target,
        path: String,
        new_name: String,
    },
    Remove {
        target: Target,
        path: String,
        local_only: bool,
        is_last_of_batch: bool,
    },
    Move {
        target: Target,
        src_path: String,
        dst_path: String,
        overwrite: bool,
    },
    Copy {
        target: Target,
        src_path: String,
        dst_path: String,
        overwrite: bool,
    },
    CheckCredentials {
        target: Target,
    },
}

impl OperationRequest {
    pub fn validate(self) -> Result<(Target, RemoteOperation), RequestError> {
        match self {
            OperationRequest::Rename {
                target,
                path,
                new_name,
            } => {
                require_path(&path)?;
                validate_name(&new_name)?;
                Ok((target, RemoteOperation::Rename { path, new_name }))
            }
            OperationRequest::Remove {
                target,
                path,
                local_only,
                is_last_of_batch,
            } => {
                require_path(&path)?;
                Ok((
                    target,
                    RemoteOperation::Remove {
                        path,
                        local_only,
                        is_last_of_batch,
                    },
                ))
            }
            OperationRequest::Move {
                target,
                src_path,
                dst_path,
                overwrite,
            } => {
                require_path(&src_path)?;
                require_path(&dst_path)?;
                Ok((
                    target,
                    RemoteOperation::Move {
                        src_path,
                        dst_path,
                        overwrite,
                    },
                ))
            }
            OperationRequest::Copy {
                target,
                src_path,
                dst_path,
                overwrite,
            } => {
                require_path(&src_path)?;
                require_path(&dst_path)?;
                Ok((
                    target,
                    RemoteOperation::Copy {
                        src_path,
                        dst_path,
                        overwrite,
                    },
                ))
            }
            OperationRequest::CheckCredentials { target } => {
                Ok((target, RemoteOperation::CheckCredentials))
            }
        }
    }
}

fn require_path(path: &str) -> Result<(), RequestError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(RequestError::MissingPath);
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), RequestError> {
    if name.is_empty() || name.contains('/') || name.len() > MAX_FILENAME_LENGTH {
        return Err(RequestError::InvalidName(name.to_string()));
    }
    Ok(())
}
