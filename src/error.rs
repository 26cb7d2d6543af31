use thiserror::Error;

use crate::ledger::LedgerError;
use crate::scheduler::JobStatus;
use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum BuildFarmError {
    #[error("{kind} \"{name}\" not found")]
    UnknownTarget { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" does not support architecture \"{arch}\"")]
    UnsupportedArchitecture {
        kind: &'static str,
        name: String,
        arch: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid version control reference: {0}")]
    InvalidVcs(String),

    #[error("Worker \"{0}\" has already subscribed")]
    AlreadySubscribed(String),

    #[error("Worker limit of {0} reached")]
    TooManyWorkers(usize),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u64),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Job #{id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("{kind} \"{name}\" still has {active} active job(s)")]
    TargetBusy {
        kind: &'static str,
        name: String,
        active: usize,
    },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BuildFarmError>;

impl From<BuildFarmError> for tonic::Status {
    fn from(err: BuildFarmError) -> Self {
        let message = err.to_string();
        match err {
            BuildFarmError::UnknownTarget { .. }
            | BuildFarmError::WorkerNotFound(_)
            | BuildFarmError::JobNotFound(_) => tonic::Status::not_found(message),
            BuildFarmError::UnsupportedArchitecture { .. }
            | BuildFarmError::InvalidArgument(_)
            | BuildFarmError::InvalidVcs(_) => tonic::Status::invalid_argument(message),
            BuildFarmError::AlreadySubscribed(_) => tonic::Status::already_exists(message),
            BuildFarmError::InvalidTransition { .. } | BuildFarmError::TargetBusy { .. } => {
                tonic::Status::failed_precondition(message)
            }
            BuildFarmError::TooManyWorkers(_) => tonic::Status::resource_exhausted(message),
            BuildFarmError::QueueClosed => tonic::Status::unavailable(message),
            BuildFarmError::Ledger(LedgerError::NotFound { .. }) => {
                tonic::Status::not_found(message)
            }
            BuildFarmError::Transfer(e) => e.into(),
            BuildFarmError::Grpc(status) => status,
            BuildFarmError::Ledger(_)
            | BuildFarmError::Transport(_)
            | BuildFarmError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn validation_errors_map_to_client_codes() {
        let status: tonic::Status = BuildFarmError::UnknownTarget {
            kind: "package",
            name: "foo".to_string(),
        }
        .into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "package \"foo\" not found");

        let status: tonic::Status = BuildFarmError::AlreadySubscribed("w1".to_string()).into();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status: tonic::Status = BuildFarmError::InvalidVcs("empty url".to_string()).into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn lifecycle_errors_are_failed_preconditions() {
        let status: tonic::Status = BuildFarmError::InvalidTransition {
            id: 7,
            from: JobStatus::Successful,
            to: JobStatus::Processing,
        }
        .into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(
            status.message(),
            "Job #7 cannot move from Successful to Processing"
        );
    }
}
