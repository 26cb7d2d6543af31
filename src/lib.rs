pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod grpc;
pub mod ledger;
pub mod scheduler;
pub mod shutdown;
pub mod transfer;
pub mod worker;

// Generated protobuf types
pub mod proto {
    tonic::include_proto!("builder");
}
