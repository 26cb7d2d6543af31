pub mod builder_service;
pub mod convert;
pub mod server;

pub use builder_service::BuilderService;
pub use server::GrpcServer;
