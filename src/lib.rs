pub mod boundary;
pub mod checkout;
pub mod config;
pub mod election;
pub mod error;
pub mod grpc;
pub mod model;
pub mod node;
pub mod notify;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("farm");
}
