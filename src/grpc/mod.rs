pub mod client;
pub mod election_service;
pub mod server;
pub mod worker_service;

pub use client::{GrpcLivenessProbe, NextBucket, RemoteDispatcher};
pub use server::GrpcServer;
pub use worker_service::WorkerServiceImpl;
