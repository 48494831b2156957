pub mod dispatcher;
pub mod leader;

pub use dispatcher::BucketDispatcher;
pub use leader::{LeaderDuties, LivenessProbe};
