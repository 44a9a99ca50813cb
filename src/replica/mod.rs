pub mod manager;

pub use manager::{Replica, ReplicaError, ReplicaInfo, ReplicaManager, ReplicaStatus};
