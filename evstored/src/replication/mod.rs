//! Log replication between the master and its replicas
//!
//! The master streams its log to every subscribed replica. Replicas in
//! `Slave` role acknowledge durable positions, and a client write
//! completes once a majority of the cluster has it.
mod commit;
mod leader;
mod replica;

pub use self::leader::{MasterReplicationService, SERVICE_NAME as MASTER_REPLICATION_SERVICE};
pub use self::replica::ReplicaService;
