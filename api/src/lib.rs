#![deny(clippy::as_conversions)]
//! Types shared between nodes of the cluster
//!
//! Everything that crosses a process boundary (peer connections)
//! or lands on disk (chunk files, log records) is defined here, with
//! its byte layout expressed through `binrw`.
use binrw::binrw;
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use uuid::Uuid;

mod chunk;
pub use self::chunk::*;

mod record;
pub use self::record::*;

mod member;
pub use self::member::*;

mod client;
pub use self::client::*;

pub mod peer;

/// Milliseconds since unix epoch
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[binrw]
        #[brw(big)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(
            #[br(map = |bytes: [u8; 16]| Uuid::from_bytes(bytes))]
            #[bw(map = |id: &Uuid| *id.as_bytes())]
            pub Uuid,
        );

        impl $name {
            pub const BYTE_SIZE: usize = 16;

            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Instance id of a node
    ///
    /// Generated randomly unless configured. Ordering of ids is
    /// the last tie-breaker when ranking master candidates.
    NodeId
);
uuid_id!(
    /// Id of a leadership epoch
    EpochId
);
uuid_id!(
    /// Id of a chunk, preserved byte-for-byte on replicas
    ChunkId
);
uuid_id!(
    /// Freshness token of a replication subscription
    SubscriptionId
);
uuid_id!(
    /// Id correlating requests and responses (and role transitions)
    CorrelationId
);

/// Role of a node in the cluster
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Display,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum VNodeState {
    Initializing = 0,
    Unknown = 1,
    PreReplica = 2,
    CatchingUp = 3,
    Clone = 4,
    Slave = 5,
    PreMaster = 6,
    Master = 7,
    Manager = 8,
    ShuttingDown = 9,
    Shutdown = 10,
}

impl Default for VNodeState {
    fn default() -> Self {
        VNodeState::Initializing
    }
}

impl VNodeState {
    /// A replica that receives log data from the master
    pub fn is_replica(self) -> bool {
        matches!(
            self,
            VNodeState::CatchingUp | VNodeState::Clone | VNodeState::Slave
        )
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, VNodeState::ShuttingDown | VNodeState::Shutdown)
    }
}

#[test]
fn vnode_state_repr() {
    assert_eq!(u8::from(VNodeState::Master), 7);
    assert_eq!(VNodeState::try_from(5u8).unwrap(), VNodeState::Slave);
    assert!(VNodeState::try_from(200u8).is_err());
}
