use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evstored_api::peer::{self, Heartbeat, PeerMessage, SubscribeReplica};
use evstored_api::{MemberInfo, NodeId, SubscriptionId, VNodeState};
use tracing::{debug, info, trace, warn};

use crate::bus::{run_queue, Publisher};
use crate::cluster::NodeInfo;
use crate::db::ChunkDb;
use crate::epoch::EpochManager;
use crate::message::{ClientMessage, Message, ReplicationMessage, StorageMessage, SystemMessage};
use crate::node::NodeShared;
use crate::peer::read_frame;
use crate::task::AutoJoinHandle;

/// Epochs sent with a subscription request
pub const LAST_EPOCHS_SENT: usize = 5;

#[derive(Copy, Clone, Debug)]
pub struct ReplicaTimeouts {
    pub connect: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Connection to the master, with a thread reading from it
struct MasterConnection {
    endpoint: SocketAddr,
    stream: TcpStream,
    closed_by_us: Arc<AtomicBool>,
    /// Messages received so far
    received: Arc<AtomicU64>,
    #[allow(unused)]
    reader: AutoJoinHandle,
}

impl MasterConnection {
    fn connect(
        endpoint: SocketAddr,
        main_queue: flume::Sender<Message>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&endpoint, timeout)?;
        stream.set_nodelay(true)?;
        let closed_by_us = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicU64::new(0));

        let reader = AutoJoinHandle::spawn("replica-reader", {
            let mut stream = stream.try_clone()?;
            let closed_by_us = closed_by_us.clone();
            let received = received.clone();
            move || loop {
                let msg = match read_frame(&mut stream) {
                    Ok(msg) => msg,
                    Err(e) => {
                        if !closed_by_us.load(Ordering::SeqCst) {
                            warn!(%endpoint, error = %e, "Connection to master lost");
                            main_queue.publish(SystemMessage::VNodeConnectionLost { endpoint }.into());
                        }
                        return;
                    }
                };
                received.fetch_add(1, Ordering::SeqCst);
                if let Some(msg) = Self::to_message(msg) {
                    main_queue.publish(msg);
                }
            }
        })?;

        Ok(Self {
            endpoint,
            stream,
            closed_by_us,
            received,
            reader,
        })
    }

    fn to_message(msg: PeerMessage) -> Option<Message> {
        Some(match msg {
            PeerMessage::ReplicaSubscribed(m) => ReplicationMessage::ReplicaSubscribed(m).into(),
            PeerMessage::ReplicaSubscriptionRetry(m) => {
                ReplicationMessage::ReplicaSubscriptionRetry(m).into()
            }
            PeerMessage::CreateChunk(m) => ReplicationMessage::CreateChunk(m).into(),
            PeerMessage::RawChunkBulk(m) => ReplicationMessage::RawChunkBulk(m).into(),
            PeerMessage::DataChunkBulk(m) => ReplicationMessage::DataChunkBulk(m).into(),
            PeerMessage::SlaveAssignment(m) => ReplicationMessage::SlaveAssignment(m).into(),
            PeerMessage::CloneAssignment(m) => ReplicationMessage::CloneAssignment(m).into(),
            PeerMessage::ForwardWriteCompleted(m) => {
                ClientMessage::ForwardedWriteCompleted(m).into()
            }
            PeerMessage::HeartbeatResponse(_) => return None,
            other => {
                debug!(msg = ?other, "Unexpected message from master");
                return None;
            }
        })
    }

    fn send(&mut self, msg: &PeerMessage) -> io::Result<()> {
        self.stream.write_all(&msg.to_frame())
    }
}

impl Drop for MasterConnection {
    fn drop(&mut self) {
        self.closed_by_us.store(true, Ordering::SeqCst);
        // unblocks the reader, which gets joined right after
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Replica side of replication
///
/// Keeps the connection to the master, subscribes to its log,
/// sends acknowledgements and forwarded client writes over it and
/// watches it with heartbeats.
pub struct Replica {
    publisher: flume::Sender<Message>,
    db: Arc<ChunkDb>,
    epochs: Arc<EpochManager>,
    info: NodeInfo,
    timeouts: ReplicaTimeouts,

    state: VNodeState,
    master: Option<MemberInfo>,
    subscription: Option<SubscriptionId>,
    connection: Option<MasterConnection>,
    /// Bumped on every (re)connect, so heartbeat ticks of older connections are ignored
    generation: u64,
    last_received: u64,
    awaiting_heartbeat: bool,
    heartbeat_num: u64,
}

impl Replica {
    pub fn new(
        publisher: flume::Sender<Message>,
        db: Arc<ChunkDb>,
        epochs: Arc<EpochManager>,
        info: NodeInfo,
        timeouts: ReplicaTimeouts,
    ) -> Self {
        Self {
            publisher,
            db,
            epochs,
            info,
            timeouts,
            state: VNodeState::Initializing,
            master: None,
            subscription: None,
            connection: None,
            generation: 0,
            last_received: 0,
            awaiting_heartbeat: false,
            heartbeat_num: 0,
        }
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn handle(&mut self, msg: Message) {
        match msg {
            Message::System(SystemMessage::BecomePreReplica { master, .. }) => {
                self.state = VNodeState::PreReplica;
                self.subscription = None;
                self.connect(master);
            }
            Message::System(m) => {
                let Some(state) = m.new_state() else {
                    trace!(msg = ?m, "Ignored by replica");
                    return;
                };
                self.state = state;
                if !state.is_replica() {
                    self.disconnect();
                    self.master = None;
                    self.subscription = None;
                }
            }
            Message::Replication(ReplicationMessage::ReconnectToMaster { master, .. }) => {
                self.connect(master);
            }
            Message::Replication(ReplicationMessage::SubscribeToMaster {
                master_id,
                subscription_id,
                ..
            }) => self.subscribe(master_id, subscription_id),
            Message::Replication(ReplicationMessage::AckLogPosition(ack)) => {
                if self.subscription == Some(ack.subscription_id) {
                    self.send(PeerMessage::AckLogPosition(ack));
                }
            }
            Message::Replication(ReplicationMessage::HeartbeatTick { generation }) => {
                self.handle_heartbeat_tick(generation)
            }
            Message::Storage(StorageMessage::CommitAck {
                subscription_id,
                log_position,
            }) => {
                if self.state == VNodeState::Slave && self.subscription == Some(subscription_id) {
                    self.send(PeerMessage::WriteAck(peer::WriteAck {
                        subscription_id,
                        log_position,
                    }));
                }
            }
            Message::Client(ClientMessage::TcpForwardMessage(forward)) => {
                if self.connection.is_some() {
                    self.send(PeerMessage::ForwardWrite(forward));
                } else {
                    debug!(internal_corr_id = %forward.internal_corr_id, "Not connected, forward dropped");
                }
            }
            other => trace!(msg = ?other, "Ignored by replica"),
        }
    }

    fn connect(&mut self, master: MemberInfo) {
        self.disconnect();
        let endpoint = master.internal_tcp;
        self.master = Some(master);
        match MasterConnection::connect(endpoint, self.publisher.clone(), self.timeouts.connect) {
            Ok(connection) => {
                info!(%endpoint, "Connected to master");
                self.connection = Some(connection);
                self.generation += 1;
                self.last_received = 0;
                self.awaiting_heartbeat = false;
                self.publisher
                    .publish(SystemMessage::VNodeConnectionEstablished { endpoint }.into());
                self.schedule_heartbeat_tick(self.timeouts.heartbeat_interval);
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "Connecting to master failed");
                self.publisher
                    .publish(SystemMessage::VNodeConnectionLost { endpoint }.into());
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(endpoint = %connection.endpoint, "Closing connection to master");
        }
    }

    /// Close the connection after a failure and let the controller decide what's next
    fn connection_lost(&mut self) {
        if let Some(connection) = self.connection.take() {
            let endpoint = connection.endpoint;
            drop(connection);
            self.publisher
                .publish(SystemMessage::VNodeConnectionLost { endpoint }.into());
        }
    }

    fn send(&mut self, msg: PeerMessage) {
        let Some(connection) = self.connection.as_mut() else {
            trace!("Not connected to master");
            return;
        };
        if let Err(e) = connection.send(&msg) {
            warn!(endpoint = %connection.endpoint, error = %e, "Sending to master failed");
            self.connection_lost();
        }
    }

    fn subscribe(&mut self, master_id: NodeId, subscription_id: SubscriptionId) {
        let Some(master) = self.master.clone() else {
            debug!(%master_id, "No master to subscribe to");
            return;
        };
        if master.instance_id != master_id {
            debug!(%master_id, current = %master.instance_id, "Subscription to an old master ignored");
            return;
        }
        if self.connection.is_none() {
            self.connect(master);
            if self.connection.is_none() {
                return;
            }
        }

        let log_position = self.db.writer_checkpoint().read_non_flushed();
        let chunk_id = self
            .db
            .get_chunk_for(log_position)
            .map(|chunk| chunk.header().chunk_id)
            .unwrap_or_default();
        let last_epochs = self.epochs.last_epochs(LAST_EPOCHS_SENT);
        info!(
            %master_id,
            %subscription_id,
            log_position,
            epochs = last_epochs.len(),
            "Subscribing to master"
        );
        self.subscription = Some(subscription_id);
        self.send(PeerMessage::SubscribeReplica(SubscribeReplica {
            log_position,
            chunk_id,
            last_epochs,
            replica_id: self.info.instance_id,
            replica_internal: self.info.internal_tcp,
            master_id,
            subscription_id,
        }));
    }

    fn schedule_heartbeat_tick(&self, delay: Duration) {
        self.publisher.publish(Message::schedule(
            delay,
            ReplicationMessage::HeartbeatTick {
                generation: self.generation,
            }
            .into(),
        ));
    }

    fn handle_heartbeat_tick(&mut self, generation: u64) {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Stale heartbeat tick");
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let received = connection.received.load(Ordering::SeqCst);
        if received != self.last_received {
            self.last_received = received;
            self.awaiting_heartbeat = false;
            self.schedule_heartbeat_tick(self.timeouts.heartbeat_interval);
        } else if !self.awaiting_heartbeat {
            self.heartbeat_num += 1;
            self.awaiting_heartbeat = true;
            self.send(PeerMessage::HeartbeatRequest(Heartbeat {
                msg_num: self.heartbeat_num,
            }));
            self.schedule_heartbeat_tick(self.timeouts.heartbeat_timeout);
        } else {
            warn!(endpoint = %connection.endpoint, "Master heartbeat timed out");
            self.connection_lost();
        }
    }
}

pub struct ReplicaService {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl ReplicaService {
    pub fn new(shared: Arc<NodeShared>, rx: flume::Receiver<Message>) -> anyhow::Result<Self> {
        let params = shared.params();
        let mut replica = Replica::new(
            shared.main_queue().clone(),
            shared.db().clone(),
            shared.epochs().clone(),
            shared.info().clone(),
            ReplicaTimeouts {
                connect: params.connect_timeout,
                heartbeat_interval: params.heartbeat_interval,
                heartbeat_timeout: params.heartbeat_timeout,
            },
        );
        Ok(Self {
            join_handle: AutoJoinHandle::spawn("replica", move || {
                let guard = shared.panic_guard("replica");
                run_queue(&rx, shared.is_node_shutting_down_flag(), |msg| {
                    replica.handle(msg);
                    true
                });
                guard.done();
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::str::FromStr;

    use evstored_api::peer::ReplicaSubscribed;
    use evstored_api::CorrelationId;

    use super::*;
    use crate::db::ChunkDbConfig;

    struct Fixture {
        _dir: tempfile::TempDir,
        replica: Replica,
        out: flume::Receiver<Message>,
        listener: TcpListener,
        master: MemberInfo,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            4096,
        )?)?);
        let epochs = Arc::new(EpochManager::init(db.clone(), 10)?);
        let (tx, rx) = flume::unbounded();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = |s: &str| SocketAddr::from_str(s).expect("valid addr");
        let info = NodeInfo {
            instance_id: NodeId::new_random(),
            internal_tcp: addr("127.0.0.1:3111"),
            internal_secure_tcp: None,
            external_tcp: addr("127.0.0.1:3112"),
            external_secure_tcp: None,
            external_http: addr("127.0.0.1:3113"),
            node_priority: 0,
        };
        let master = MemberInfo {
            instance_id: NodeId::new_random(),
            time_stamp: 0,
            state: VNodeState::Master,
            is_alive: true,
            internal_tcp: listener.local_addr()?,
            internal_secure_tcp: None,
            external_tcp: addr("127.0.0.1:4112"),
            external_secure_tcp: None,
            external_http: addr("127.0.0.1:4113"),
            last_commit_position: -1,
            writer_checkpoint: 0,
            chaser_checkpoint: 0,
            epoch_position: -1,
            epoch_number: -1,
            epoch_id: Default::default(),
            node_priority: 0,
        };
        Ok(Fixture {
            _dir: dir,
            replica: Replica::new(
                tx,
                db,
                epochs,
                info,
                ReplicaTimeouts {
                    connect: Duration::from_secs(1),
                    heartbeat_interval: Duration::from_millis(100),
                    heartbeat_timeout: Duration::from_millis(100),
                },
            ),
            out: rx,
            listener,
            master,
        })
    }

    fn become_pre_replica(f: &mut Fixture) -> anyhow::Result<TcpStream> {
        f.replica.handle(
            SystemMessage::BecomePreReplica {
                correlation_id: CorrelationId::new_random(),
                master: f.master.clone(),
            }
            .into(),
        );
        let (stream, _) = f.listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }

    fn wait_for(out: &flume::Receiver<Message>, pred: impl Fn(&Message) -> bool) -> bool {
        while let Ok(msg) = out.recv_timeout(Duration::from_secs(5)) {
            if pred(&msg) {
                return true;
            }
        }
        false
    }

    #[test]
    fn subscribes_and_relays_master_messages() -> anyhow::Result<()> {
        let mut f = fixture()?;
        let mut master_side = become_pre_replica(&mut f)?;
        let subscription_id = SubscriptionId::new_random();
        f.replica.handle(
            ReplicationMessage::SubscribeToMaster {
                state_correlation_id: CorrelationId::new_random(),
                master_id: f.master.instance_id,
                subscription_id,
            }
            .into(),
        );

        let PeerMessage::SubscribeReplica(request) = read_frame(&mut master_side)? else {
            panic!("expected a subscription request");
        };
        assert_eq!(request.subscription_id, subscription_id);
        assert_eq!(request.master_id, f.master.instance_id);
        assert_eq!(request.log_position, 0);

        master_side.write_all(
            &PeerMessage::ReplicaSubscribed(ReplicaSubscribed {
                master_id: f.master.instance_id,
                subscription_id,
                subscription_position: 0,
            })
            .to_frame(),
        )?;
        assert!(wait_for(&f.out, |m| matches!(
            m,
            Message::Replication(ReplicationMessage::ReplicaSubscribed(s))
                if s.subscription_id == subscription_id
        )));

        // master going away is reported
        drop(master_side);
        let endpoint = f.master.internal_tcp;
        assert!(wait_for(&f.out, |m| matches!(
            m,
            Message::System(SystemMessage::VNodeConnectionLost { endpoint: e }) if *e == endpoint
        )));
        Ok(())
    }

    #[test]
    fn write_acks_are_sent_only_as_slave() -> anyhow::Result<()> {
        let mut f = fixture()?;
        let mut master_side = become_pre_replica(&mut f)?;
        let subscription_id = SubscriptionId::new_random();
        f.replica.handle(
            ReplicationMessage::SubscribeToMaster {
                state_correlation_id: CorrelationId::new_random(),
                master_id: f.master.instance_id,
                subscription_id,
            }
            .into(),
        );
        assert!(matches!(
            read_frame(&mut master_side)?,
            PeerMessage::SubscribeReplica(_)
        ));

        let commit_ack = StorageMessage::CommitAck {
            subscription_id,
            log_position: 100,
        };
        f.replica.handle(
            SystemMessage::BecomeCatchingUp {
                correlation_id: CorrelationId::new_random(),
                master: f.master.clone(),
            }
            .into(),
        );
        f.replica.handle(commit_ack.clone().into());
        f.replica.handle(
            ReplicationMessage::AckLogPosition(peer::AckLogPosition {
                subscription_id,
                replication_log_position: 100,
            })
            .into(),
        );
        f.replica.handle(
            SystemMessage::BecomeSlave {
                correlation_id: CorrelationId::new_random(),
                master: f.master.clone(),
            }
            .into(),
        );
        f.replica.handle(commit_ack.into());

        assert!(matches!(
            read_frame(&mut master_side)?,
            PeerMessage::AckLogPosition(a) if a.replication_log_position == 100
        ));
        assert!(matches!(
            read_frame(&mut master_side)?,
            PeerMessage::WriteAck(a) if a.log_position == 100
        ));
        Ok(())
    }

    #[test]
    fn silent_master_is_detected_by_heartbeats() -> anyhow::Result<()> {
        let mut f = fixture()?;
        let mut master_side = become_pre_replica(&mut f)?;
        let generation = f.replica.generation();

        // ticks of an older connection do nothing
        f.replica.handle(
            ReplicationMessage::HeartbeatTick {
                generation: generation - 1,
            }
            .into(),
        );
        assert!(f.replica.is_connected());

        f.replica
            .handle(ReplicationMessage::HeartbeatTick { generation }.into());
        assert!(matches!(
            read_frame(&mut master_side)?,
            PeerMessage::HeartbeatRequest(_)
        ));

        f.replica
            .handle(ReplicationMessage::HeartbeatTick { generation }.into());
        assert!(!f.replica.is_connected());
        let endpoint = f.master.internal_tcp;
        assert!(wait_for(&f.out, |m| matches!(
            m,
            Message::System(SystemMessage::VNodeConnectionLost { endpoint: e }) if *e == endpoint
        )));
        Ok(())
    }
}
