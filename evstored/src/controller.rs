//! The vnode controller
//!
//! Owns the role of the node. Drains the main queue and decides, for
//! every message and the current [`VNodeState`], whether to act on it,
//! forward it to the actors behind the [`OutputBus`](crate::bus::OutputBus)
//! or drop it as stale.
//!
//! Every role transition started by an election gets a fresh state
//! correlation id. Follow-up messages (chaser caught up, reconnects,
//! subscription retries) carry the id they were issued under and are
//! dropped once it no longer matches.
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evstored_api::peer::{EventData, ForwardWrite};
use evstored_api::{CorrelationId, MasterEndpoints, MemberInfo, SubscriptionId, VNodeState};
use tracing::{debug, error, info, trace, warn};

use crate::bus::{Publisher, QUEUE_POLL_INTERVAL};
use crate::cluster::NodeInfo;
use crate::db::ChunkDb;
use crate::forwarding::ForwardingProxy;
use crate::message::{
    ClientMessage, ClientResponse, ElectionMessage, GossipMessage, Message, NotHandledReason,
    ReplicationMessage, SystemMessage,
};
use crate::replication::MASTER_REPLICATION_SERVICE;
use crate::services::{STORAGE_CHASER_SERVICE, STORAGE_WRITER_SERVICE};

/// Services that report `ServiceInitialized` before the node starts
pub const SERVICE_INITS_TO_EXPECT: &[&str] = &[STORAGE_WRITER_SERVICE, STORAGE_CHASER_SERVICE];

/// Services that report `ServiceShutdown` before the database is closed
pub const SERVICE_SHUTDOWNS_TO_EXPECT: &[&str] = &[
    STORAGE_WRITER_SERVICE,
    STORAGE_CHASER_SERVICE,
    MASTER_REPLICATION_SERVICE,
];

#[derive(Copy, Clone, Debug)]
pub struct ControllerTimeouts {
    pub shutdown: Duration,
    pub master_reconnection_delay: Duration,
    pub subscription_retry_delay: Duration,
    pub subscription_timeout: Duration,
    pub forwarding_timeout: Duration,
}

impl Default for ControllerTimeouts {
    fn default() -> Self {
        Self {
            shutdown: Duration::from_secs(5),
            master_reconnection_delay: Duration::from_millis(500),
            subscription_retry_delay: Duration::from_millis(500),
            subscription_timeout: Duration::from_millis(1000),
            forwarding_timeout: Duration::from_millis(2000 + 2000 + 300),
        }
    }
}

/// Role of the node, readable from any thread
#[derive(Debug, Default)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn get(&self) -> VNodeState {
        VNodeState::try_from(self.0.load(Ordering::SeqCst)).unwrap_or_default()
    }

    fn set(&self, state: VNodeState) {
        self.0.store(state.into(), Ordering::SeqCst);
    }
}

pub struct VNodeController<P> {
    publisher: P,
    info: NodeInfo,
    db: Arc<ChunkDb>,
    timeouts: ControllerTimeouts,
    shared_state: Arc<SharedState>,
    is_node_shutting_down: Arc<AtomicBool>,

    state: VNodeState,
    master: Option<MemberInfo>,
    state_correlation_id: CorrelationId,
    subscription_id: SubscriptionId,
    inits_to_expect: Vec<&'static str>,
    shutdowns_to_expect: Vec<&'static str>,
    forwarding: ForwardingProxy,
}

impl<P> VNodeController<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        info: NodeInfo,
        db: Arc<ChunkDb>,
        timeouts: ControllerTimeouts,
        shared_state: Arc<SharedState>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> Self {
        shared_state.set(VNodeState::Initializing);
        Self {
            publisher,
            info,
            db,
            timeouts,
            shared_state,
            is_node_shutting_down,
            state: VNodeState::Initializing,
            master: None,
            state_correlation_id: CorrelationId::nil(),
            subscription_id: SubscriptionId::nil(),
            inits_to_expect: SERVICE_INITS_TO_EXPECT.to_vec(),
            shutdowns_to_expect: SERVICE_SHUTDOWNS_TO_EXPECT.to_vec(),
            forwarding: ForwardingProxy::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> VNodeState {
        self.state
    }

    #[cfg(test)]
    pub fn master(&self) -> Option<&MemberInfo> {
        self.master.as_ref()
    }

    pub fn handle(&mut self, msg: Message) {
        match msg {
            Message::System(m) => self.handle_system(m),
            Message::Election(m) => self.handle_election(m),
            Message::Gossip(m) => self.handle_gossip(m),
            Message::Replication(m) => self.handle_replication(m),
            Message::Client(m) => self.handle_client(m),
            m @ (Message::Storage(_) | Message::Timer(_) | Message::Peer(_)) => {
                if self.state == VNodeState::Shutdown {
                    trace!(msg = ?m, "Dropped after shutdown");
                } else {
                    self.publisher.publish(m);
                }
            }
        }
    }

    fn handle_system(&mut self, m: SystemMessage) {
        use SystemMessage as M;
        use VNodeState as S;

        match (self.state, m) {
            (S::Initializing, m @ M::SystemInit) => {
                info!(
                    id = %self.info.instance_id,
                    internal = %self.info.internal_tcp,
                    "System init"
                );
                self.publisher.publish(m.into());
            }
            (S::Initializing, M::ServiceInitialized { service }) => {
                info!(service, "Service initialized");
                if let Some(i) = self.inits_to_expect.iter().position(|s| *s == service) {
                    self.inits_to_expect.swap_remove(i);
                }
                if self.inits_to_expect.is_empty() {
                    self.handle_system(M::SystemStart);
                }
            }
            (S::Initializing, m @ M::SystemStart) => {
                info!(id = %self.info.instance_id, "System start");
                self.publisher.publish(m.into());
                self.become_unknown();
            }

            (S::ShuttingDown | S::Shutdown, M::RequestShutdown) => {}
            (_, M::RequestShutdown) => self.become_shutting_down(true),
            (S::ShuttingDown, M::ServiceShutdown { service }) => {
                info!(service, "Service shut down");
                if let Some(i) = self.shutdowns_to_expect.iter().position(|s| *s == service) {
                    self.shutdowns_to_expect.swap_remove(i);
                }
                if self.shutdowns_to_expect.is_empty() {
                    info!("All services shut down");
                    self.shutdown();
                }
            }
            (S::ShuttingDown, M::ShutdownTimeout) => {
                warn!(
                    remaining = ?self.shutdowns_to_expect,
                    "Shutdown timed out, closing anyway"
                );
                self.shutdown();
            }

            (
                S::PreMaster | S::PreReplica,
                M::ChaserCaughtUp { correlation_id },
            ) if correlation_id == self.state_correlation_id => {
                if self.state == S::PreMaster {
                    self.become_master();
                } else if let Some(master) = &self.master {
                    let msg = ReplicationMessage::SubscribeToMaster {
                        state_correlation_id: self.state_correlation_id,
                        master_id: master.instance_id,
                        subscription_id: SubscriptionId::new_random(),
                    };
                    self.handle_replication(msg);
                }
            }

            (
                S::PreReplica | S::CatchingUp | S::Clone | S::Slave,
                M::BecomePreReplica {
                    correlation_id,
                    master,
                },
            ) if correlation_id == self.state_correlation_id
                && self.is_current_master(&master) =>
            {
                self.become_pre_replica(master)
            }

            (
                S::PreReplica | S::CatchingUp | S::Clone | S::Slave,
                M::VNodeConnectionLost { endpoint },
            ) => {
                let Some(master) = self.master.clone() else {
                    return;
                };
                if master.internal_tcp != endpoint {
                    return;
                }
                warn!(%endpoint, state = ?self.state, "Connection to master lost");
                let msg: Message = if self.state == S::PreReplica {
                    ReplicationMessage::ReconnectToMaster {
                        state_correlation_id: self.state_correlation_id,
                        master,
                    }
                    .into()
                } else {
                    M::BecomePreReplica {
                        correlation_id: self.state_correlation_id,
                        master,
                    }
                    .into()
                };
                self.publisher.publish(Message::schedule(
                    self.timeouts.master_reconnection_delay,
                    msg,
                ));
            }

            (S::Master, M::NoQuorum) => {
                warn!("No quorum emerged within timeout, retiring");
                self.become_unknown();
            }

            (_, m @ M::VNodeConnectionEstablished { .. }) => {
                debug!(msg = ?m, "Connection established");
            }
            (state, m) => {
                debug!(?state, msg = ?m, "Ignored system message");
            }
        }
    }

    fn handle_election(&mut self, m: ElectionMessage) {
        use VNodeState as S;

        match (self.state, m) {
            (S::Initializing | S::ShuttingDown | S::Shutdown, m) => {
                trace!(state = ?self.state, msg = ?m, "Election message dropped");
            }
            (_, ElectionMessage::ElectionsDone { view, master }) => {
                self.handle_elections_done(view, master)
            }
            (_, m) => self.publisher.publish(m.into()),
        }
    }

    fn handle_elections_done(&mut self, view: i32, master: MemberInfo) {
        if self.is_current_master(&master) {
            if master.instance_id == self.info.instance_id && self.state == VNodeState::Master {
                info!(view, "Elected again, writing new epoch");
                self.publisher.publish(SystemMessage::WriteEpoch.into());
            }
            return;
        }

        info!(view, master = %master.instance_id, endpoint = %master.internal_tcp, "Elections done");
        self.subscription_id = SubscriptionId::new_random();
        self.state_correlation_id = CorrelationId::new_random();
        self.publisher.publish(
            ElectionMessage::ElectionsDone {
                view,
                master: master.clone(),
            }
            .into(),
        );
        if master.instance_id == self.info.instance_id {
            self.master = Some(master);
            self.become_pre_master();
        } else {
            self.become_pre_replica(master);
        }
    }

    fn handle_gossip(&mut self, m: GossipMessage) {
        use VNodeState as S;

        if let GossipMessage::GossipUpdated(members) = &m {
            match self.state {
                S::PreReplica | S::CatchingUp | S::Clone | S::Slave => {
                    let master_alive = self.master.as_ref().map_or(false, |master| {
                        members
                            .iter()
                            .any(|m| m.instance_id == master.instance_id && m.is_alive)
                    });
                    if !master_alive {
                        debug!("No master or master is dead according to gossip, starting elections");
                        self.publisher.publish(ElectionMessage::StartElections.into());
                    }
                }
                S::PreMaster | S::Master => {
                    let masters = members
                        .iter()
                        .filter(|m| m.is_alive && m.state == S::Master)
                        .count();
                    if 1 < masters {
                        debug!(masters, "More than one master according to gossip, starting elections");
                        self.publisher.publish(ElectionMessage::StartElections.into());
                    }
                }
                _ => {}
            }
        }

        match self.state {
            S::Shutdown => trace!(msg = ?m, "Gossip dropped after shutdown"),
            _ => self.publisher.publish(m.into()),
        }
    }

    fn handle_replication(&mut self, m: ReplicationMessage) {
        use ReplicationMessage as R;
        use VNodeState as S;

        match (self.state, m) {
            (
                S::PreReplica,
                R::ReconnectToMaster {
                    state_correlation_id,
                    master,
                },
            ) if state_correlation_id == self.state_correlation_id
                && self.is_current_master(&master) =>
            {
                self.publisher.publish(
                    R::ReconnectToMaster {
                        state_correlation_id,
                        master,
                    }
                    .into(),
                )
            }
            (
                S::PreReplica,
                R::SubscribeToMaster {
                    state_correlation_id,
                    master_id,
                    subscription_id,
                },
            ) if state_correlation_id == self.state_correlation_id
                && self.master.as_ref().map(|m| m.instance_id) == Some(master_id) =>
            {
                debug!(%subscription_id, %master_id, "Subscribing to master");
                self.subscription_id = subscription_id;
                self.publisher.publish(
                    R::SubscribeToMaster {
                        state_correlation_id,
                        master_id,
                        subscription_id,
                    }
                    .into(),
                );
                // keeps resubscribing until one gets accepted
                self.publisher.publish(Message::schedule(
                    self.timeouts.subscription_timeout,
                    R::SubscribeToMaster {
                        state_correlation_id,
                        master_id,
                        subscription_id: SubscriptionId::new_random(),
                    }
                    .into(),
                ));
            }
            (S::PreReplica, m @ R::ReplicaSubscriptionRetry(_)) if self.is_legitimate(&m) => {
                if let Some(master) = &self.master {
                    debug!(master = %master.instance_id, "Subscription retry requested");
                    self.publisher.publish(Message::schedule(
                        self.timeouts.subscription_retry_delay,
                        R::SubscribeToMaster {
                            state_correlation_id: self.state_correlation_id,
                            master_id: master.instance_id,
                            subscription_id: SubscriptionId::new_random(),
                        }
                        .into(),
                    ));
                }
            }
            (S::PreReplica, m @ R::ReplicaSubscribed(_)) if self.is_legitimate(&m) => {
                self.publisher.publish(m.into());
                self.become_replica_role(S::CatchingUp);
            }

            (
                S::CatchingUp | S::Clone | S::Slave,
                m @ (R::CreateChunk(_) | R::RawChunkBulk(_) | R::DataChunkBulk(_)),
            ) if self.is_legitimate(&m) => self.publisher.publish(m.into()),
            (S::CatchingUp | S::Clone | S::Slave, m @ R::AckLogPosition(_)) => {
                self.publisher.publish(m.into())
            }
            (S::CatchingUp | S::Clone, m @ R::SlaveAssignment(_)) if self.is_legitimate(&m) => {
                self.become_replica_role(S::Slave)
            }
            (S::CatchingUp | S::Slave, m @ R::CloneAssignment(_)) if self.is_legitimate(&m) => {
                self.become_replica_role(S::Clone)
            }

            (S::PreMaster | S::Master, m @ R::ReplicaSubscriptionRequest { .. }) => {
                self.publisher.publish(m.into())
            }
            (
                state,
                m @ (R::ReplicaLogPositionAck { .. }
                | R::ReplicaWriteAck { .. }
                | R::ReplicaConnectionClosed { .. }
                | R::HeartbeatTick { .. }),
            ) if state != S::Shutdown => self.publisher.publish(m.into()),

            (state, m) => debug!(?state, msg = ?m, "Ignored replication message"),
        }
    }

    fn handle_client(&mut self, m: ClientMessage) {
        use VNodeState as S;

        match (self.state, m) {
            (S::PreMaster | S::Master, m @ ClientMessage::WriteEvents { .. }) => {
                self.publisher.publish(m.into())
            }
            (
                S::PreReplica | S::CatchingUp | S::Clone | S::Slave,
                ClientMessage::WriteEvents {
                    correlation_id,
                    require_master,
                    events,
                    envelope,
                },
            ) => {
                if require_master {
                    trace!(%correlation_id, "Write requires master, redirecting");
                    envelope.reply(ClientResponse::NotHandled(NotHandledReason::NotMaster(
                        self.master_endpoints(),
                    )));
                    return;
                }
                let internal_corr_id = self.forwarding.register(envelope);
                trace!(%correlation_id, %internal_corr_id, "Forwarding write to master");
                self.publisher.publish(Message::schedule(
                    self.timeouts.forwarding_timeout,
                    ClientMessage::ForwardingTimeout { internal_corr_id }.into(),
                ));
                self.publisher.publish(
                    ClientMessage::TcpForwardMessage(ForwardWrite {
                        internal_corr_id,
                        events: events.into_iter().map(|data| EventData { data }).collect(),
                    })
                    .into(),
                );
            }
            (_, ClientMessage::WriteEvents { envelope, .. }) => {
                envelope.reply(ClientResponse::NotHandled(NotHandledReason::NotReady))
            }
            (_, ClientMessage::ForwardedWriteCompleted(completed)) => {
                self.forwarding.complete(completed);
            }
            (_, ClientMessage::ForwardingTimeout { internal_corr_id }) => {
                self.forwarding.timeout(internal_corr_id);
            }
            (_, m @ ClientMessage::TcpForwardMessage(_)) => self.publisher.publish(m.into()),
        }
    }

    fn is_current_master(&self, master: &MemberInfo) -> bool {
        self.master
            .as_ref()
            .map_or(false, |m| m.instance_id == master.instance_id)
    }

    /// Message comes from the current master, over the current subscription
    fn is_legitimate(&self, msg: &ReplicationMessage) -> bool {
        let Some((master_id, subscription_id)) = msg.subscription() else {
            return false;
        };
        if subscription_id != self.subscription_id {
            debug!(
                %subscription_id,
                current = %self.subscription_id,
                "Wrong subscription, message ignored"
            );
            return false;
        }
        if self.master.as_ref().map(|m| m.instance_id) != Some(master_id) {
            debug!(%master_id, "Message from a node that is not the master, ignored");
            return false;
        }
        true
    }

    fn master_endpoints(&self) -> MasterEndpoints {
        match &self.master {
            Some(master) => master.master_endpoints(),
            None => MasterEndpoints {
                external_tcp: self.info.external_tcp,
                external_secure_tcp: self.info.external_secure_tcp,
                external_http: self.info.external_http,
            },
        }
    }

    fn set_state(&mut self, state: VNodeState) {
        self.state = state;
        self.shared_state.set(state);
    }

    fn become_unknown(&mut self) {
        info!("VNode is Unknown, starting elections");
        self.master = None;
        self.state_correlation_id = CorrelationId::new_random();
        self.set_state(VNodeState::Unknown);
        self.publisher.publish(
            SystemMessage::BecomeUnknown {
                correlation_id: self.state_correlation_id,
            }
            .into(),
        );
        self.publisher
            .publish(ElectionMessage::StartElections.into());
    }

    fn become_pre_master(&mut self) {
        info!("VNode is PreMaster, waiting for chaser to catch up");
        self.set_state(VNodeState::PreMaster);
        self.publisher.publish(
            SystemMessage::BecomePreMaster {
                correlation_id: self.state_correlation_id,
            }
            .into(),
        );
        self.wait_for_chaser();
    }

    fn become_master(&mut self) {
        info!(id = %self.info.instance_id, "VNode is Master");
        self.set_state(VNodeState::Master);
        self.publisher.publish(
            SystemMessage::BecomeMaster {
                correlation_id: self.state_correlation_id,
            }
            .into(),
        );
    }

    fn become_pre_replica(&mut self, master: MemberInfo) {
        info!(
            master = %master.instance_id,
            endpoint = %master.internal_tcp,
            "VNode is PreReplica, waiting for chaser to catch up"
        );
        self.master = Some(master.clone());
        self.set_state(VNodeState::PreReplica);
        self.publisher.publish(
            SystemMessage::BecomePreReplica {
                correlation_id: self.state_correlation_id,
                master,
            }
            .into(),
        );
        self.wait_for_chaser();
    }

    fn wait_for_chaser(&mut self) {
        self.publisher.publish(
            SystemMessage::WaitForChaserToCatchUp {
                correlation_id: self.state_correlation_id,
                total_time: Duration::ZERO,
            }
            .into(),
        );
    }

    fn become_replica_role(&mut self, state: VNodeState) {
        let Some(master) = self.master.clone() else {
            return;
        };
        info!(?state, master = %master.instance_id, "Replica role changed");
        let correlation_id = self.state_correlation_id;
        let msg = match state {
            VNodeState::CatchingUp => SystemMessage::BecomeCatchingUp {
                correlation_id,
                master,
            },
            VNodeState::Clone => SystemMessage::BecomeClone {
                correlation_id,
                master,
            },
            VNodeState::Slave => SystemMessage::BecomeSlave {
                correlation_id,
                master,
            },
            other => {
                error!(state = ?other, "Not a replica role");
                return;
            }
        };
        self.set_state(state);
        self.publisher.publish(msg.into());
    }

    fn become_shutting_down(&mut self, exit_process: bool) {
        info!(exit_process, "VNode is shutting down");
        self.master = None;
        self.state_correlation_id = CorrelationId::new_random();
        self.set_state(VNodeState::ShuttingDown);
        self.publisher.publish(Message::schedule(
            self.timeouts.shutdown,
            SystemMessage::ShutdownTimeout.into(),
        ));
        self.publisher.publish(
            SystemMessage::BecomeShuttingDown {
                correlation_id: self.state_correlation_id,
                exit_process,
            }
            .into(),
        );
    }

    fn shutdown(&mut self) {
        if !self.forwarding.is_empty() {
            warn!(
                pending = self.forwarding.len(),
                "Forwarded writes left unanswered"
            );
        }
        if let Err(e) = self.db.close() {
            error!(error = %e, "Closing database failed");
        }
        info!("VNode is shut down");
        self.set_state(VNodeState::Shutdown);
        self.publisher.publish(
            SystemMessage::BecomeShutdown {
                correlation_id: self.state_correlation_id,
            }
            .into(),
        );
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    /// Drain the main queue until the node is shut down
    ///
    /// `shutdown_requested` is polled, so it can be flipped from a
    /// signal handler.
    pub fn run(&mut self, rx: &flume::Receiver<Message>, shutdown_requested: &AtomicBool) {
        let mut shutdown_seen = false;
        while !self.is_node_shutting_down.load(Ordering::SeqCst) {
            if !shutdown_seen && shutdown_requested.load(Ordering::SeqCst) {
                shutdown_seen = true;
                self.handle(SystemMessage::RequestShutdown.into());
            }
            match rx.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(msg) => self.handle(msg),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
