//! Master elections
//!
//! Paxos-like: nodes agree on a view number through `ViewChange`
//! messages, the leader of the view (a node picked round robin from the
//! known alive members) collects `PrepareOk`s carrying every node's
//! replication progress, proposes the best master candidate and the
//! master is elected once a majority accepts it.
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use convi::ExpectFrom;
use evstored_api::peer::{self, PeerMessage};
use evstored_api::{EpochId, MemberInfo, NodeId, VNodeState};
use tracing::{debug, info, trace};

use crate::bus::{run_queue, Publisher};
use crate::cluster::{NodeInfo, ReplicationProgress};
use crate::message::{ElectionMessage, GossipMessage, Message, SystemMessage};
use crate::task::{AutoJoinHandle, PanicGuard};

#[derive(Copy, Clone, Debug)]
pub struct ElectionsTimeouts {
    pub leader_election_progress: Duration,
    pub send_view_change_proof_interval: Duration,
}

impl Default for ElectionsTimeouts {
    fn default() -> Self {
        Self {
            leader_election_progress: Duration::from_millis(1000),
            send_view_change_proof_interval: Duration::from_millis(5000),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElectionsState {
    Idle,
    ElectingLeader,
    Leader,
    NonLeader,
    Shutdown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MasterCandidate {
    pub instance_id: NodeId,
    pub internal_tcp: SocketAddr,
    pub epoch_number: i32,
    pub epoch_position: i64,
    pub epoch_id: EpochId,
    pub last_commit_position: i64,
    pub writer_checkpoint: i64,
    pub chaser_checkpoint: i64,
    pub node_priority: i32,
}

impl MasterCandidate {
    fn from_prepare_ok(m: &peer::PrepareOk) -> Self {
        Self {
            instance_id: m.server_id,
            internal_tcp: m.server_internal,
            epoch_number: m.epoch_number,
            epoch_position: m.epoch_position,
            epoch_id: m.epoch_id,
            last_commit_position: m.last_commit_position,
            writer_checkpoint: m.writer_checkpoint,
            chaser_checkpoint: m.chaser_checkpoint,
            node_priority: m.node_priority,
        }
    }

    fn from_member(m: &MemberInfo) -> Self {
        Self {
            instance_id: m.instance_id,
            internal_tcp: m.internal_tcp,
            epoch_number: m.epoch_number,
            epoch_position: m.epoch_position,
            epoch_id: m.epoch_id,
            last_commit_position: m.last_commit_position,
            writer_checkpoint: m.writer_checkpoint,
            chaser_checkpoint: m.chaser_checkpoint,
            node_priority: m.node_priority,
        }
    }

    /// Ranking of candidates, higher is better
    fn rank(&self) -> (i32, i64, i64, i32, i64, NodeId) {
        (
            self.epoch_number,
            self.last_commit_position,
            self.writer_checkpoint,
            self.node_priority,
            self.chaser_checkpoint,
            self.instance_id,
        )
    }
}

/// Is `candidate` at least as far as `own`
///
/// Priority is not considered here: a proposal only has to be no worse
/// than what this node has.
pub fn is_candidate_good_enough(candidate: &MasterCandidate, own: &MasterCandidate) -> bool {
    if candidate.epoch_number != own.epoch_number {
        return own.epoch_number < candidate.epoch_number;
    }
    if candidate.last_commit_position != own.last_commit_position {
        return own.last_commit_position < candidate.last_commit_position;
    }
    if candidate.writer_checkpoint != own.writer_checkpoint {
        return own.writer_checkpoint < candidate.writer_checkpoint;
    }
    if candidate.chaser_checkpoint != own.chaser_checkpoint {
        return own.chaser_checkpoint < candidate.chaser_checkpoint;
    }
    true
}

pub struct ElectionsService<P> {
    publisher: P,
    node: NodeInfo,
    progress: Arc<dyn ReplicationProgress>,
    cluster_size: usize,
    timeouts: ElectionsTimeouts,

    state: ElectionsState,
    last_attempted_view: i32,
    last_installed_view: i32,

    vc_received: HashSet<NodeId>,
    prepare_ok_received: HashMap<NodeId, MasterCandidate>,
    accepts_received: HashSet<NodeId>,

    master_proposal: Option<MasterCandidate>,
    master: Option<NodeId>,
    last_elected_master: Option<NodeId>,

    /// Alive members, sorted by internal endpoint, descending
    servers: Vec<MemberInfo>,
}

impl<P> ElectionsService<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        node: NodeInfo,
        progress: Arc<dyn ReplicationProgress>,
        cluster_size: usize,
        timeouts: ElectionsTimeouts,
    ) -> Self {
        let own = node.member_info(VNodeState::Initializing, true, progress.as_ref());
        Self {
            publisher,
            node,
            progress,
            cluster_size,
            timeouts,
            state: ElectionsState::Idle,
            last_attempted_view: -1,
            last_installed_view: -1,
            vc_received: HashSet::new(),
            prepare_ok_received: HashMap::new(),
            accepts_received: HashSet::new(),
            master_proposal: None,
            master: None,
            last_elected_master: None,
            servers: vec![own],
        }
    }

    #[cfg(test)]
    pub fn last_installed_view(&self) -> i32 {
        self.last_installed_view
    }

    #[cfg(test)]
    pub fn state(&self) -> ElectionsState {
        self.state
    }

    #[cfg(test)]
    pub fn master(&self) -> Option<NodeId> {
        self.master
    }

    fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    pub fn handle(&mut self, msg: Message) {
        match msg {
            Message::System(SystemMessage::SystemInit) => self.handle_system_init(),
            Message::System(SystemMessage::BecomeShuttingDown { .. }) => {
                self.state = ElectionsState::Shutdown;
            }
            Message::Gossip(GossipMessage::GossipUpdated(members)) => {
                self.handle_gossip_updated(members)
            }
            Message::Election(m) => self.handle_election(m),
            other => trace!(msg = ?other, "Ignored by elections"),
        }
    }

    fn handle_election(&mut self, msg: ElectionMessage) {
        match msg {
            ElectionMessage::StartElections => self.handle_start_elections(),
            ElectionMessage::ElectionsTimedOut { view } => self.handle_elections_timed_out(view),
            ElectionMessage::SendViewChangeProof => self.handle_send_view_change_proof(),
            ElectionMessage::ViewChange(m) => self.handle_view_change(m),
            ElectionMessage::ViewChangeProof(m) => self.handle_view_change_proof(m),
            ElectionMessage::Prepare(m) => self.handle_prepare(m),
            ElectionMessage::PrepareOk(m) => self.handle_prepare_ok(m),
            ElectionMessage::Proposal(m) => self.handle_proposal(m),
            ElectionMessage::Accept(m) => self.handle_accept(m),
            ElectionMessage::ElectionsDone { .. } => {}
        }
    }

    fn handle_system_init(&mut self) {
        self.publisher.publish(Message::schedule(
            self.timeouts.send_view_change_proof_interval,
            ElectionMessage::SendViewChangeProof.into(),
        ));
    }

    fn handle_gossip_updated(&mut self, members: Vec<MemberInfo>) {
        let mut servers: Vec<_> = members
            .into_iter()
            .filter(|m| m.state != VNodeState::Manager && m.is_alive)
            .collect();
        servers.sort_by(|a, b| b.internal_tcp.cmp(&a.internal_tcp));
        self.servers = servers;
    }

    fn handle_start_elections(&mut self) {
        match self.state {
            ElectionsState::Shutdown | ElectionsState::ElectingLeader => return,
            ElectionsState::Idle | ElectionsState::Leader | ElectionsState::NonLeader => {}
        }
        debug!("Starting elections");
        self.shift_to_leader_election(self.last_attempted_view + 1);
    }

    fn handle_elections_timed_out(&mut self, view: i32) {
        if self.state == ElectionsState::Shutdown {
            return;
        }
        if view != self.last_attempted_view {
            return;
        }
        // still on the same view, but a master was already elected
        if self.state != ElectionsState::ElectingLeader && self.master.is_some() {
            return;
        }
        debug!(view, state = ?self.state, "Elections timed out");
        self.shift_to_leader_election(self.last_attempted_view + 1);
    }

    fn shift_to_leader_election(&mut self, view: i32) {
        debug!(view, "Shifting to leader election");
        self.state = ElectionsState::ElectingLeader;
        self.vc_received.clear();
        self.prepare_ok_received.clear();
        self.last_attempted_view = view;
        self.master_proposal = None;
        self.master = None;
        self.accepts_received.clear();

        let view_change = peer::ViewChange {
            server_id: self.node.instance_id,
            server_internal: self.node.internal_tcp,
            attempted_view: view,
        };
        self.handle_view_change(view_change.clone());
        self.send_to_all_except_me(&PeerMessage::ViewChange(view_change));
        self.publisher.publish(Message::schedule(
            self.timeouts.leader_election_progress,
            ElectionMessage::ElectionsTimedOut { view }.into(),
        ));
    }

    fn send_to_all_except_me(&self, msg: &PeerMessage) {
        for server in self
            .servers
            .iter()
            .filter(|s| s.instance_id != self.node.instance_id)
        {
            self.publisher
                .publish(Message::peer_send(server.internal_tcp, msg.clone()));
        }
    }

    fn handle_view_change(&mut self, msg: peer::ViewChange) {
        match self.state {
            ElectionsState::Shutdown | ElectionsState::Idle => return,
            ElectionsState::ElectingLeader | ElectionsState::Leader | ElectionsState::NonLeader => {}
        }
        if msg.attempted_view <= self.last_installed_view {
            return;
        }
        trace!(from = %msg.server_id, view = msg.attempted_view, "ViewChange");

        if self.last_attempted_view < msg.attempted_view {
            self.shift_to_leader_election(msg.attempted_view);
        }

        if self.vc_received.insert(msg.server_id) && self.vc_received.len() == self.majority() {
            debug!(view = msg.attempted_view, "Majority of ViewChange");
            if self.am_i_leader_of(self.last_attempted_view) {
                self.shift_to_prepare_phase();
            }
        }
    }

    fn handle_send_view_change_proof(&mut self) {
        if self.state == ElectionsState::Shutdown {
            return;
        }
        if 0 <= self.last_installed_view {
            self.send_to_all_except_me(&PeerMessage::ViewChangeProof(peer::ViewChangeProof {
                server_id: self.node.instance_id,
                server_internal: self.node.internal_tcp,
                installed_view: self.last_installed_view,
            }));
        }
        self.publisher.publish(Message::schedule(
            self.timeouts.send_view_change_proof_interval,
            ElectionMessage::SendViewChangeProof.into(),
        ));
    }

    fn handle_view_change_proof(&mut self, msg: peer::ViewChangeProof) {
        match self.state {
            ElectionsState::Shutdown | ElectionsState::Idle => return,
            ElectionsState::ElectingLeader | ElectionsState::Leader | ElectionsState::NonLeader => {}
        }
        if msg.installed_view <= self.last_installed_view {
            return;
        }

        self.last_attempted_view = msg.installed_view;
        self.publisher.publish(Message::schedule(
            self.timeouts.leader_election_progress,
            ElectionMessage::ElectionsTimedOut {
                view: self.last_attempted_view,
            }
            .into(),
        ));

        if self.am_i_leader_of(self.last_attempted_view) {
            debug!(from = %msg.server_id, view = msg.installed_view, "ViewChangeProof, jumping to leader state");
            self.shift_to_prepare_phase();
        } else {
            debug!(from = %msg.server_id, view = msg.installed_view, "ViewChangeProof, jumping to non-leader state");
            self.shift_to_reg_non_leader();
        }
    }

    fn am_i_leader_of(&self, view: i32) -> bool {
        if self.servers.is_empty() || view < 0 {
            return false;
        }
        let leader = &self.servers[usize::expect_from(view) % self.servers.len()];
        leader.instance_id == self.node.instance_id
    }

    fn shift_to_prepare_phase(&mut self) {
        debug!(view = self.last_attempted_view, "Shifting to prepare phase");
        self.last_installed_view = self.last_attempted_view;
        self.prepare_ok_received.clear();
        let prepare_ok = self.create_prepare_ok(self.last_installed_view);
        self.handle_prepare_ok(prepare_ok);
        self.send_to_all_except_me(&PeerMessage::Prepare(peer::Prepare {
            server_id: self.node.instance_id,
            server_internal: self.node.internal_tcp,
            view: self.last_installed_view,
        }));
    }

    fn handle_prepare(&mut self, msg: peer::Prepare) {
        if self.state == ElectionsState::Shutdown {
            return;
        }
        if msg.server_id == self.node.instance_id {
            return;
        }
        if msg.view != self.last_attempted_view {
            return;
        }
        if !self.is_known_server(msg.server_id) {
            return;
        }
        trace!(from = %msg.server_id, view = msg.view, "Prepare");

        // install the view
        if self.state == ElectionsState::ElectingLeader {
            self.shift_to_reg_non_leader();
        }

        let prepare_ok = self.create_prepare_ok(msg.view);
        self.publisher.publish(Message::peer_send(
            msg.server_internal,
            PeerMessage::PrepareOk(prepare_ok),
        ));
    }

    fn is_known_server(&self, id: NodeId) -> bool {
        self.servers.iter().any(|s| s.instance_id == id)
    }

    fn own_candidate(&self) -> MasterCandidate {
        let epoch = self.progress.last_epoch();
        MasterCandidate {
            instance_id: self.node.instance_id,
            internal_tcp: self.node.internal_tcp,
            epoch_number: epoch.map_or(-1, |e| e.epoch_number),
            epoch_position: epoch.map_or(-1, |e| e.epoch_position),
            epoch_id: epoch.map_or(EpochId::nil(), |e| e.epoch_id),
            last_commit_position: self.progress.last_commit_position(),
            writer_checkpoint: self.progress.writer_checkpoint(),
            chaser_checkpoint: self.progress.chaser_checkpoint(),
            node_priority: self.node.node_priority,
        }
    }

    fn create_prepare_ok(&self, view: i32) -> peer::PrepareOk {
        let own = self.own_candidate();
        peer::PrepareOk {
            view,
            server_id: own.instance_id,
            server_internal: own.internal_tcp,
            epoch_number: own.epoch_number,
            epoch_position: own.epoch_position,
            epoch_id: own.epoch_id,
            last_commit_position: own.last_commit_position,
            writer_checkpoint: own.writer_checkpoint,
            chaser_checkpoint: own.chaser_checkpoint,
            node_priority: own.node_priority,
        }
    }

    fn shift_to_reg_non_leader(&mut self) {
        debug!(view = self.last_attempted_view, "Shifting to non-leader");
        self.state = ElectionsState::NonLeader;
        self.last_installed_view = self.last_attempted_view;
    }

    fn handle_prepare_ok(&mut self, msg: peer::PrepareOk) {
        if self.state != ElectionsState::ElectingLeader {
            return;
        }
        if msg.view != self.last_attempted_view {
            return;
        }
        trace!(from = %msg.server_id, view = msg.view, "PrepareOk");

        if self.prepare_ok_received.contains_key(&msg.server_id) {
            return;
        }
        self.prepare_ok_received
            .insert(msg.server_id, MasterCandidate::from_prepare_ok(&msg));
        if self.prepare_ok_received.len() == self.majority() {
            self.shift_to_reg_leader();
        }
    }

    fn shift_to_reg_leader(&mut self) {
        debug!(view = self.last_attempted_view, "Shifting to leader");
        self.state = ElectionsState::Leader;
        self.send_proposal();
    }

    fn send_proposal(&mut self) {
        self.accepts_received.clear();
        self.master_proposal = None;

        let Some(master) = self.best_master_candidate() else {
            trace!(view = self.last_attempted_view, "No master candidate for a proposal");
            return;
        };
        self.master_proposal = Some(master);
        debug!(
            view = self.last_installed_view,
            candidate = %master.instance_id,
            "Sending proposal"
        );

        let proposal = peer::Proposal {
            server_id: self.node.instance_id,
            server_internal: self.node.internal_tcp,
            master_id: master.instance_id,
            master_internal: master.internal_tcp,
            view: self.last_installed_view,
            epoch_number: master.epoch_number,
            epoch_position: master.epoch_position,
            epoch_id: master.epoch_id,
            last_commit_position: master.last_commit_position,
            writer_checkpoint: master.writer_checkpoint,
            chaser_checkpoint: master.chaser_checkpoint,
            node_priority: master.node_priority,
        };
        self.handle_accept(peer::Accept {
            server_id: self.node.instance_id,
            server_internal: self.node.internal_tcp,
            master_id: master.instance_id,
            master_internal: master.internal_tcp,
            view: self.last_installed_view,
        });
        self.send_to_all_except_me(&PeerMessage::Proposal(proposal));
    }

    fn best_master_candidate(&self) -> Option<MasterCandidate> {
        if let Some(last_elected) = self.last_elected_master {
            if let Some(candidate) = self.prepare_ok_received.get(&last_elected) {
                return Some(*candidate);
            }
            if let Some(master) = self.servers.iter().find(|s| {
                s.is_alive && s.instance_id == last_elected && s.state == VNodeState::Master
            }) {
                return Some(MasterCandidate::from_member(master));
            }
        }
        self.prepare_ok_received
            .values()
            .max_by(|a, b| a.rank().cmp(&b.rank()))
            .copied()
    }

    fn is_legitimate_master(&self, proposing_server: NodeId, candidate: &MasterCandidate) -> bool {
        let current_master = self.servers.iter().find(|s| {
            s.is_alive
                && Some(s.instance_id) == self.last_elected_master
                && s.state == VNodeState::Master
        });
        if let Some(master) = current_master {
            if candidate.instance_id == master.instance_id
                || master.epoch_number < candidate.epoch_number
                || (candidate.epoch_number == master.epoch_number
                    && candidate.epoch_id != master.epoch_id)
            {
                return true;
            }
            debug!(
                from = %proposing_server,
                candidate = %candidate.instance_id,
                master = %master.instance_id,
                "Proposal of a master that is not legitimate, a live master exists"
            );
            return false;
        }

        if candidate.instance_id == self.node.instance_id {
            return true;
        }

        let own = self.own_candidate();
        if !is_candidate_good_enough(candidate, &own) {
            debug!(
                from = %proposing_server,
                candidate = %candidate.instance_id,
                "Proposal of a master that is behind this node"
            );
            return false;
        }
        true
    }

    fn handle_proposal(&mut self, msg: peer::Proposal) {
        if self.state == ElectionsState::Shutdown {
            return;
        }
        if msg.server_id == self.node.instance_id {
            return;
        }
        if self.state != ElectionsState::NonLeader {
            return;
        }
        if msg.view != self.last_installed_view {
            return;
        }
        if !self.is_known_server(msg.server_id) || !self.is_known_server(msg.master_id) {
            return;
        }

        let candidate = MasterCandidate {
            instance_id: msg.master_id,
            internal_tcp: msg.master_internal,
            epoch_number: msg.epoch_number,
            epoch_position: msg.epoch_position,
            epoch_id: msg.epoch_id,
            last_commit_position: msg.last_commit_position,
            writer_checkpoint: msg.writer_checkpoint,
            chaser_checkpoint: msg.chaser_checkpoint,
            node_priority: 0,
        };
        if !self.is_legitimate_master(msg.server_id, &candidate) {
            return;
        }
        trace!(from = %msg.server_id, master = %msg.master_id, view = msg.view, "Proposal");

        if self.master_proposal.is_none() {
            self.master_proposal = Some(candidate);
            self.accepts_received.clear();
        }

        if self.master_proposal.map(|p| p.instance_id) == Some(msg.master_id) {
            // a proposal is also an implicit accept from the proposing server
            self.handle_accept(peer::Accept {
                server_id: msg.server_id,
                server_internal: msg.server_internal,
                master_id: msg.master_id,
                master_internal: msg.master_internal,
                view: msg.view,
            });
            let accept = peer::Accept {
                server_id: self.node.instance_id,
                server_internal: self.node.internal_tcp,
                master_id: msg.master_id,
                master_internal: msg.master_internal,
                view: msg.view,
            };
            self.handle_accept(accept.clone());
            self.send_to_all_except_me(&PeerMessage::Accept(accept));
        }
    }

    fn handle_accept(&mut self, msg: peer::Accept) {
        if self.state == ElectionsState::Shutdown {
            return;
        }
        if msg.view != self.last_installed_view {
            return;
        }
        let Some(proposal) = self.master_proposal else {
            return;
        };
        if proposal.instance_id != msg.master_id {
            return;
        }
        trace!(from = %msg.server_id, master = %msg.master_id, view = msg.view, "Accept");

        if self.accepts_received.insert(msg.server_id)
            && self.accepts_received.len() == self.majority()
        {
            let Some(master) = self
                .servers
                .iter()
                .find(|s| s.instance_id == proposal.instance_id)
                .cloned()
            else {
                return;
            };
            self.master = Some(proposal.instance_id);
            self.last_elected_master = Some(proposal.instance_id);
            info!(
                view = msg.view,
                master = %proposal.instance_id,
                master_internal = %proposal.internal_tcp,
                epoch = proposal.epoch_number,
                writer = proposal.writer_checkpoint,
                "Elections done"
            );
            self.publisher.publish(
                ElectionMessage::ElectionsDone {
                    view: msg.view,
                    master,
                }
                .into(),
            );
        }
    }
}

impl ElectionsService<flume::Sender<Message>> {
    /// Run the service on its own thread, draining `rx`
    pub fn start(
        mut self,
        rx: flume::Receiver<Message>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> io::Result<AutoJoinHandle> {
        AutoJoinHandle::spawn("elections", move || {
            let guard = PanicGuard::new("elections", is_node_shutting_down.clone());
            run_queue(&rx, &is_node_shutting_down, |msg| {
                self.handle(msg);
                true
            });
            guard.done();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use evstored_api::EpochRecord;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use uuid::Uuid;

    use super::*;
    use crate::message::TimerMessage;

    #[derive(Clone, Copy, Default)]
    struct FixedProgress {
        epoch: Option<EpochRecord>,
        writer: i64,
        chaser: i64,
        commit: i64,
    }

    impl ReplicationProgress for FixedProgress {
        fn last_epoch(&self) -> Option<EpochRecord> {
            self.epoch
        }

        fn writer_checkpoint(&self) -> i64 {
            self.writer
        }

        fn chaser_checkpoint(&self) -> i64 {
            self.chaser
        }

        fn last_commit_position(&self) -> i64 {
            self.commit
        }
    }

    fn node_info(port: u16, id: u128) -> NodeInfo {
        let addr = |port| SocketAddr::from_str(&format!("127.0.0.1:{port}")).expect("valid addr");
        NodeInfo {
            instance_id: NodeId(Uuid::from_u128(id)),
            internal_tcp: addr(port),
            internal_secure_tcp: None,
            external_tcp: addr(port + 100),
            external_secure_tcp: None,
            external_http: addr(port + 200),
            node_priority: 0,
        }
    }

    struct SimNode {
        info: NodeInfo,
        progress: FixedProgress,
        service: ElectionsService<flume::Sender<Message>>,
        outbox: flume::Receiver<Message>,
        alive: bool,
        timers: Vec<Message>,
        done: Vec<(i32, NodeId)>,
    }

    /// Cluster with in-memory message delivery
    struct SimCluster {
        nodes: Vec<SimNode>,
        /// (destination, message)
        in_flight: Vec<(SocketAddr, ElectionMessage)>,
    }

    impl SimCluster {
        fn new(nodes: Vec<(NodeInfo, FixedProgress)>) -> Self {
            let cluster_size = nodes.len();
            let mut cluster = Self {
                nodes: nodes
                    .into_iter()
                    .map(|(info, progress)| {
                        let (tx, rx) = flume::unbounded();
                        SimNode {
                            service: ElectionsService::new(
                                tx,
                                info.clone(),
                                Arc::new(progress),
                                cluster_size,
                                ElectionsTimeouts::default(),
                            ),
                            info,
                            progress,
                            outbox: rx,
                            alive: true,
                            timers: vec![],
                            done: vec![],
                        }
                    })
                    .collect(),
                in_flight: vec![],
            };
            cluster.gossip();
            cluster
        }

        fn members(&self) -> Vec<MemberInfo> {
            self.nodes
                .iter()
                .map(|n| n.info.member_info(VNodeState::Unknown, n.alive, &n.progress))
                .collect()
        }

        /// Let every alive node know who is alive
        fn gossip(&mut self) {
            let members = self.members();
            for i in 0..self.nodes.len() {
                if self.nodes[i].alive {
                    self.handle(i, GossipMessage::GossipUpdated(members.clone()).into());
                }
            }
        }

        fn handle(&mut self, i: usize, msg: Message) {
            self.nodes[i].service.handle(msg);
            let outputs: Vec<_> = self.nodes[i].outbox.try_iter().collect();
            for out in outputs {
                match out {
                    Message::Peer(send) => {
                        let msg = ElectionMessage::from_peer(send.message)
                            .expect("only election traffic");
                        self.in_flight.push((send.to, msg));
                    }
                    Message::Timer(TimerMessage::Schedule { message, .. }) => {
                        self.nodes[i].timers.push(*message);
                    }
                    Message::Election(ElectionMessage::ElectionsDone { view, master }) => {
                        self.nodes[i].done.push((view, master.instance_id));
                    }
                    other => panic!("unexpected output {other:?}"),
                }
            }
        }

        fn index_of(&self, addr: SocketAddr) -> Option<usize> {
            self.nodes.iter().position(|n| n.info.internal_tcp == addr)
        }

        fn deliver(&mut self, k: usize) {
            let (to, msg) = self.in_flight.remove(k);
            if let Some(i) = self.index_of(to).filter(|i| self.nodes[*i].alive) {
                self.handle(i, msg.into());
            }
        }

        fn deliver_all_in_order(&mut self) {
            while !self.in_flight.is_empty() {
                self.deliver(0);
            }
        }

        fn deliver_all_randomly(&mut self, rng: &mut StdRng) {
            while !self.in_flight.is_empty() {
                let k = rng.gen_range(0..self.in_flight.len());
                self.deliver(k);
            }
        }

        /// Fire pending election timeouts of alive nodes
        fn fire_timeouts(&mut self) {
            for i in 0..self.nodes.len() {
                let timers = std::mem::take(&mut self.nodes[i].timers);
                if !self.nodes[i].alive {
                    continue;
                }
                for timer in timers {
                    if matches!(
                        timer,
                        Message::Election(ElectionMessage::ElectionsTimedOut { .. })
                    ) {
                        self.handle(i, timer);
                    }
                }
            }
        }

        fn start_elections(&mut self, nodes: &[usize]) {
            for &i in nodes {
                self.handle(i, ElectionMessage::StartElections.into());
            }
        }

        fn last_done(&self, i: usize) -> Option<(i32, NodeId)> {
            self.nodes[i].done.last().copied()
        }
    }

    fn equal_progress() -> FixedProgress {
        FixedProgress {
            epoch: None,
            writer: 1000,
            chaser: 1000,
            commit: 1000,
        }
    }

    #[test]
    fn tied_candidates_resolve_by_highest_node_id() {
        let mut cluster = SimCluster::new(vec![
            (node_info(1001, 1), equal_progress()),
            (node_info(1002, 3), equal_progress()),
            (node_info(1003, 2), equal_progress()),
        ]);
        cluster.start_elections(&[0, 1, 2]);
        cluster.deliver_all_in_order();

        // leader of view 0 is the node with the highest endpoint, the first
        // prepare-ok it gets is from 1002, both tied, higher id wins
        let expected = (0, NodeId(Uuid::from_u128(3)));
        for i in 0..3 {
            assert_eq!(cluster.last_done(i), Some(expected));
            assert_eq!(cluster.nodes[i].service.master(), Some(expected.1));
        }
    }

    #[test]
    fn most_advanced_candidate_wins() {
        let mut cluster = SimCluster::new(vec![
            (node_info(1001, 1), equal_progress()),
            (
                node_info(1002, 2),
                FixedProgress {
                    writer: 2000,
                    ..equal_progress()
                },
            ),
            (node_info(1003, 3), equal_progress()),
        ]);
        cluster.start_elections(&[0, 1, 2]);
        cluster.deliver_all_in_order();

        for i in 0..3 {
            assert_eq!(cluster.last_done(i), Some((0, NodeId(Uuid::from_u128(2)))));
        }
    }

    #[test]
    fn master_crash_is_followed_by_reelection() {
        let mut cluster = SimCluster::new(vec![
            (node_info(1001, 1), equal_progress()),
            (node_info(1002, 3), equal_progress()),
            (node_info(1003, 2), equal_progress()),
        ]);
        cluster.start_elections(&[0, 1, 2]);
        cluster.deliver_all_in_order();
        assert_eq!(cluster.last_done(0), Some((0, NodeId(Uuid::from_u128(3)))));

        // master (1002) dies before anyone's member list gets updated,
        // so the next view's leader is the dead node
        cluster.nodes[1].alive = false;
        cluster.start_elections(&[0, 2]);
        cluster.deliver_all_in_order();
        assert_eq!(cluster.last_done(0).map(|(view, _)| view), Some(0));

        let mut rounds = 0;
        while cluster.last_done(0).map(|(view, _)| view) == Some(0) && rounds < 2 {
            cluster.fire_timeouts();
            cluster.deliver_all_in_order();
            rounds += 1;
        }

        let (view, master) = cluster.last_done(0).expect("elected");
        assert!(0 < view);
        assert_eq!(cluster.last_done(2), Some((view, master)));
        assert_ne!(master, NodeId(Uuid::from_u128(3)));
    }

    #[test]
    fn view_change_proof_installs_the_view() {
        let mut cluster = SimCluster::new(vec![
            (node_info(1001, 1), equal_progress()),
            (node_info(1002, 2), equal_progress()),
            (node_info(1003, 3), equal_progress()),
        ]);
        cluster.start_elections(&[0, 1, 2]);
        cluster.deliver_all_in_order();
        let installed = cluster.nodes[2].service.last_installed_view();
        assert_eq!(installed, 0);

        let late_info = node_info(1004, 4);
        let mut members = cluster.members();
        members.push(late_info.member_info(VNodeState::Unknown, true, &equal_progress()));
        let mut late = ElectionsService::new(
            flume::unbounded().0,
            late_info,
            Arc::new(equal_progress()),
            4,
            ElectionsTimeouts::default(),
        );
        late.handle(GossipMessage::GossipUpdated(members).into());
        late.handle(ElectionMessage::StartElections.into());
        assert_eq!(late.state(), ElectionsState::ElectingLeader);

        // leader of view 1 is 1003, so the late node just installs the view
        late.handle(
            ElectionMessage::ViewChangeProof(peer::ViewChangeProof {
                server_id: cluster.nodes[2].info.instance_id,
                server_internal: cluster.nodes[2].info.internal_tcp,
                installed_view: installed + 1,
            })
            .into(),
        );
        assert_eq!(late.state(), ElectionsState::NonLeader);
        assert_eq!(late.last_installed_view(), installed + 1);

        // stale proofs change nothing
        late.handle(
            ElectionMessage::ViewChangeProof(peer::ViewChangeProof {
                server_id: cluster.nodes[0].info.instance_id,
                server_internal: cluster.nodes[0].info.internal_tcp,
                installed_view: installed,
            })
            .into(),
        );
        assert_eq!(late.last_installed_view(), installed + 1);
    }

    #[test]
    fn candidate_comparison_returns_on_first_difference() {
        let own = MasterCandidate {
            instance_id: NodeId(Uuid::from_u128(1)),
            internal_tcp: node_info(1001, 1).internal_tcp,
            epoch_number: 3,
            epoch_position: 100,
            epoch_id: EpochId::nil(),
            last_commit_position: 500,
            writer_checkpoint: 600,
            chaser_checkpoint: 600,
            node_priority: 0,
        };
        let newer_epoch_but_behind = MasterCandidate {
            epoch_number: 4,
            last_commit_position: 0,
            writer_checkpoint: 0,
            ..own
        };
        assert!(is_candidate_good_enough(&newer_epoch_but_behind, &own));
        let behind = MasterCandidate {
            writer_checkpoint: 599,
            chaser_checkpoint: 10_000,
            ..own
        };
        assert!(!is_candidate_good_enough(&behind, &own));
        assert!(is_candidate_good_enough(&own, &own));
    }

    #[test]
    fn random_delivery_never_elects_two_masters_in_a_view() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let nodes = (0..5u16)
                .map(|i| {
                    let progress = FixedProgress {
                        writer: rng.gen_range(0..3) * 100,
                        commit: rng.gen_range(0..3) * 100,
                        ..FixedProgress::default()
                    };
                    (node_info(2000 + i, rng.gen::<u128>()), progress)
                })
                .collect();
            let mut cluster = SimCluster::new(nodes);
            cluster.start_elections(&[0, 1, 2, 3, 4]);

            for _ in 0..4 {
                cluster.deliver_all_randomly(&mut rng);
                if cluster.nodes.iter().all(|n| !n.done.is_empty()) {
                    break;
                }
                cluster.fire_timeouts();
            }

            let mut masters = BTreeMap::new();
            for node in &cluster.nodes {
                for (view, master) in &node.done {
                    let elected = masters.entry(*view).or_insert(*master);
                    assert_eq!(elected, master, "seed {seed}: two masters in view {view}");
                }
            }
            assert!(!masters.is_empty(), "seed {seed}: nothing elected");
        }
    }
}
