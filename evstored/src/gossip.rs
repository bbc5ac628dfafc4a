//! Cluster membership gossip
//!
//! Every round a node sends what it knows about the cluster to the
//! seeds and to every member it heard about. Member snapshots are
//! merged by their timestamp; liveness is only ever judged from
//! direct contact.
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evstored_api::peer::{self, PeerMessage};
use evstored_api::{MemberInfo, NodeId, VNodeState};
use tracing::{debug, info, trace};

use crate::bus::{Publisher, QUEUE_POLL_INTERVAL};
use crate::cluster::{NodeInfo, ReplicationProgress};
use crate::message::{ElectionMessage, GossipMessage, Message, SystemMessage};
use crate::task::{AutoJoinHandle, PanicGuard};

#[derive(Copy, Clone, Debug)]
pub struct GossipTimeouts {
    pub interval: Duration,
    /// Members not heard from for this long are considered dead
    pub timeout: Duration,
}

impl Default for GossipTimeouts {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(2500),
        }
    }
}

pub struct GossipService<P> {
    publisher: P,
    info: NodeInfo,
    progress: Arc<dyn ReplicationProgress>,
    seeds: Vec<SocketAddr>,
    timeouts: GossipTimeouts,

    state: VNodeState,
    /// Other members, as last heard of
    members: HashMap<NodeId, MemberInfo>,
    /// Last gossip received directly from an internal endpoint
    last_contact: HashMap<SocketAddr, Instant>,
    /// Gossip before the interval is up, once the queue is drained
    round_requested: bool,
}

impl<P> GossipService<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        info: NodeInfo,
        progress: Arc<dyn ReplicationProgress>,
        seeds: Vec<SocketAddr>,
        timeouts: GossipTimeouts,
    ) -> Self {
        Self {
            publisher,
            info,
            progress,
            seeds,
            timeouts,
            state: VNodeState::Initializing,
            members: HashMap::new(),
            last_contact: HashMap::new(),
            round_requested: false,
        }
    }

    pub fn handle(&mut self, msg: Message, now: Instant) {
        match msg {
            Message::Gossip(GossipMessage::GossipReceived(gossip)) => {
                self.handle_gossip_received(gossip, now)
            }
            Message::Election(ElectionMessage::ElectionsDone { view, master }) => {
                debug!(view, master = %master.instance_id, "Master changed, gossiping early");
                self.round_requested = true;
            }
            Message::System(SystemMessage::SystemInit) => {
                info!(seeds = ?self.seeds, "Starting gossip");
            }
            Message::System(m) => {
                if let Some(state) = m.new_state() {
                    self.state = state;
                }
            }
            other => trace!(msg = ?other, "Ignored by gossip"),
        }
    }

    fn handle_gossip_received(&mut self, gossip: peer::Gossip, now: Instant) {
        self.last_contact.insert(gossip.sender_internal, now);
        for member in gossip.members {
            if member.instance_id == self.info.instance_id
                || member.internal_tcp == self.info.internal_tcp
            {
                continue;
            }
            let is_newer = self
                .members
                .get(&member.instance_id)
                .map_or(true, |known| known.time_stamp < member.time_stamp);
            if !is_newer {
                continue;
            }
            // a node restarted with a new id replaces its old self
            let replaced: Vec<_> = self
                .members
                .values()
                .filter(|m| {
                    m.internal_tcp == member.internal_tcp
                        && m.instance_id != member.instance_id
                        && m.time_stamp < member.time_stamp
                })
                .map(|m| m.instance_id)
                .collect();
            for id in replaced {
                debug!(old = %id, new = %member.instance_id, endpoint = %member.internal_tcp, "Member replaced");
                self.members.remove(&id);
            }
            if !self.members.contains_key(&member.instance_id) {
                info!(
                    id = %member.instance_id,
                    endpoint = %member.internal_tcp,
                    state = ?member.state,
                    "New cluster member"
                );
            }
            self.members.insert(member.instance_id, member);
        }
    }

    fn is_alive(&self, endpoint: SocketAddr, now: Instant) -> bool {
        self.last_contact
            .get(&endpoint)
            .map_or(false, |last| now.saturating_duration_since(*last) < self.timeouts.timeout)
    }

    /// Current view of the cluster, this node first
    pub fn cluster(&self, now: Instant) -> Vec<MemberInfo> {
        let mut members = vec![self
            .info
            .member_info(self.state, true, self.progress.as_ref())];
        members.extend(self.members.values().map(|m| MemberInfo {
            is_alive: self.is_alive(m.internal_tcp, now),
            ..m.clone()
        }));
        members
    }

    /// One gossip round
    pub fn tick(&mut self, now: Instant) {
        self.round_requested = false;
        let members = self.cluster(now);
        let targets: BTreeSet<_> = self
            .seeds
            .iter()
            .copied()
            .chain(self.members.values().map(|m| m.internal_tcp))
            .filter(|addr| *addr != self.info.internal_tcp)
            .collect();
        trace!(members = members.len(), targets = targets.len(), "Gossip round");
        for to in targets {
            self.publisher.publish(Message::peer_send(
                to,
                PeerMessage::Gossip(peer::Gossip {
                    sender_internal: self.info.internal_tcp,
                    members: members.clone(),
                }),
            ));
        }
        self.publisher
            .publish(GossipMessage::GossipUpdated(members).into());
    }

    fn run(&mut self, rx: &flume::Receiver<Message>, is_node_shutting_down: &AtomicBool) {
        let mut next_tick = Instant::now();
        while !is_node_shutting_down.load(Ordering::SeqCst) {
            let now = Instant::now();
            if next_tick <= now || (self.round_requested && rx.is_empty()) {
                self.tick(now);
                next_tick = now + self.timeouts.interval;
            }
            let wait = next_tick
                .saturating_duration_since(now)
                .min(QUEUE_POLL_INTERVAL);
            match rx.recv_timeout(wait) {
                Ok(msg) => self.handle(msg, Instant::now()),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

impl GossipService<flume::Sender<Message>> {
    pub fn start(
        mut self,
        rx: flume::Receiver<Message>,
        is_node_shutting_down: Arc<AtomicBool>,
    ) -> io::Result<AutoJoinHandle> {
        AutoJoinHandle::spawn("gossip", move || {
            let guard = PanicGuard::new("gossip", is_node_shutting_down.clone());
            self.run(&rx, &is_node_shutting_down);
            guard.done();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use evstored_api::EpochRecord;

    use super::*;

    struct NoProgress;

    impl ReplicationProgress for NoProgress {
        fn last_epoch(&self) -> Option<EpochRecord> {
            None
        }

        fn writer_checkpoint(&self) -> i64 {
            0
        }

        fn chaser_checkpoint(&self) -> i64 {
            0
        }

        fn last_commit_position(&self) -> i64 {
            -1
        }
    }

    fn node_info(port: u16) -> NodeInfo {
        let addr = |port| SocketAddr::from_str(&format!("127.0.0.1:{port}")).expect("valid addr");
        NodeInfo {
            instance_id: NodeId::new_random(),
            internal_tcp: addr(port),
            internal_secure_tcp: None,
            external_tcp: addr(port + 100),
            external_secure_tcp: None,
            external_http: addr(port + 200),
            node_priority: 0,
        }
    }

    fn service(
        info: &NodeInfo,
        seeds: Vec<SocketAddr>,
    ) -> (GossipService<flume::Sender<Message>>, flume::Receiver<Message>) {
        let (tx, rx) = flume::unbounded();
        (
            GossipService::new(tx, info.clone(), Arc::new(NoProgress), seeds, GossipTimeouts::default()),
            rx,
        )
    }

    fn gossip_from(info: &NodeInfo, members: Vec<MemberInfo>) -> Message {
        GossipMessage::GossipReceived(peer::Gossip {
            sender_internal: info.internal_tcp,
            members,
        })
        .into()
    }

    #[test]
    fn merge_keeps_newest_snapshot_and_own_entry() {
        let me = node_info(1111);
        let other = node_info(2111);
        let (mut gossip, _rx) = service(&me, vec![]);
        let now = Instant::now();

        let stale_me = me.member_info(VNodeState::Master, false, &NoProgress);
        let old = MemberInfo {
            time_stamp: 10,
            ..other.member_info(VNodeState::Unknown, true, &NoProgress)
        };
        let new = MemberInfo {
            time_stamp: 20,
            state: VNodeState::Slave,
            ..old.clone()
        };
        gossip.handle(gossip_from(&other, vec![new.clone(), stale_me]), now);
        gossip.handle(gossip_from(&other, vec![old]), now);

        let cluster = gossip.cluster(now);
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster[0].instance_id, me.instance_id);
        assert_eq!(cluster[0].state, VNodeState::Initializing);
        assert!(cluster[0].is_alive);
        assert_eq!(cluster[1].state, VNodeState::Slave);
        assert_eq!(cluster[1].time_stamp, 20);
    }

    #[test]
    fn liveness_follows_direct_contact() {
        let me = node_info(1111);
        let direct = node_info(2111);
        let hearsay = node_info(3111);
        let (mut gossip, _rx) = service(&me, vec![]);
        let start = Instant::now();

        gossip.handle(
            gossip_from(
                &direct,
                vec![
                    direct.member_info(VNodeState::Unknown, true, &NoProgress),
                    hearsay.member_info(VNodeState::Unknown, true, &NoProgress),
                ],
            ),
            start,
        );
        let alive = |cluster: Vec<MemberInfo>, id: NodeId| {
            cluster
                .iter()
                .find(|m| m.instance_id == id)
                .map(|m| m.is_alive)
        };

        let soon = start + Duration::from_secs(1);
        assert_eq!(alive(gossip.cluster(soon), direct.instance_id), Some(true));
        // never heard from it directly
        assert_eq!(alive(gossip.cluster(soon), hearsay.instance_id), Some(false));

        let later = start + GossipTimeouts::default().timeout + Duration::from_millis(1);
        assert_eq!(alive(gossip.cluster(later), direct.instance_id), Some(false));
    }

    #[test]
    fn restarted_node_replaces_its_old_entry() {
        let me = node_info(1111);
        let other = node_info(2111);
        let (mut gossip, _rx) = service(&me, vec![]);
        let now = Instant::now();

        let before = MemberInfo {
            time_stamp: 10,
            ..other.member_info(VNodeState::Slave, true, &NoProgress)
        };
        let after = MemberInfo {
            instance_id: NodeId::new_random(),
            time_stamp: 20,
            ..before.clone()
        };
        gossip.handle(gossip_from(&other, vec![before]), now);
        gossip.handle(gossip_from(&other, vec![after.clone()]), now);

        let cluster = gossip.cluster(now);
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster[1].instance_id, after.instance_id);
    }

    #[test]
    fn round_reaches_seeds_and_known_members() {
        let me = node_info(1111);
        let seed = node_info(2111);
        let learned = node_info(3111);
        let (mut gossip, rx) = service(&me, vec![seed.internal_tcp, me.internal_tcp]);
        let now = Instant::now();

        gossip.handle(
            gossip_from(
                &seed,
                vec![learned.member_info(VNodeState::Unknown, true, &NoProgress)],
            ),
            now,
        );
        gossip.tick(now);

        let out: Vec<_> = rx.try_iter().collect();
        let targets: BTreeSet<_> = out
            .iter()
            .filter_map(|m| match m {
                Message::Peer(send) => Some(send.to),
                _ => None,
            })
            .collect();
        assert_eq!(
            targets,
            BTreeSet::from([seed.internal_tcp, learned.internal_tcp])
        );
        assert!(out.iter().any(|m| matches!(
            m,
            Message::Gossip(GossipMessage::GossipUpdated(members)) if members.len() == 2
        )));
    }

    #[test]
    fn new_master_requests_an_early_round() {
        let me = node_info(1111);
        let master = node_info(2111);
        let (mut gossip, rx) = service(&me, vec![master.internal_tcp]);
        let now = Instant::now();
        assert!(!gossip.round_requested);

        gossip.handle(
            ElectionMessage::ElectionsDone {
                view: 3,
                master: master.member_info(VNodeState::Unknown, true, &NoProgress),
            }
            .into(),
            now,
        );
        assert!(gossip.round_requested);
        assert!(rx.is_empty());

        gossip.tick(now);
        assert!(!gossip.round_requested);
        assert!(rx
            .try_iter()
            .any(|m| matches!(m, Message::Peer(send) if send.to == master.internal_tcp)));
    }
}
