use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evstored_api::{CorrelationId, LogRecord, NodeId, VNodeState};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing::{debug, error, info, trace};
use typed_builder::TypedBuilder;

use crate::bus::{OutputBus, Publisher};
use crate::cluster::{NodeInfo, NodeProgress, ReplicationProgress};
use crate::controller::{ControllerTimeouts, SharedState, VNodeController};
use crate::db::{ChunkDb, ChunkDbConfig};
use crate::elections::{ElectionsService, ElectionsTimeouts};
use crate::epoch::EpochManager;
use crate::gossip::{GossipService, GossipTimeouts};
use crate::message::{ClientMessage, ClientResponse, Envelope, Message, SystemMessage};
use crate::peer::PeerTransport;
use crate::replication::{MasterReplicationService, ReplicaService};
use crate::services::{StorageChaserService, StorageWriterService};
use crate::task::{AutoJoinHandle, PanicGuard};
use crate::timer::TimerService;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Random if not set
    #[builder(default, setter(strip_option))]
    pub id: Option<NodeId>,
    #[builder(default = Parameters::DEFAULT_NODE_PRIORITY)]
    pub node_priority: i32,
    #[builder(default = Parameters::DEFAULT_CLUSTER_SIZE)]
    pub cluster_size: usize,

    /// Where chunk and checkpoint files are stored
    pub data_dir: PathBuf,
    #[builder(default = Parameters::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u32,
    #[builder(default = Parameters::DEFAULT_VERIFY_HASHES)]
    pub verify_hashes: bool,
    #[builder(default = Parameters::DEFAULT_EPOCH_CACHE_SIZE)]
    pub epoch_cache_size: usize,

    /// Elections, gossip and replication listen here
    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub internal_bind: SocketAddr,
    /// Internal address announced to other nodes, the bound one if not set
    #[builder(default)]
    pub internal_advertise: Option<SocketAddr>,
    /// Client endpoints announced to other nodes, for redirects
    #[builder(default)]
    pub external_tcp: Option<SocketAddr>,
    #[builder(default)]
    pub external_http: Option<SocketAddr>,

    #[builder(default)]
    pub gossip_seeds: Vec<SocketAddr>,
    #[builder(default = Parameters::DEFAULT_GOSSIP_INTERVAL)]
    pub gossip_interval: Duration,
    #[builder(default = Parameters::DEFAULT_GOSSIP_TIMEOUT)]
    pub gossip_timeout: Duration,

    #[builder(default = Parameters::DEFAULT_PREPARE_TIMEOUT)]
    pub prepare_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_COMMIT_TIMEOUT)]
    pub commit_timeout: Duration,

    #[builder(default = Parameters::DEFAULT_LEADER_ELECTION_PROGRESS_TIMEOUT)]
    pub leader_election_progress_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_VIEW_CHANGE_PROOF_INTERVAL)]
    pub view_change_proof_interval: Duration,

    #[builder(default = Parameters::DEFAULT_MASTER_RECONNECTION_DELAY)]
    pub master_reconnection_delay: Duration,
    #[builder(default = Parameters::DEFAULT_SUBSCRIPTION_RETRY_DELAY)]
    pub subscription_retry_delay: Duration,
    #[builder(default = Parameters::DEFAULT_SUBSCRIPTION_TIMEOUT)]
    pub subscription_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,
    #[builder(default = Parameters::DEFAULT_HEARTBEAT_TIMEOUT)]
    pub heartbeat_timeout: Duration,

    #[builder(default = Parameters::DEFAULT_SHUTDOWN_TIMEOUT)]
    pub shutdown_timeout: Duration,
}

impl Parameters {
    pub const DEFAULT_NODE_PRIORITY: i32 = 0;
    pub const DEFAULT_CLUSTER_SIZE: usize = 1;
    pub const DEFAULT_CHUNK_SIZE: u32 = ChunkDbConfig::DEFAULT_CHUNK_SIZE;
    pub const DEFAULT_VERIFY_HASHES: bool = true;
    pub const DEFAULT_EPOCH_CACHE_SIZE: usize = 1000;
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_GOSSIP_TIMEOUT: Duration = Duration::from_millis(2500);
    pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_millis(2000);
    pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_millis(2000);
    pub const DEFAULT_LEADER_ELECTION_PROGRESS_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_VIEW_CHANGE_PROOF_INTERVAL: Duration = Duration::from_millis(5000);
    pub const DEFAULT_MASTER_RECONNECTION_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

    /// How long a replica waits for the master to answer a forwarded write
    pub fn forwarding_timeout(&self) -> Duration {
        self.prepare_timeout + self.commit_timeout + Duration::from_millis(300)
    }
}

/// State shared by all the actors of a node
pub struct NodeShared {
    params: Parameters,
    info: NodeInfo,
    db: Arc<ChunkDb>,
    epochs: Arc<EpochManager>,
    progress: Arc<NodeProgress>,
    main_queue: flume::Sender<Message>,
    state: Arc<SharedState>,

    /// Every actor exits once set
    is_node_shutting_down: Arc<AtomicBool>,
    /// Graceful shutdown, picked up by the controller
    shutdown_requested: Arc<AtomicBool>,
}

impl NodeShared {
    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_node_shutting_down_flag(&self) -> &Arc<AtomicBool> {
        &self.is_node_shutting_down
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    pub fn progress(&self) -> &Arc<NodeProgress> {
        &self.progress
    }

    pub fn main_queue(&self) -> &flume::Sender<Message> {
        &self.main_queue
    }

    pub fn state(&self) -> VNodeState {
        self.state.get()
    }
}

pub struct NodeCtrl {
    shared: Arc<NodeShared>,
}

impl NodeCtrl {
    pub fn internal_addr(&self) -> SocketAddr {
        self.shared.info.internal_tcp
    }

    pub fn instance_id(&self) -> NodeId {
        self.shared.info.instance_id
    }

    pub fn state(&self) -> VNodeState {
        self.shared.state()
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.shared.db
    }

    pub fn last_commit_position(&self) -> i64 {
        self.shared.progress.last_commit_position()
    }

    /// Data of every event this node has chased so far, in log order
    pub fn read_events(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let db = &self.shared.db;
        let end = db.chaser_checkpoint().read();
        let mut position = 0;
        let mut events = vec![];
        while position < end {
            let Some((record, next)) = db.read_forward(position)? else {
                break;
            };
            if let LogRecord::Data(data) = record {
                events.push(data.data);
            }
            position = next;
        }
        Ok(events)
    }

    /// Submit a client write, its outcome arrives on the returned channel
    pub fn write_events(
        &self,
        events: Vec<Vec<u8>>,
        require_master: bool,
    ) -> flume::Receiver<ClientResponse> {
        let (tx, rx) = flume::bounded(1);
        self.shared.main_queue.publish(
            ClientMessage::WriteEvents {
                correlation_id: CorrelationId::new_random(),
                require_master,
                events,
                envelope: Envelope::Channel(tx),
            }
            .into(),
        );
        rx
    }

    pub fn stop(&self) {
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.shared.shutdown_requested))?;
        }
        Ok(())
    }
}

/// Threads of a running node, joined on drop
struct NodeThreads {
    #[allow(unused)]
    controller: AutoJoinHandle,
    #[allow(unused)]
    timer: TimerService,
    #[allow(unused)]
    elections: AutoJoinHandle,
    #[allow(unused)]
    gossip: AutoJoinHandle,
    #[allow(unused)]
    storage_writer: StorageWriterService,
    #[allow(unused)]
    storage_chaser: StorageChaserService,
    #[allow(unused)]
    replica: ReplicaService,
    #[allow(unused)]
    master_replication: MasterReplicationService,
    #[allow(unused)]
    peer_transport: PeerTransport,
}

pub struct Node {
    shared: Arc<NodeShared>,
    stop_on_drop: bool,
    threads: Option<NodeThreads>,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.shared.shutdown_requested.store(true, Ordering::SeqCst);
        }
        drop(self.threads.take());
        // controller might have never got to it
        if let Err(e) = self.shared.db.close() {
            error!(error = %e, "Closing database failed");
        }
    }
}

impl Node {
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        info!(
            internal_bind = %params.internal_bind,
            data_dir = %params.data_dir.display(),
            cluster_size = params.cluster_size,
            "Starting evstored"
        );

        let mut db_config = ChunkDbConfig::with_file_checkpoints(&params.data_dir, params.chunk_size)?;
        db_config.verify_hashes = params.verify_hashes;
        let db = Arc::new(ChunkDb::open(db_config)?);
        let epochs = Arc::new(EpochManager::init(db.clone(), params.epoch_cache_size)?);
        let progress = Arc::new(NodeProgress::new(db.clone(), epochs.clone()));

        let listener = std::net::TcpListener::bind(params.internal_bind)?;
        let internal_tcp = params
            .internal_advertise
            .unwrap_or(listener.local_addr()?);
        let info = NodeInfo {
            instance_id: params.id.unwrap_or_else(NodeId::new_random),
            internal_tcp,
            internal_secure_tcp: None,
            external_tcp: params.external_tcp.unwrap_or(internal_tcp),
            external_secure_tcp: None,
            external_http: params.external_http.unwrap_or(internal_tcp),
            node_priority: params.node_priority,
        };
        info!(id = %info.instance_id, internal = %info.internal_tcp, "Node identity");

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let (main_tx, main_rx) = flume::unbounded();
        let (bus, queues) = OutputBus::new();

        let shared = Arc::new(NodeShared {
            params: params.clone(),
            info: info.clone(),
            db: db.clone(),
            epochs,
            progress: progress.clone(),
            main_queue: main_tx.clone(),
            state: Arc::new(SharedState::default()),
            is_node_shutting_down: is_node_shutting_down.clone(),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        });

        // the only service that can fail before its thread is running, so it goes first
        let storage_writer = StorageWriterService::new(shared.clone(), queues.storage_writer)?;
        // from here on a failed start must stop what already runs
        let stop_started = scopeguard::guard(is_node_shutting_down.clone(), |flag| {
            flag.store(true, Ordering::SeqCst);
        });

        let storage_chaser = StorageChaserService::new(shared.clone(), queues.storage_chaser)?;
        let replica = ReplicaService::new(shared.clone(), queues.replica)?;
        let master_replication =
            MasterReplicationService::new(shared.clone(), queues.master_replication)?;
        let timer = TimerService::new(queues.timer, main_tx.clone(), is_node_shutting_down.clone())?;

        let progress: Arc<dyn ReplicationProgress> = progress;
        let elections = ElectionsService::new(
            main_tx.clone(),
            info.clone(),
            progress.clone(),
            params.cluster_size,
            ElectionsTimeouts {
                leader_election_progress: params.leader_election_progress_timeout,
                send_view_change_proof_interval: params.view_change_proof_interval,
            },
        )
        .start(queues.elections, is_node_shutting_down.clone())?;
        let gossip = GossipService::new(
            main_tx.clone(),
            info.clone(),
            progress,
            params.gossip_seeds.clone(),
            GossipTimeouts {
                interval: params.gossip_interval,
                timeout: params.gossip_timeout,
            },
        )
        .start(queues.gossip, is_node_shutting_down.clone())?;

        let peer_transport = PeerTransport::new(
            listener,
            queues.peer,
            main_tx.clone(),
            is_node_shutting_down.clone(),
            params.connect_timeout,
        )?;

        let mut controller = VNodeController::new(
            bus,
            info,
            db,
            ControllerTimeouts {
                shutdown: params.shutdown_timeout,
                master_reconnection_delay: params.master_reconnection_delay,
                subscription_retry_delay: params.subscription_retry_delay,
                subscription_timeout: params.subscription_timeout,
                forwarding_timeout: params.forwarding_timeout(),
            },
            shared.state.clone(),
            is_node_shutting_down,
        );
        let controller = AutoJoinHandle::spawn("vnode-controller", {
            let shared = shared.clone();
            move || {
                let guard = shared.panic_guard("vnode-controller");
                controller.run(&main_rx, &shared.shutdown_requested);
                guard.done();
            }
        })?;

        scopeguard::ScopeGuard::into_inner(stop_started);
        main_tx.publish(SystemMessage::SystemInit.into());

        Ok(Node {
            shared,
            stop_on_drop: true,
            threads: Some(NodeThreads {
                controller,
                timer,
                elections,
                gossip,
                storage_writer,
                storage_chaser,
                replica,
                master_replication,
                peer_transport,
            }),
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            shared: self.shared.clone(),
        }
    }

    /// Block until the node shut down
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}
