//! Internal TCP transport between nodes
//!
//! Every node listens on its internal endpoint. Messages to other
//! nodes go over outbound connections made on demand, one per
//! destination. Inbound connections are read here and turned into
//! [`Message`]s for the main queue; replies (replication stream,
//! forwarded write results) go back over the same connection through
//! a [`ConnectionHandle`].
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evstored_api::peer::PeerMessage;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace};

use crate::bus::Publisher;
use crate::message::{ClientMessage, ElectionMessage, Envelope, GossipMessage, Message, ReplicationMessage};
use crate::task::AutoJoinHandle;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid data")]
    Invalid,
    #[error("invalid data: {0}")]
    ParseError(#[from] binrw::Error),
    #[error("io: {0}")]
    IO(#[from] io::Error),
    #[error("join: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Read one `[u32 len][PeerMessage]` frame
pub fn read_frame(r: &mut impl Read) -> ConnectionResult<PeerMessage> {
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix)?;
    let len = PeerMessage::frame_len(prefix).ok_or(ConnectionError::Invalid)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(PeerMessage::from_body(&body)?)
}

pub async fn read_frame_async(r: &mut (impl AsyncRead + Unpin)) -> ConnectionResult<PeerMessage> {
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix).await?;
    let len = PeerMessage::frame_len(prefix).ok_or(ConnectionError::Invalid)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(PeerMessage::from_body(&body)?)
}

#[derive(Debug)]
pub enum ConnectionCommand {
    Send(PeerMessage),
    Close,
}

/// Sending side of an accepted connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer_addr: SocketAddr,
    tx: flume::Sender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn new(id: u64, peer_addr: SocketAddr) -> (Self, flume::Receiver<ConnectionCommand>) {
        let (tx, rx) = flume::unbounded();
        (Self { id, peer_addr, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a message, `false` if the connection is gone
    pub fn send(&self, msg: PeerMessage) -> bool {
        self.tx.send(ConnectionCommand::Send(msg)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(ConnectionCommand::Close);
    }

    /// Messages queued and not yet written
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

pub struct PeerTransport {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl PeerTransport {
    /// Serve `listener`, bound by the caller so its address is known upfront
    pub fn new(
        listener: std::net::TcpListener,
        rx: flume::Receiver<Message>,
        main_queue: flume::Sender<Message>,
        is_node_shutting_down: Arc<AtomicBool>,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let inner = Arc::new(PeerTransportInner {
            main_queue,
            is_node_shutting_down,
            connect_timeout,
            next_connection_id: AtomicU64::new(1),
        });

        listener.set_nonblocking(true)?;
        let rt = tokio::runtime::Runtime::new()?;

        let join_handle = AutoJoinHandle::spawn_res("peer-transport", move || -> Result<(), io::Error> {
            let res: Result<(), io::Error> = rt.block_on(async {
                let listener = TcpListener::from_std(listener)?;

                tokio::spawn(inner.clone().send_loop(rx));
                inner.accept_loop(listener).await;

                Ok(())
            });

            res?;

            debug!("Waiting for peer connections to close...");
            rt.shutdown_timeout(Duration::from_secs(1));

            Ok(())
        })?;

        Ok(Self { join_handle })
    }
}

struct PeerTransportInner {
    main_queue: flume::Sender<Message>,
    is_node_shutting_down: Arc<AtomicBool>,
    connect_timeout: Duration,
    next_connection_id: AtomicU64,
}

impl PeerTransportInner {
    fn is_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        while !self.is_shutting_down() {
            let (stream, peer_addr) =
                // bound by a timeout, so we can exit after shutdown in a reasonable time
                match timeout(Duration::from_millis(500), listener.accept()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        error!(%e, "peer listener accept error");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => {
                        // just a timeout
                        continue;
                    }
                };

            debug!(%peer_addr, "New peer connection");

            let self_copy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = self_copy.handle_connection(stream, peer_addr).await {
                    debug!(%peer_addr, "Connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> ConnectionResult<()> {
        stream.set_nodelay(true)?;
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (handle, rx) = ConnectionHandle::new(id, peer_addr);
        let (mut read_half, mut write_half) = stream.into_split();

        let writer = tokio::spawn(async move {
            while let Ok(cmd) = rx.recv_async().await {
                match cmd {
                    ConnectionCommand::Send(msg) => write_half.write_all(&msg.to_frame()).await?,
                    ConnectionCommand::Close => break,
                }
            }
            write_half.shutdown().await
        });

        let res = loop {
            match read_frame_async(&mut read_half).await {
                Ok(msg) => self.dispatch(&handle, msg),
                Err(e) => break e,
            }
        };
        trace!(connection_id = id, %peer_addr, error = %res, "Peer connection closed");

        handle.close();
        self.main_queue.publish(
            ReplicationMessage::ReplicaConnectionClosed { connection_id: id }.into(),
        );
        // the writer fails anyway once the peer is gone
        let _ = writer.await?;
        Ok(())
    }

    fn dispatch(&self, connection: &ConnectionHandle, msg: PeerMessage) {
        let msg = match ElectionMessage::from_peer(msg) {
            Ok(election) => {
                self.main_queue.publish(election.into());
                return;
            }
            Err(msg) => msg,
        };
        let msg: Message = match msg {
            PeerMessage::Gossip(gossip) => GossipMessage::GossipReceived(gossip).into(),
            PeerMessage::SubscribeReplica(request) => {
                ReplicationMessage::ReplicaSubscriptionRequest {
                    connection: connection.clone(),
                    request,
                }
                .into()
            }
            PeerMessage::AckLogPosition(ack) => ReplicationMessage::ReplicaLogPositionAck {
                connection_id: connection.id(),
                ack,
            }
            .into(),
            PeerMessage::WriteAck(ack) => ReplicationMessage::ReplicaWriteAck {
                connection_id: connection.id(),
                ack,
            }
            .into(),
            PeerMessage::ForwardWrite(forward) => ClientMessage::WriteEvents {
                correlation_id: forward.internal_corr_id,
                require_master: true,
                events: forward.events.into_iter().map(|e| e.data).collect(),
                envelope: Envelope::Peer {
                    connection: connection.clone(),
                    internal_corr_id: forward.internal_corr_id,
                },
            }
            .into(),
            PeerMessage::HeartbeatRequest(heartbeat) => {
                connection.send(PeerMessage::HeartbeatResponse(heartbeat));
                return;
            }
            other => {
                debug!(peer_addr = %connection.peer_addr(), msg = ?other, "Unexpected peer message");
                return;
            }
        };
        self.main_queue.publish(msg);
    }

    /// Deliver [`PeerSend`](crate::message::PeerSend)s over outbound connections
    async fn send_loop(self: Arc<Self>, rx: flume::Receiver<Message>) {
        let mut outbound: HashMap<SocketAddr, flume::Sender<PeerMessage>> = HashMap::new();

        while !self.is_shutting_down() {
            let msg = match timeout(Duration::from_millis(100), rx.recv_async()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(_)) => return,
                Err(_) => continue,
            };
            let Message::Peer(send) = msg else {
                trace!(?msg, "Unexpected message");
                continue;
            };

            let message = match outbound.get(&send.to) {
                Some(tx) => match tx.send(send.message) {
                    Ok(()) => continue,
                    // connection task exited, start over with a new one
                    Err(flume::SendError(message)) => message,
                },
                None => send.message,
            };
            let (tx, conn_rx) = flume::unbounded();
            tx.send(message).expect("can't fail");
            outbound.insert(send.to, tx);
            tokio::spawn(self.clone().outbound_connection(send.to, conn_rx));
        }
    }

    async fn outbound_connection(self: Arc<Self>, to: SocketAddr, rx: flume::Receiver<PeerMessage>) {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(to)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(%to, error = %e, "Connecting to peer failed");
                return;
            }
            Err(_) => {
                debug!(%to, "Connecting to peer timed out");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%to, error = %e, "Can't set nodelay");
        }
        info!(%to, "Connected to peer");

        while !self.is_shutting_down() {
            let msg = match timeout(Duration::from_millis(500), rx.recv_async()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(_)) => return,
                Err(_) => continue,
            };
            if let Err(e) = stream.write_all(&msg.to_frame()).await {
                debug!(%to, error = %e, "Writing to peer failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::str::FromStr;

    use evstored_api::peer::{Gossip, Heartbeat, ReplicaSubscribed};
    use evstored_api::{NodeId, SubscriptionId};

    use super::*;

    struct TestTransport {
        #[allow(unused)]
        transport: PeerTransport,
        addr: SocketAddr,
        tx: flume::Sender<Message>,
        main_rx: flume::Receiver<Message>,
        flag: Arc<AtomicBool>,
    }

    impl Drop for TestTransport {
        fn drop(&mut self) {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    fn transport() -> anyhow::Result<TestTransport> {
        let (tx, rx) = flume::unbounded();
        let (main_tx, main_rx) = flume::unbounded();
        let flag = Arc::new(AtomicBool::new(false));
        let listener = StdTcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        Ok(TestTransport {
            addr,
            transport: PeerTransport::new(
                listener,
                rx,
                main_tx,
                flag.clone(),
                Duration::from_secs(1),
            )?,
            tx,
            main_rx,
            flag,
        })
    }

    fn recv(rx: &flume::Receiver<Message>) -> anyhow::Result<Message> {
        Ok(rx.recv_timeout(Duration::from_secs(5))?)
    }

    #[test]
    fn inbound_messages_reach_the_main_queue() -> anyhow::Result<()> {
        let t = transport()?;
        let mut stream = StdTcpStream::connect(t.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let gossip = Gossip {
            sender_internal: SocketAddr::from_str("127.0.0.1:1112")?,
            members: vec![],
        };
        stream.write_all(&PeerMessage::Gossip(gossip.clone()).to_frame())?;
        assert!(matches!(
            recv(&t.main_rx)?,
            Message::Gossip(GossipMessage::GossipReceived(g)) if g == gossip
        ));

        // heartbeats are answered right away
        stream.write_all(&PeerMessage::HeartbeatRequest(Heartbeat { msg_num: 7 }).to_frame())?;
        assert_eq!(
            read_frame(&mut stream)?,
            PeerMessage::HeartbeatResponse(Heartbeat { msg_num: 7 })
        );
        Ok(())
    }

    #[test]
    fn replies_go_back_over_the_same_connection() -> anyhow::Result<()> {
        let t = transport()?;
        let mut stream = StdTcpStream::connect(t.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let subscription_id = SubscriptionId::new_random();
        stream.write_all(
            &PeerMessage::SubscribeReplica(evstored_api::peer::SubscribeReplica {
                log_position: 0,
                chunk_id: Default::default(),
                last_epochs: vec![],
                replica_id: NodeId::new_random(),
                replica_internal: SocketAddr::from_str("127.0.0.1:1112")?,
                master_id: NodeId::new_random(),
                subscription_id,
            })
            .to_frame(),
        )?;
        let Message::Replication(ReplicationMessage::ReplicaSubscriptionRequest {
            connection,
            request,
        }) = recv(&t.main_rx)?
        else {
            panic!("expected a subscription request");
        };
        assert_eq!(request.subscription_id, subscription_id);

        let reply = PeerMessage::ReplicaSubscribed(ReplicaSubscribed {
            master_id: request.master_id,
            subscription_id,
            subscription_position: 0,
        });
        assert!(connection.send(reply.clone()));
        assert_eq!(read_frame(&mut stream)?, reply);

        drop(stream);
        assert!(matches!(
            recv(&t.main_rx)?,
            Message::Replication(ReplicationMessage::ReplicaConnectionClosed { connection_id })
                if connection_id == connection.id()
        ));
        Ok(())
    }

    #[test]
    fn outbound_messages_are_delivered() -> anyhow::Result<()> {
        let t = transport()?;
        let listener = StdTcpListener::bind("127.0.0.1:0")?;
        let to = listener.local_addr()?;

        for msg_num in 0..3 {
            t.tx.send(Message::peer_send(
                to,
                PeerMessage::HeartbeatRequest(Heartbeat { msg_num }),
            ))?;
        }
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        for msg_num in 0..3 {
            assert_eq!(
                read_frame(&mut stream)?,
                PeerMessage::HeartbeatRequest(Heartbeat { msg_num })
            );
        }
        Ok(())
    }
}
