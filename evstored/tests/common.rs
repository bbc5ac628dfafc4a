#![allow(unused)]

use anyhow::{bail, Result};
use evstored::message::ClientResponse;
use evstored::{NodeCtrl, Parameters, VNodeState};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TestNode {
    #[allow(unused)]
    data_dir: tempfile::TempDir,
    node: Option<evstored::Node>,
}

impl TestNode {
    pub fn new(cluster_size: usize, gossip_seeds: Vec<SocketAddr>) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let node = evstored::Node::new(Self::params(dir.path(), cluster_size, gossip_seeds))?;
        Ok(Self {
            data_dir: dir,
            node: Some(node),
        })
    }

    fn params(data_dir: &Path, cluster_size: usize, gossip_seeds: Vec<SocketAddr>) -> Parameters {
        Parameters::builder()
            .data_dir(data_dir.to_owned())
            .chunk_size(1024 * 1024)
            .cluster_size(cluster_size)
            .gossip_seeds(gossip_seeds)
            .gossip_interval(Duration::from_millis(100))
            .gossip_timeout(Duration::from_millis(500))
            .leader_election_progress_timeout(Duration::from_millis(500))
            .heartbeat_interval(Duration::from_millis(200))
            .heartbeat_timeout(Duration::from_millis(1000))
            .build()
    }

    /// Stop a single node and start it again over the same data
    pub fn restart(&mut self) -> anyhow::Result<()> {
        self.node().get_ctrl().stop();
        self.node.take();
        self.node = Some(evstored::Node::new(Self::params(
            self.data_dir.path(),
            1,
            vec![],
        ))?);
        Ok(())
    }

    pub fn single() -> anyhow::Result<Self> {
        Self::new(1, vec![])
    }

    /// Start `size` nodes, each seeded with the ones started before it
    pub fn cluster(size: usize) -> anyhow::Result<Vec<Self>> {
        let mut nodes: Vec<Self> = vec![];
        for _ in 0..size {
            let seeds = nodes.iter().map(|n| n.internal_addr()).collect();
            nodes.push(Self::new(size, seeds)?);
        }
        Ok(nodes)
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.ctrl().internal_addr()
    }

    pub fn ctrl(&self) -> NodeCtrl {
        self.node().get_ctrl()
    }

    pub fn state(&self) -> VNodeState {
        self.ctrl().state()
    }

    pub fn node(&self) -> &evstored::Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn write(&self, events: Vec<Vec<u8>>, require_master: bool) -> Result<ClientResponse> {
        Ok(self
            .ctrl()
            .write_events(events, require_master)
            .recv_timeout(WAIT_TIMEOUT)?)
    }

    pub fn wait_for_state(&self, expected: &[VNodeState]) -> Result<VNodeState> {
        wait_for(|| {
            let state = self.state();
            expected.contains(&state).then_some(state)
        })
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node().get_ctrl().stop();
        self.node.take(); // drop before tmp directory is cleaned
    }
}

/// Poll `f` until it returns something
pub fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> Result<T> {
    let start = Instant::now();
    loop {
        if let Some(t) = f() {
            return Ok(t);
        }
        if WAIT_TIMEOUT < start.elapsed() {
            bail!("timed out");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
