use clap::Parser;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use std::{net::SocketAddr, path::PathBuf};

use evstored::Parameters;

#[derive(Parser, Debug, Clone)]
#[command(about, version)]
pub struct Opts {
    #[clap(long = "data-dir", env = "EVSTORED_DATA_DIR", default_value = "/var/lib/evstored")]
    pub data_dir: PathBuf,

    /// Address elections, gossip and replication listen on
    #[clap(long = "int-ip-port", env = "EVSTORED_INT_IP_PORT", default_value = "127.0.0.1:1112")]
    pub internal_bind: SocketAddr,

    /// Internal address other nodes should use to reach this one
    #[clap(long = "int-advertise", env = "EVSTORED_INT_ADVERTISE")]
    pub internal_advertise: Option<SocketAddr>,

    #[clap(long = "ext-tcp-advertise", env = "EVSTORED_EXT_TCP_ADVERTISE")]
    pub external_tcp: Option<SocketAddr>,

    #[clap(long = "ext-http-advertise", env = "EVSTORED_EXT_HTTP_ADVERTISE")]
    pub external_http: Option<SocketAddr>,

    #[clap(long = "cluster-size", env = "EVSTORED_CLUSTER_SIZE", default_value_t = Parameters::DEFAULT_CLUSTER_SIZE)]
    pub cluster_size: usize,

    #[clap(long = "node-priority", env = "EVSTORED_NODE_PRIORITY", default_value_t = Parameters::DEFAULT_NODE_PRIORITY)]
    pub node_priority: i32,

    /// Internal address of another node, can be repeated
    #[clap(long = "gossip-seed", env = "EVSTORED_GOSSIP_SEED", value_delimiter = ',')]
    pub gossip_seeds: Vec<SocketAddr>,

    #[clap(long = "chunk-size", value_parser = parse_byte_unit)]
    pub chunk_size: Option<u32>,

    #[clap(long = "gossip-interval-ms", value_parser = parse_millis)]
    pub gossip_interval: Option<Duration>,

    #[clap(long = "gossip-timeout-ms", value_parser = parse_millis)]
    pub gossip_timeout: Option<Duration>,

    #[clap(long = "prepare-timeout-ms", value_parser = parse_millis)]
    pub prepare_timeout: Option<Duration>,

    #[clap(long = "commit-timeout-ms", value_parser = parse_millis)]
    pub commit_timeout: Option<Duration>,

    /// Skip hash verification of completed chunks on startup
    #[clap(long = "skip-db-verify")]
    pub skip_db_verify: bool,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    pub fn to_params(&self) -> Parameters {
        Parameters::builder()
            .data_dir(self.data_dir.clone())
            .internal_bind(self.internal_bind)
            .cluster_size(self.cluster_size)
            .node_priority(self.node_priority)
            .gossip_seeds(self.gossip_seeds.clone())
            .chunk_size(self.chunk_size.unwrap_or(Parameters::DEFAULT_CHUNK_SIZE))
            .gossip_interval(
                self.gossip_interval
                    .unwrap_or(Parameters::DEFAULT_GOSSIP_INTERVAL),
            )
            .gossip_timeout(
                self.gossip_timeout
                    .unwrap_or(Parameters::DEFAULT_GOSSIP_TIMEOUT),
            )
            .prepare_timeout(
                self.prepare_timeout
                    .unwrap_or(Parameters::DEFAULT_PREPARE_TIMEOUT),
            )
            .commit_timeout(
                self.commit_timeout
                    .unwrap_or(Parameters::DEFAULT_COMMIT_TIMEOUT),
            )
            .verify_hashes(!self.skip_db_verify)
            .internal_advertise(self.internal_advertise)
            .external_tcp(self.external_tcp)
            .external_http(self.external_http)
            .build()
    }
}

fn parse_millis(s: &str) -> std::result::Result<Duration, ParseIntError> {
    Ok(Duration::from_millis(u64::from_str(s.trim())?))
}

fn parse_byte_unit(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim().to_lowercase();

    let (num, mul) = if let Some(num) = s.strip_suffix('k') {
        (num, 1024)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    u32::from_str(num)
        .map_err(|e| e.to_string())?
        .checked_mul(mul)
        .ok_or_else(|| format!("{s} does not fit in 4GiB"))
}

#[test]
fn parse_byte_unit_test() {
    assert_eq!(parse_byte_unit("0"), Ok(0));
    assert_eq!(parse_byte_unit("0000"), Ok(0));
    assert_eq!(parse_byte_unit("1"), Ok(1));
    assert_eq!(parse_byte_unit("2000"), Ok(2000));
    assert_eq!(parse_byte_unit("1k"), Ok(1024));
    assert_eq!(parse_byte_unit("12k"), Ok(12 * 1024));
    assert_eq!(parse_byte_unit("256M"), Ok(256 * 1024 * 1024));
    assert!(parse_byte_unit("m").is_err());
    assert!(parse_byte_unit("1g").is_err());
    assert!(parse_byte_unit("4096m").is_err());
}

#[test]
fn advertised_addresses_are_optional() {
    let opts = Opts::parse_from([
        "evstored",
        "--data-dir",
        "/tmp/evstored-test",
        "--int-ip-port",
        "127.0.0.1:2112",
        "--gossip-seed",
        "127.0.0.1:2113,127.0.0.1:2114",
        "--cluster-size",
        "3",
    ]);
    let params = opts.to_params();

    assert_eq!(params.cluster_size, 3);
    assert_eq!(params.gossip_seeds.len(), 2);
    assert_eq!(params.internal_advertise, None);
    assert_eq!(params.chunk_size, Parameters::DEFAULT_CHUNK_SIZE);
    assert!(params.verify_hashes);
}
