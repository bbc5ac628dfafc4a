use binrw::{binrw, BinRead, BinWrite, Endian};
use std::io::{Read, Seek, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{EpochId, NodeId, VNodeState};

/// Snapshot of a cluster member, as exchanged by gossip
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub instance_id: NodeId,
    /// Milliseconds since unix epoch, when this snapshot was taken
    pub time_stamp: i64,
    pub state: VNodeState,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub is_alive: bool,

    /// Elections, gossip and replication traffic
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub internal_tcp: SocketAddr,
    #[br(parse_with = addr::parse_opt)]
    #[bw(write_with = addr::write_opt)]
    pub internal_secure_tcp: Option<SocketAddr>,
    /// Client endpoints, only used to redirect clients to the master
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub external_tcp: SocketAddr,
    #[br(parse_with = addr::parse_opt)]
    #[bw(write_with = addr::write_opt)]
    pub external_secure_tcp: Option<SocketAddr>,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub external_http: SocketAddr,

    pub last_commit_position: i64,
    pub writer_checkpoint: i64,
    pub chaser_checkpoint: i64,
    pub epoch_position: i64,
    pub epoch_number: i32,
    pub epoch_id: EpochId,
    pub node_priority: i32,
}

impl MemberInfo {
    pub fn is_master(&self) -> bool {
        self.state == VNodeState::Master
    }

    pub fn master_endpoints(&self) -> MasterEndpoints {
        MasterEndpoints {
            external_tcp: self.external_tcp,
            external_secure_tcp: self.external_secure_tcp,
            external_http: self.external_http,
        }
    }
}

/// Where clients should go when they hit a non-master node
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MasterEndpoints {
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub external_tcp: SocketAddr,
    #[br(parse_with = addr::parse_opt)]
    #[bw(write_with = addr::write_opt)]
    pub external_secure_tcp: Option<SocketAddr>,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub external_http: SocketAddr,
}

/// `SocketAddr` encoding: `[4 or 6][ip bytes][port u16]`, optional ones
/// prefixed with a presence byte
pub(crate) mod addr {
    use super::*;

    const V4: u8 = 4;
    const V6: u8 = 6;

    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: (),
    ) -> binrw::BinResult<SocketAddr> {
        let pos = reader.stream_position()?;
        let kind = u8::read_options(reader, endian, ())?;
        let ip = match kind {
            V4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::read_options(reader, endian, ())?)),
            V6 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::read_options(
                reader,
                endian,
                (),
            )?)),
            _ => {
                return Err(binrw::Error::AssertFail {
                    pos,
                    message: format!("invalid address kind: {kind}"),
                })
            }
        };
        let port = u16::read_options(reader, endian, ())?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn write<W: Write + Seek>(
        addr: &SocketAddr,
        writer: &mut W,
        endian: Endian,
        _: (),
    ) -> binrw::BinResult<()> {
        match addr.ip() {
            IpAddr::V4(ip) => {
                V4.write_options(writer, endian, ())?;
                ip.octets().write_options(writer, endian, ())?;
            }
            IpAddr::V6(ip) => {
                V6.write_options(writer, endian, ())?;
                ip.octets().write_options(writer, endian, ())?;
            }
        }
        addr.port().write_options(writer, endian, ())
    }

    pub fn parse_opt<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: (),
    ) -> binrw::BinResult<Option<SocketAddr>> {
        if u8::read_options(reader, endian, ())? == 0 {
            Ok(None)
        } else {
            parse(reader, endian, ()).map(Some)
        }
    }

    pub fn write_opt<W: Write + Seek>(
        addr: &Option<SocketAddr>,
        writer: &mut W,
        endian: Endian,
        _: (),
    ) -> binrw::BinResult<()> {
        match addr {
            Some(addr) => {
                1u8.write_options(writer, endian, ())?;
                write(addr, writer, endian, ())
            }
            None => 0u8.write_options(writer, endian, ()),
        }
    }
}
