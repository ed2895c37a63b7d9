use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// Tuning parameters for a transport endpoint. The defaults are meant for a classroom
///  sized session (tens of participants) on consumer networks; [`Self::validate`] catches
///  combinations that cannot work.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// the address a server binds to, or the server address a client connects to
    pub peer_addr: SocketAddr,
    /// human readable name announced in the handshake
    pub endpoint_name: String,

    /// biggest payload per chunk; messages above this are split
    pub max_chunk_payload: usize,
    /// global cap on concurrently executing sends across all recipients
    pub max_concurrent_sends: usize,
    /// per-slide backlog length at which stale real-time chunks for the *current* slide
    ///  start being shed
    pub realtime_drop_threshold: usize,
    /// number of sent chunks kept per recipient for replay after a reconnect
    pub reconnect_buffer_capacity: usize,

    /// cadence of the server's housekeeping pass
    pub maintenance_interval: Duration,
    /// a heartbeat goes to every connected recipient once per this many maintenance ticks
    pub heartbeat_every_n_ticks: u64,
    /// how long a disconnected participant's queue and reconnect buffer are retained
    pub disconnect_removal_timeout: Duration,
    /// how long a forced close waits for in-flight sends on the old socket
    pub forced_close_drain_timeout: Duration,

    /// budget for the peer's handshake after the TCP connect
    pub handshake_timeout: Duration,
    /// pause between a client's connection attempts
    pub connect_retry_interval: Duration,
    /// a client treats the connection as dead when nothing (heartbeats included) arrives
    ///  for this long; doubled on slow links, see `link_speed_bps`
    pub base_receive_timeout: Duration,
    /// measured or configured link speed, if known. Below 11 MBit/s the receive timeout
    ///  is doubled to avoid spurious reconnects on congested uplinks.
    pub link_speed_bps: Option<u64>,
}

impl TransportConfig {
    pub fn new(peer_addr: SocketAddr, endpoint_name: impl Into<String>) -> TransportConfig {
        TransportConfig {
            peer_addr,
            endpoint_name: endpoint_name.into(),
            max_chunk_payload: 16 * 1024,
            max_concurrent_sends: 50,
            realtime_drop_threshold: 3,
            reconnect_buffer_capacity: 100,
            maintenance_interval: Duration::from_secs(1),
            heartbeat_every_n_ticks: 5,
            disconnect_removal_timeout: Duration::from_secs(600),
            forced_close_drain_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_secs(1),
            base_receive_timeout: Duration::from_secs(15),
            link_speed_bps: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_payload == 0 {
            bail!("max_chunk_payload must be > 0");
        }
        if self.max_chunk_payload > u32::MAX as usize {
            bail!("max_chunk_payload does not fit the wire format's u32 length field");
        }
        if self.max_concurrent_sends == 0 {
            bail!("max_concurrent_sends must be > 0");
        }
        if self.reconnect_buffer_capacity == 0 {
            bail!("reconnect_buffer_capacity must be > 0");
        }
        if self.heartbeat_every_n_ticks == 0 {
            bail!("heartbeat_every_n_ticks must be > 0");
        }
        if self.maintenance_interval.is_zero() {
            bail!("maintenance_interval must be > 0");
        }
        if self.endpoint_name.len() > crate::handshake::MAX_NAME_LEN {
            bail!(
                "endpoint_name exceeds the handshake limit of {} bytes",
                crate::handshake::MAX_NAME_LEN
            );
        }
        let heartbeat_interval = self.maintenance_interval * self.heartbeat_every_n_ticks as u32;
        if self.base_receive_timeout <= heartbeat_interval {
            bail!(
                "base_receive_timeout ({:?}) must exceed the heartbeat interval ({:?})",
                self.base_receive_timeout,
                heartbeat_interval
            );
        }
        Ok(())
    }
}
