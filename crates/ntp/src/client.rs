//! SNTP client: query each configured host over UDP and average the clock
//! offsets of the hosts that answered.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{NtpError, NtpTimestamp, Packet, PACKET_LEN};

#[derive(Debug, Clone)]
pub struct NtpConfig {
    /// `host` or `host:port`; bare hosts use `port`.
    pub hosts: Vec<String>,
    pub port: u16,
    /// Protocol version sent in requests (2..=4).
    pub version: u8,
    pub timeout: Duration,
    pub local_bind_addr: Option<SocketAddr>,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["pool.ntp.org".to_string()],
            port: 123,
            version: 4,
            timeout: Duration::from_secs(5),
            local_bind_addr: None,
        }
    }
}

/// One completed exchange with a peer.
#[derive(Debug, Clone)]
pub struct NtpResponse {
    pub host: String,
    pub query: Packet,
    pub packet: Packet,
    /// Local send instant.
    pub t1: DateTime<Utc>,
    /// Local receive instant.
    pub t4: DateTime<Utc>,
    pub offset: chrono::Duration,
}

/// Offset from the four exchange instants: `(t2 - t1) + (t3 - t4)`.
///
/// Not halved like the textbook SNTP offset: a skewed clock is corrected by
/// twice its skew.
pub fn compute_offset(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    t3: DateTime<Utc>,
    t4: DateTime<Utc>,
) -> chrono::Duration {
    (t2 - t1) + (t3 - t4)
}

/// Arithmetic mean; `None` for an empty slice.
pub fn average_offsets(offsets: &[chrono::Duration]) -> Option<chrono::Duration> {
    if offsets.is_empty() {
        return None;
    }
    let total: i128 = offsets
        .iter()
        .map(|d| d.num_nanoseconds().map(i128::from).unwrap_or_else(|| i128::from(d.num_milliseconds()) * 1_000_000))
        .sum();
    let mean = total / offsets.len() as i128;
    Some(chrono::Duration::nanoseconds(mean.clamp(i64::MIN as i128, i64::MAX as i128) as i64))
}

/// `ip:port`, `[v6]:port` or a bare IP (v6 included) using `port`.
fn literal_addr(host: &str, port: u16) -> Option<SocketAddr> {
    host.parse::<SocketAddr>().ok().or_else(|| host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port)))
}

pub struct NtpClient {
    config: NtpConfig,
}

impl NtpClient {
    pub fn new(config: NtpConfig) -> Self { Self { config } }

    pub fn config(&self) -> &NtpConfig { &self.config }

    /// Query every configured host and average the offsets that came back.
    /// Fails only when no host produced an offset.
    pub async fn get_offset(&self) -> Result<chrono::Duration, NtpError> {
        let results = futures::future::join_all(self.config.hosts.iter().map(|h| self.query(h))).await;
        let mut offsets = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (host, res) in self.config.hosts.iter().zip(results) {
            match res {
                Ok(r) => offsets.push(r.offset),
                Err(e) => {
                    warn!(host = %host, error = %e, "ntp query failed");
                    errors.push(format!("{}: {}", host, e));
                }
            }
        }
        match average_offsets(&offsets) {
            Some(offset) => {
                info!(offset_ms = offset.num_milliseconds(), hosts = offsets.len(), failed = errors.len(), "ntp offset computed");
                Ok(offset)
            }
            None if errors.is_empty() => Err(NtpError::NoUsableHost("no hosts configured".into())),
            None => Err(NtpError::NoUsableHost(errors.join("; "))),
        }
    }

    /// Single request/response exchange with one host.
    pub async fn query(&self, host: &str) -> Result<NtpResponse, NtpError> {
        let started = Instant::now();
        let res = self.exchange(host).await;
        histogram!("ntp_query_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("ntp_query_error_total", 1u64);
        }
        res
    }

    async fn exchange(&self, host: &str) -> Result<NtpResponse, NtpError> {
        let server = self.resolve(host).await?;
        let socket = self.bind_for(server).await?;

        // random transmit timestamp: the server echoes it, nothing is leaked about our clock
        let query = Packet::client(self.config.version, NtpTimestamp::from_bits(rand::rngs::OsRng.next_u64()))?;
        let t1 = Utc::now();
        socket.send_to(&query.encode(), server).await?;

        let mut buf = [0u8; 512];
        let len = timeout(self.config.timeout, async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from == server {
                    return Ok::<usize, std::io::Error>(len);
                }
                debug!(host = %host, from = %from, "ignoring datagram from unexpected peer");
            }
        })
        .await
        .map_err(|_| NtpError::Timeout(self.config.timeout, host.to_string()))??;
        let t4 = Utc::now();

        let packet = Packet::decode(&buf[..len.min(buf.len())])?;
        let t2 = packet.received_time.to_datetime()?;
        let t3 = packet.transmit_time.to_datetime()?;
        let offset = compute_offset(t1, t2, t3, t4);
        debug!(host = %host, stratum = packet.stratum, offset_ms = offset.num_milliseconds(), "ntp exchange done");
        Ok(NtpResponse { host: host.to_string(), query, packet, t1, t4, offset })
    }

    async fn resolve(&self, host: &str) -> Result<SocketAddr, NtpError> {
        if let Some(addr) = literal_addr(host, self.config.port) {
            return Ok(addr);
        }
        let target = if host.rsplit_once(':').map(|(_, p)| p.parse::<u16>().is_ok()).unwrap_or(false) {
            host.to_string()
        } else {
            format!("{}:{}", host, self.config.port)
        };
        tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| NtpError::Resolve(host.to_string()))
    }

    async fn bind_for(&self, server: SocketAddr) -> Result<UdpSocket, NtpError> {
        let bind_addr = match self.config.local_bind_addr {
            Some(a) => a,
            None if server.is_ipv6() => SocketAddr::from(([0u16; 8], 0)),
            None => SocketAddr::from(([0u8; 4], 0)),
        };
        Ok(UdpSocket::bind(bind_addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{validate_response, MODE_SERVER};

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> { DateTime::from_timestamp(secs, nanos).unwrap() }

    #[test]
    fn offset_is_zero_for_a_symmetric_instantaneous_exchange() {
        let t = at(1_760_000_000, 250);
        assert_eq!(compute_offset(t, t, t, t), chrono::Duration::zero());
    }

    #[test]
    fn offset_formula_is_not_halved() {
        // server is 10s ahead, zero network delay
        let t1 = at(1_000, 0);
        let t2 = at(1_010, 0);
        let t3 = at(1_010, 0);
        let t4 = at(1_000, 0);
        assert_eq!(compute_offset(t1, t2, t3, t4), chrono::Duration::seconds(20));
    }

    #[test]
    fn ip_literals_skip_dns() {
        assert_eq!(literal_addr("::1", 123), Some("[::1]:123".parse().unwrap()));
        assert_eq!(literal_addr("[::1]:1123", 123), Some("[::1]:1123".parse().unwrap()));
        assert_eq!(literal_addr("127.0.0.1", 123), Some("127.0.0.1:123".parse().unwrap()));
        assert_eq!(literal_addr("10.0.0.1:9", 123), Some("10.0.0.1:9".parse().unwrap()));
        assert_eq!(literal_addr("pool.ntp.org", 123), None);
    }

    #[test]
    fn offsets_average_to_mean() {
        let v: Vec<_> = [1, 2, 3, 4, 5].iter().map(|s| chrono::Duration::seconds(*s)).collect();
        assert_eq!(average_offsets(&v), Some(chrono::Duration::seconds(3)));
        assert_eq!(average_offsets(&[]), None);
        let mixed = [chrono::Duration::milliseconds(-4), chrono::Duration::milliseconds(2)];
        assert_eq!(average_offsets(&mixed), Some(chrono::Duration::milliseconds(-1)));
    }

    async fn spawn_responder() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = sock.recv_from(&mut buf).await {
                let q = Packet::decode(&buf[..len]).unwrap();
                let now = NtpTimestamp::from_datetime(Utc::now()).unwrap();
                let reply = Packet {
                    version: q.version,
                    mode: MODE_SERVER,
                    stratum: 1,
                    origin_time: q.transmit_time,
                    received_time: now,
                    transmit_time: now,
                    ..Default::default()
                };
                let _ = sock.send_to(&reply.encode(), from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn loopback_exchange_yields_small_offset() {
        let addr = spawn_responder().await;
        let client = NtpClient::new(NtpConfig { hosts: vec![addr.to_string()], ..Default::default() });
        let resp = client.query(&addr.to_string()).await.unwrap();
        assert!(validate_response(&resp.query, &resp.packet).is_ok());
        assert!(resp.offset.num_milliseconds().abs() < 1_000, "offset {:?}", resp.offset);
        assert!(resp.t4 >= resp.t1);
    }

    #[tokio::test]
    async fn get_offset_degrades_when_some_hosts_fail() {
        let good = spawn_responder().await;
        // bound but silent peer: times out
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cfg = NtpConfig {
            hosts: vec![good.to_string(), silent.local_addr().unwrap().to_string()],
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let offset = NtpClient::new(cfg).get_offset().await.unwrap();
        assert!(offset.num_milliseconds().abs() < 1_000);
    }

    #[tokio::test]
    async fn get_offset_fails_when_every_host_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cfg = NtpConfig {
            hosts: vec![silent.local_addr().unwrap().to_string()],
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let err = NtpClient::new(cfg).get_offset().await.unwrap_err();
        assert!(matches!(err, NtpError::NoUsableHost(_)));
    }
}
