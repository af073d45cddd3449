//! kdelegate NTP: a small SNTP client (RFC 4330 wire format) that computes
//! the offset between local time and a set of NTP peers.

#![forbid(unsafe_code)]

mod client;
mod packet;
mod timestamp;

pub use client::{average_offsets, compute_offset, NtpClient, NtpConfig, NtpResponse};
pub use packet::{validate_response, Packet, MODE_CLIENT, MODE_SERVER, PACKET_LEN};
pub use timestamp::{NtpTimestamp, NTP_UNIX_EPOCH_DELTA};

#[derive(Debug, thiserror::Error)]
pub enum NtpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("resolve {0}: no address")]
    Resolve(String),
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),
    #[error("short packet: {0} bytes")]
    ShortPacket(usize),
    #[error("unsupported version {0} (expect 2..=4)")]
    Version(u8),
    #[error("unexpected mode {0} (expect server)")]
    Mode(u8),
    #[error("origin timestamp does not echo our transmit timestamp")]
    OriginMismatch,
    #[error("server receive time is after its transmit time")]
    ServerTimeOrder,
    #[error("timestamp out of range")]
    OutOfRange,
    #[error("no usable NTP host: {0}")]
    NoUsableHost(String),
}
