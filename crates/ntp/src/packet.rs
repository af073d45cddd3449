//! Fixed 48-byte NTP packet.

use crate::{NtpError, NtpTimestamp};

pub const PACKET_LEN: usize = 48;
pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Packet {
    /// Leap indicator (2 bits).
    pub leap: u8,
    /// Version number (3 bits).
    pub version: u8,
    /// Association mode (3 bits).
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: u32,
    pub reference_time: NtpTimestamp,
    pub origin_time: NtpTimestamp,
    pub received_time: NtpTimestamp,
    pub transmit_time: NtpTimestamp,
}

impl Packet {
    /// Client-mode request; only version, mode and transmit time are set.
    pub fn client(version: u8, transmit_time: NtpTimestamp) -> Result<Self, NtpError> {
        if !(2..=4).contains(&version) {
            return Err(NtpError::Version(version));
        }
        Ok(Self { version, mode: MODE_CLIENT, transmit_time, ..Default::default() })
    }

    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[0] = (self.leap & 0x03) << 6 | (self.version & 0x07) << 3 | (self.mode & 0x07);
        buf[1] = self.stratum;
        buf[2] = self.poll as u8;
        buf[3] = self.precision as u8;
        buf[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        buf[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reference_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.reference_time.to_bits().to_be_bytes());
        buf[24..32].copy_from_slice(&self.origin_time.to_bits().to_be_bytes());
        buf[32..40].copy_from_slice(&self.received_time.to_bits().to_be_bytes());
        buf[40..48].copy_from_slice(&self.transmit_time.to_bits().to_be_bytes());
        buf
    }

    /// Decode the first 48 bytes; trailing extension fields are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, NtpError> {
        if buf.len() < PACKET_LEN {
            return Err(NtpError::ShortPacket(buf.len()));
        }
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let ts_at = |i: usize| NtpTimestamp::new(u32_at(i), u32_at(i + 4));
        Ok(Self {
            leap: buf[0] >> 6,
            version: (buf[0] >> 3) & 0x07,
            mode: buf[0] & 0x07,
            stratum: buf[1],
            poll: buf[2] as i8,
            precision: buf[3] as i8,
            root_delay: u32_at(4),
            root_dispersion: u32_at(8),
            reference_id: u32_at(12),
            reference_time: ts_at(16),
            origin_time: ts_at(24),
            received_time: ts_at(32),
            transmit_time: ts_at(40),
        })
    }
}

/// Sanity checks on a server reply to `query`.
pub fn validate_response(query: &Packet, response: &Packet) -> Result<(), NtpError> {
    if response.mode & 0x07 != MODE_SERVER {
        return Err(NtpError::Mode(response.mode));
    }
    if response.origin_time != query.transmit_time {
        return Err(NtpError::OriginMismatch);
    }
    if response.received_time > response.transmit_time {
        return Err(NtpError::ServerTimeOrder);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_to(q: &Packet) -> Packet {
        Packet {
            leap: 0,
            version: 4,
            mode: MODE_SERVER,
            stratum: 2,
            poll: 6,
            precision: -20,
            root_delay: 0x0000_0100,
            root_dispersion: 0x0000_0200,
            reference_id: u32::from_be_bytes(*b"GPS\0"),
            reference_time: NtpTimestamp::new(3_900_000_000, 0),
            origin_time: q.transmit_time,
            received_time: NtpTimestamp::new(3_900_000_010, 1),
            transmit_time: NtpTimestamp::new(3_900_000_010, 2),
        }
    }

    #[test]
    fn client_packet_first_byte() {
        let p = Packet::client(4, NtpTimestamp::new(1, 2)).unwrap();
        let b = p.encode();
        assert_eq!(b[0], 0x23); // LI=0 VN=4 Mode=3
        assert_eq!(&b[40..48], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert!(b[1..40].iter().all(|&x| x == 0));
        assert_eq!(Packet::client(3, NtpTimestamp::default()).unwrap().encode()[0], 0x1b);
    }

    #[test]
    fn client_rejects_unknown_versions() {
        assert!(Packet::client(1, NtpTimestamp::default()).is_err());
        assert!(Packet::client(5, NtpTimestamp::default()).is_err());
    }

    #[test]
    fn decode_reads_every_field() {
        let q = Packet::client(4, NtpTimestamp::new(7, 9)).unwrap();
        let r = reply_to(&q);
        let decoded = Packet::decode(&r.encode()).unwrap();
        assert_eq!(decoded, r);
        assert_eq!(decoded.precision, -20);
    }

    #[test]
    fn decode_short_packet_fails() {
        assert!(matches!(Packet::decode(&[0u8; 47]), Err(NtpError::ShortPacket(47))));
    }

    #[test]
    fn validate_accepts_well_formed_reply() {
        let q = Packet::client(4, NtpTimestamp::new(7, 9)).unwrap();
        assert!(validate_response(&q, &reply_to(&q)).is_ok());
    }

    #[test]
    fn validate_rejects_bad_mode_origin_and_order() {
        let q = Packet::client(4, NtpTimestamp::new(7, 9)).unwrap();

        let mut r = reply_to(&q);
        r.mode = MODE_CLIENT;
        assert!(matches!(validate_response(&q, &r), Err(NtpError::Mode(3))));

        let mut r = reply_to(&q);
        r.origin_time = NtpTimestamp::new(7, 10);
        assert!(matches!(validate_response(&q, &r), Err(NtpError::OriginMismatch)));

        let mut r = reply_to(&q);
        r.received_time = NtpTimestamp::new(3_900_000_011, 0);
        assert!(matches!(validate_response(&q, &r), Err(NtpError::ServerTimeOrder)));
    }
}
