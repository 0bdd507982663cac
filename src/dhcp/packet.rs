//! BOOTP fixed header and TLV option codec (RFC 2131/2132 subset).

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Byte offset of the options field in a BOOTP message (fixed header plus
/// magic cookie).
pub const OPTIONS_OFFSET: usize = 240;

/// Option 53 message types this server deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 5,
}

/// 6-byte client hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(())?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| ())?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        Ok(MacAddr(octets))
    }
}

/// The fields this server reads out of an inbound BOOTP header.
#[derive(Debug, Clone)]
pub struct BootpRequest {
    pub xid: [u8; 4],
    pub flags: [u8; 2],
    pub yiaddr: [u8; 4],
    pub giaddr: [u8; 4],
    pub chaddr: [u8; 16],
}

impl BootpRequest {
    /// Unpack the 44 relevant header bytes. `None` on a runt message.
    pub fn parse(message: &[u8]) -> Option<Self> {
        if message.len() < 44 {
            return None;
        }
        let mut request = BootpRequest {
            xid: [0; 4],
            flags: [0; 2],
            yiaddr: [0; 4],
            giaddr: [0; 4],
            chaddr: [0; 16],
        };
        request.xid.copy_from_slice(&message[4..8]);
        request.flags.copy_from_slice(&message[10..12]);
        request.yiaddr.copy_from_slice(&message[16..20]);
        request.giaddr.copy_from_slice(&message[24..28]);
        request.chaddr.copy_from_slice(&message[28..44]);
        Some(request)
    }

    pub fn client_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        MacAddr(mac)
    }
}

/// Build the reply header: BOOTREPLY over Ethernet, xid and chaddr echoed,
/// the offered address in `yiaddr`, this server in `siaddr`, legacy sname
/// and file fields zeroed, magic cookie last. Options are appended by the
/// caller.
pub fn build_reply(request: &BootpRequest, offer: Ipv4Addr, server_ip: Ipv4Addr) -> BytesMut {
    let mut buf = BytesMut::with_capacity(300);
    buf.put_u8(2); // op
    buf.put_u8(1); // htype
    buf.put_u8(6); // hlen
    buf.put_u8(0); // hops
    buf.put_slice(&request.xid);
    buf.put_u16(0); // secs
    buf.put_u16(0); // flags
    buf.put_u32(0); // ciaddr
    buf.put_slice(&offer.octets());
    buf.put_slice(&server_ip.octets());
    buf.put_u32(0); // giaddr
    buf.put_slice(&request.chaddr);
    buf.put_bytes(0, 64); // sname
    buf.put_bytes(0, 128); // file
    buf.put_slice(&MAGIC_COOKIE);
    buf
}

pub fn tlv_encode(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

/// Walk a TLV option block: tag 0 is one byte of padding, tag 255 ends the
/// block, repeated tags accumulate into a list. Truncated values are
/// clamped to what is actually there.
pub fn tlv_parse(raw: &[u8]) -> HashMap<u8, Vec<Vec<u8>>> {
    let mut options: HashMap<u8, Vec<Vec<u8>>> = HashMap::new();
    let mut pos = 0;
    while pos < raw.len() {
        let tag = raw[pos];
        if tag == 0 {
            pos += 1;
            continue;
        }
        if tag == 255 {
            break;
        }
        if pos + 1 >= raw.len() {
            break;
        }
        let len = raw[pos + 1] as usize;
        let end = (pos + 2 + len).min(raw.len());
        options
            .entry(tag)
            .or_default()
            .push(raw[pos + 2..end].to_vec());
        pos += 2 + len;
    }
    options
}
