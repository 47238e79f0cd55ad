use bytes::{BufMut, BytesMut};

use std::net::{IpAddr, SocketAddr};

use crate::{Error, MAGIC_COOKIE};

pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_IPV6: u8 = 0x02;

/// Transport address codec shared by every address-valued attribute.
///
/// The wire layout is one reserved byte, a family byte (0x01 for
/// ipv4, 0x02 for ipv6), the 16-bit port and the raw address octets:
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |           Port                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   Address (32 or 128 bits)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// MAPPED-ADDRESS writes the address verbatim.  The XOR variants
/// (XOR-MAPPED-ADDRESS, XOR-PEER-ADDRESS, XOR-RELAYED-ADDRESS) mask
/// the port with the top half of the magic cookie and the address
/// with the cookie itself (ipv4) or the cookie followed by the 96-bit
/// transaction id (ipv6).  NATs that rewrite anything that looks like
/// one of their own addresses in a payload cannot recognise the
/// masked form, which is the whole reason the XOR encoding exists;
/// the agent always prefers it and keeps MAPPED-ADDRESS only for
/// rfc3489-era interop.
pub struct Addr;

impl Addr {
    /// Write a transport address in wire layout, masked when `is_xor`
    /// is set.
    ///
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::attribute::address::Addr;
    /// use bytes::BytesMut;
    ///
    /// let token: [u8; 12] = [
    ///     0x9a, 0x27, 0x44, 0x5c, 0x03, 0xe8, 0x71, 0xbd, 0x2f, 0x68, 0x90, 0x1e,
    /// ];
    ///
    /// let source = "172.16.254.9:61234".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::with_capacity(32);
    /// Addr::encode(&source, &token, &mut buffer, false);
    /// assert_eq!(&buffer[..], &[0x00, 0x01, 0xef, 0x32, 0xac, 0x10, 0xfe, 0x09]);
    ///
    /// let mut buffer = BytesMut::with_capacity(32);
    /// Addr::encode(&source, &token, &mut buffer, true);
    /// assert_eq!(&buffer[..], &[0x00, 0x01, 0xce, 0x20, 0x8d, 0x02, 0x5a, 0x4b]);
    /// ```
    pub fn encode(a: &SocketAddr, token: &[u8], buf: &mut BytesMut, is_xor: bool) {
        let addr = if is_xor { xor(a, token) } else { *a };

        buf.put_u8(0);
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(FAMILY_IPV4);
                buf.put_u16(addr.port());
                buf.put(&ip.octets()[..]);
            }
            IpAddr::V6(ip) => {
                buf.put_u8(FAMILY_IPV6);
                buf.put_u16(addr.port());
                buf.put(&ip.octets()[..]);
            }
        }
    }

    /// Read a transport address back out of wire layout.
    ///
    /// # Test
    ///
    /// ```
    /// use ice_agent_codec::attribute::address::Addr;
    ///
    /// let token: [u8; 12] = [
    ///     0x9a, 0x27, 0x44, 0x5c, 0x03, 0xe8, 0x71, 0xbd, 0x2f, 0x68, 0x90, 0x1e,
    /// ];
    ///
    /// let masked = [0x00u8, 0x01, 0xce, 0x20, 0x8d, 0x02, 0x5a, 0x4b];
    /// let addr = Addr::decode(&masked, &token, true).unwrap();
    /// assert_eq!(addr, "172.16.254.9:61234".parse().unwrap());
    ///
    /// let plain = [0x00u8, 0x01, 0xef, 0x32, 0xac, 0x10, 0xfe, 0x09];
    /// let addr = Addr::decode(&plain, &token, false).unwrap();
    /// assert_eq!(addr, "172.16.254.9:61234".parse().unwrap());
    /// ```
    pub fn decode(packet: &[u8], token: &[u8], is_xor: bool) -> Result<SocketAddr, Error> {
        if packet.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let port = u16::from_be_bytes([packet[2], packet[3]]);
        let ip: IpAddr = match (packet[1], packet.len()) {
            (FAMILY_IPV4, 8..) => {
                let octets: [u8; 4] = packet[4..8].try_into()?;
                octets.into()
            }
            (FAMILY_IPV6, 20..) => {
                let octets: [u8; 16] = packet[4..20].try_into()?;
                octets.into()
            }
            _ => return Err(Error::InvalidInput),
        };

        let addr = SocketAddr::new(ip, port);
        Ok(if is_xor { xor(&addr, token) } else { addr })
    }
}

/// Mask (or unmask, the operation is an involution) a transport
/// address with the magic cookie and the transaction id.
///
/// # Test
///
/// ```
/// use ice_agent_codec::attribute::address::xor;
/// use std::net::SocketAddr;
///
/// let token: [u8; 12] = [
///     0x9a, 0x27, 0x44, 0x5c, 0x03, 0xe8, 0x71, 0xbd, 0x2f, 0x68, 0x90, 0x1e,
/// ];
///
/// let source: SocketAddr = "172.16.254.9:61234".parse().unwrap();
/// let masked: SocketAddr = "141.2.90.75:52768".parse().unwrap();
///
/// assert_eq!(xor(&source, &token), masked);
/// assert_eq!(xor(&masked, &token), source);
///
/// let source: SocketAddr = "[2001:db8::9:1]:61234".parse().unwrap();
/// let masked: SocketAddr =
///     "[113:a9fa:9a27:445c:3e8:71bd:2f61:901f]:52768".parse().unwrap();
///
/// assert_eq!(xor(&source, &token), masked);
/// assert_eq!(xor(&masked, &token), source);
/// ```
pub fn xor(addr: &SocketAddr, token: &[u8]) -> SocketAddr {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    let ip: IpAddr = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (octet, mask) in octets.iter_mut().zip(cookie) {
                *octet ^= mask;
            }

            octets.into()
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            for (octet, mask) in octets.iter_mut().zip(cookie.iter().chain(token)) {
                *octet ^= mask;
            }

            octets.into()
        }
    };

    SocketAddr::new(ip, port)
}
