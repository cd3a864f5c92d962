//! Header views handed to the session layer by the packet parser
//!
//! The session layer never parses raw frames itself. Whoever captures packets decodes
//! them into these plain structs and passes them along with the raw frame bytes; the
//! coordinator only needs lengths, addresses, ports and the TCP sequence number.

use std::net::IpAddr;

/// Network-layer header of a captured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
    /// Header length in bytes, options/extensions included
    pub header_len: usize,
    pub source: IpAddr,
    pub destination: IpAddr,
}

/// TCP control bits the relay cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

/// TCP header of a captured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    /// Header length in bytes, options included
    pub header_len: usize,
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgment: u32,
    pub flags: TcpFlags,
    /// Raw (unscaled) window field
    pub window: u16,
    /// Window scale shift from the options, only present on SYN
    pub window_scale: Option<u8>,
    /// Maximum segment size from the options, only present on SYN
    pub mss: Option<u16>,
    /// TCP timestamp option (TSval, TSecr)
    pub timestamp: Option<(u32, u32)>,
}

/// UDP header of a captured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Length field: header plus payload
    pub length: usize,
    pub source_port: u16,
    pub destination_port: u16,
}

/// Size of a UDP header
pub const UDP_HEADER_LEN: usize = 8;

/// TCP payload of `frame`: everything past the IP and TCP headers
pub fn tcp_payload<'a>(ip: &IpHeader, tcp: &TcpHeader, frame: &'a [u8]) -> &'a [u8] {
    let start = ip.header_len + tcp.header_len;
    frame.get(start..).unwrap_or(&[])
}

/// UDP payload of `frame`, clamped to what was actually captured
pub fn udp_payload<'a>(ip: &IpHeader, udp: &UdpHeader, frame: &'a [u8]) -> &'a [u8] {
    let start = ip.header_len + UDP_HEADER_LEN;
    let declared = udp.length.saturating_sub(UDP_HEADER_LEN);
    let available = frame.len().saturating_sub(start);
    let len = declared.min(available);
    if len == 0 {
        return &[];
    }
    &frame[start..start + len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(header_len: usize) -> IpHeader {
        IpHeader {
            header_len,
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            destination: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        }
    }

    #[test]
    fn test_udp_payload_uses_length_field() {
        let udp = UdpHeader {
            length: 16,
            source_port: 5353,
            destination_port: 53,
        };
        let mut frame = vec![0u8; 20 + 8];
        frame.extend_from_slice(b"payload!");
        frame.extend_from_slice(b"trailing-padding");

        assert_eq!(udp_payload(&ip(20), &udp, &frame), b"payload!");
    }

    #[test]
    fn test_udp_payload_clamped_to_capture() {
        let udp = UdpHeader {
            length: 100,
            source_port: 1,
            destination_port: 2,
        };
        let mut frame = vec![0u8; 28];
        frame.extend_from_slice(b"abc");
        assert_eq!(udp_payload(&ip(20), &udp, &frame), b"abc");
    }

    #[test]
    fn test_tcp_payload_short_frame_is_empty() {
        let tcp = TcpHeader {
            header_len: 20,
            source_port: 51000,
            destination_port: 443,
            sequence: 1,
            acknowledgment: 0,
            flags: TcpFlags::default(),
            window: 0,
            window_scale: None,
            mss: None,
            timestamp: None,
        };
        assert!(tcp_payload(&ip(20), &tcp, &[0u8; 30]).is_empty());
    }
}
