//! ICMP echo reachability probe.
//!
//! Tries an unprivileged ICMP datagram socket first (Linux `ping_group_range`,
//! macOS) and falls back to a raw socket. The kernel rewrites the identifier
//! on datagram sockets, so replies are matched on sequence number there and
//! on both identifier and sequence for raw sockets.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use super::resolve::resolve_host;
use crate::error::ProbeError;

const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_DEST_UNREACHABLE: u8 = 3;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;
const PROBE_PAYLOAD: &[u8] = b"netplex-probe";
const RECV_BUFFER_SIZE: usize = 1500;

/// Outcome of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    pub addr: IpAddr,
    pub rtt: Duration,
}

/// Sends ICMP echo requests. Holds the identifier and sequence counter so
/// concurrent probes from one prober never share a sequence number.
pub struct Prober {
    identifier: u16,
    sequence: AtomicU16,
    timeout: Duration,
    resolve_timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration, resolve_timeout: Duration) -> Self {
        Prober {
            identifier: std::process::id() as u16,
            sequence: AtomicU16::new(0),
            timeout,
            resolve_timeout,
        }
    }

    /// Resolve `host` (IPv4 preferred) and time one echo round trip.
    pub async fn probe(&self, host: &str) -> Result<ProbeReply, ProbeError> {
        let addrs = resolve_host(host, self.resolve_timeout).await?;
        let addr = addrs
            .iter()
            .copied()
            .find(IpAddr::is_ipv4)
            .unwrap_or(addrs[0]);

        let identifier = self.identifier;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timeout = self.timeout;

        let rtt = tokio::task::spawn_blocking(move || {
            echo_round_trip(addr, identifier, sequence, timeout)
        })
        .await
        .map_err(|e| ProbeError::Io {
            addr,
            source: io::Error::other(e),
        })??;

        Ok(ProbeReply { addr, rtt })
    }
}

/// Probe `host` once.
pub async fn probe(
    host: &str,
    timeout: Duration,
    resolve_timeout: Duration,
) -> Result<ProbeReply, ProbeError> {
    Prober::new(timeout, resolve_timeout).probe(host).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Datagram,
    Raw,
}

impl SocketKind {
    /// Whether a reply or error carrying `(identifier, sequence)` belongs to
    /// the request we sent. The kernel rewrites the identifier on datagram
    /// sockets.
    fn owns(self, sent: (u16, u16), seen: (u16, u16)) -> bool {
        seen.1 == sent.1 && (self == SocketKind::Datagram || seen.0 == sent.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Echo {
        identifier: u16,
        sequence: u16,
    },
    /// Carries the identifier and sequence of the echo request that bounced.
    Unreachable {
        code: u8,
        identifier: u16,
        sequence: u16,
    },
    Other,
}

fn open_socket(addr: IpAddr) -> Result<(Socket, SocketKind), ProbeError> {
    let (domain, protocol) = match addr {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(socket) => Ok((socket, SocketKind::Datagram)),
        Err(dgram_err) => Socket::new(domain, Type::RAW, Some(protocol))
            .map(|socket| (socket, SocketKind::Raw))
            .map_err(|_| ProbeError::Unsupported {
                addr,
                source: dgram_err,
            }),
    }
}

fn echo_round_trip(
    addr: IpAddr,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let io_err = |source: io::Error| ProbeError::Io { addr, source };
    let v6 = addr.is_ipv6();

    let (mut socket, kind) = open_socket(addr)?;
    socket
        .connect(&SocketAddr::new(addr, 0).into())
        .map_err(io_err)?;

    let request = echo_request(v6, identifier, sequence, PROBE_PAYLOAD);
    let start = Instant::now();
    let deadline = start + timeout;
    socket.send(&request).map_err(io_err)?;

    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout { addr, timeout });
        }
        socket.set_read_timeout(Some(remaining)).map_err(io_err)?;

        let n = match socket.read(&mut buffer) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ProbeError::Timeout { addr, timeout });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(e)),
        };

        let ours = |id: u16, seq: u16| kind.owns((identifier, sequence), (id, seq));

        match parse_reply(&buffer[..n], v6) {
            Reply::Echo {
                identifier: id,
                sequence: seq,
            } if ours(id, seq) => return Ok(start.elapsed()),
            Reply::Unreachable {
                code,
                identifier: id,
                sequence: seq,
            } if ours(id, seq) => return Err(ProbeError::Unreachable { addr, code }),
            // Someone else's traffic, or our own request looped back
            _ => continue,
        }
    }
}

fn echo_request(v6: bool, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    packet.push(if v6 {
        ICMPV6_ECHO_REQUEST
    } else {
        ICMPV4_ECHO_REQUEST
    });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);

    // ICMPv6 checksums cover a pseudo-header and are filled in by the kernel
    if !v6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

fn parse_reply(packet: &[u8], v6: bool) -> Reply {
    // Raw IPv4 sockets (and macOS datagram ones) deliver the IP header too
    let icmp = match packet.first() {
        Some(&first) if !v6 && first >> 4 == 4 => {
            let header_len = usize::from(first & 0x0f) * 4;
            match packet.get(header_len..) {
                Some(rest) => rest,
                None => return Reply::Other,
            }
        }
        _ => packet,
    };

    if icmp.len() < ICMP_HEADER_LEN {
        return Reply::Other;
    }

    let (echo_reply, unreachable) = if v6 {
        (ICMPV6_ECHO_REPLY, ICMPV6_DEST_UNREACHABLE)
    } else {
        (ICMPV4_ECHO_REPLY, ICMPV4_DEST_UNREACHABLE)
    };

    match icmp[0] {
        t if t == echo_reply => Reply::Echo {
            identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
            sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        },
        t if t == unreachable => match bounced_echo(&icmp[ICMP_HEADER_LEN..], v6) {
            Some((identifier, sequence)) => Reply::Unreachable {
                code: icmp[1],
                identifier,
                sequence,
            },
            None => Reply::Other,
        },
        _ => Reply::Other,
    }
}

/// Identifier and sequence of the echo request quoted in an ICMP error.
///
/// The error body holds the original IP header followed by at least the
/// first 8 bytes of the original ICMP message.
fn bounced_echo(quoted: &[u8], v6: bool) -> Option<(u16, u16)> {
    let (header_len, next_protocol, echo_request) = if v6 {
        if quoted.first()? >> 4 != 6 {
            return None;
        }
        (IPV6_HEADER_LEN, *quoted.get(6)?, ICMPV6_ECHO_REQUEST)
    } else {
        let first = *quoted.first()?;
        if first >> 4 != 4 {
            return None;
        }
        (usize::from(first & 0x0f) * 4, *quoted.get(9)?, ICMPV4_ECHO_REQUEST)
    };

    let expected_protocol = if v6 { IPPROTO_ICMPV6 } else { IPPROTO_ICMP };
    let original = quoted.get(header_len..header_len + ICMP_HEADER_LEN)?;
    if next_protocol != expected_protocol || original[0] != echo_request {
        return None;
    }

    Some((
        u16::from_be_bytes([original[4], original[5]]),
        u16::from_be_bytes([original[6], original[7]]),
    ))
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => u32::from(u16::from_be_bytes([hi, 0])),
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionError;

    #[test]
    fn test_checksum_reference_vector() {
        // Example from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0x01]), 0xfeff);
    }

    #[test]
    fn test_echo_request_v4() {
        let packet = echo_request(false, 0x1234, 7, b"abc");
        assert_eq!(packet[0], ICMPV4_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x07]);
        assert_eq!(&packet[8..], b"abc");
        // A packet carrying its own checksum sums to zero
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_echo_request_v6_leaves_checksum_to_kernel() {
        let packet = echo_request(true, 1, 2, b"");
        assert_eq!(packet, vec![ICMPV6_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_parse_reply_without_ip_header() {
        let reply = [ICMPV4_ECHO_REPLY, 0, 0, 0, 0xab, 0xcd, 0x00, 0x09, b'x'];
        assert_eq!(
            parse_reply(&reply, false),
            Reply::Echo {
                identifier: 0xabcd,
                sequence: 9
            }
        );
    }

    #[test]
    fn test_parse_reply_strips_ip_header() {
        let mut packet = vec![0x45];
        packet.extend_from_slice(&[0u8; 19]);
        packet.extend_from_slice(&[ICMPV4_ECHO_REPLY, 0, 0, 0, 0, 1, 0, 2]);
        assert_eq!(
            parse_reply(&packet, false),
            Reply::Echo {
                identifier: 1,
                sequence: 2
            }
        );
    }

    #[test]
    fn test_parse_reply_v6() {
        let reply = [ICMPV6_ECHO_REPLY, 0, 0, 0, 0, 5, 0, 6];
        assert_eq!(
            parse_reply(&reply, true),
            Reply::Echo {
                identifier: 5,
                sequence: 6
            }
        );
    }

    /// ICMPv4 destination unreachable quoting an echo request.
    fn unreachable_v4(code: u8, identifier: u16, sequence: u16) -> Vec<u8> {
        let mut packet = vec![ICMPV4_DEST_UNREACHABLE, code, 0, 0, 0, 0, 0, 0];
        let mut quoted_ip = [0u8; 20];
        quoted_ip[0] = 0x45;
        quoted_ip[9] = IPPROTO_ICMP;
        packet.extend_from_slice(&quoted_ip);
        packet.extend_from_slice(&echo_request(false, identifier, sequence, b""));
        packet
    }

    #[test]
    fn test_parse_unreachable_quotes_request() {
        assert_eq!(
            parse_reply(&unreachable_v4(1, 0x1234, 7), false),
            Reply::Unreachable {
                code: 1,
                identifier: 0x1234,
                sequence: 7
            }
        );

        // Without the quoted request the error cannot be attributed
        let bare = [ICMPV4_DEST_UNREACHABLE, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_reply(&bare, false), Reply::Other);
    }

    #[test]
    fn test_parse_unreachable_v6() {
        let mut packet = vec![ICMPV6_DEST_UNREACHABLE, 3, 0, 0, 0, 0, 0, 0];
        let mut quoted_ip = [0u8; IPV6_HEADER_LEN];
        quoted_ip[0] = 0x60;
        quoted_ip[6] = IPPROTO_ICMPV6;
        packet.extend_from_slice(&quoted_ip);
        packet.extend_from_slice(&echo_request(true, 9, 10, b"data"));

        assert_eq!(
            parse_reply(&packet, true),
            Reply::Unreachable {
                code: 3,
                identifier: 9,
                sequence: 10
            }
        );
    }

    #[test]
    fn test_reply_ownership() {
        let sent = (0x1234, 7);
        assert!(SocketKind::Raw.owns(sent, (0x1234, 7)));
        assert!(!SocketKind::Raw.owns(sent, (0x9999, 7)));
        assert!(!SocketKind::Raw.owns(sent, (0x1234, 8)));
        assert!(SocketKind::Datagram.owns(sent, (0x9999, 7)));
        assert!(!SocketKind::Datagram.owns(sent, (0x1234, 8)));
    }

    #[test]
    fn test_parse_unreachable_for_other_traffic() {
        // The quoted packet is UDP, not one of our echo requests
        let mut packet = unreachable_v4(3, 1, 1);
        packet[8 + 9] = 17;
        assert_eq!(parse_reply(&packet, false), Reply::Other);
    }

    #[test]
    fn test_parse_reply_ignores_requests_and_runts() {
        let request = echo_request(false, 1, 1, b"");
        assert_eq!(parse_reply(&request, false), Reply::Other);
        assert_eq!(parse_reply(&[0, 0, 0], false), Reply::Other);
        assert_eq!(parse_reply(&[0x45, 0, 0], false), Reply::Other);
    }

    #[tokio::test]
    async fn test_probe_unresolvable_host() {
        let err = probe(
            "definitely-invalid.invalid",
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Resolve(ResolutionError::Lookup { .. } | ResolutionError::NoAddresses { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_loopback() {
        // ICMP sockets need privileges or ping_group_range; without them the
        // probe reports itself as unsupported rather than failing oddly.
        let result = probe("127.0.0.1", Duration::from_secs(2), Duration::from_secs(5)).await;
        match result {
            Ok(reply) => assert!(reply.addr.is_loopback()),
            Err(ProbeError::Unsupported { .. } | ProbeError::Timeout { .. }) => {}
            Err(other) => panic!("unexpected probe failure: {other}"),
        }
    }
}
