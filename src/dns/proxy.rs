//! Per-packet DNS decision pipeline.
//!
//! Every packet read from the virtual interface goes through
//! [`DnsPacketProxy::handle_dns_request`]: allowed queries are forwarded to
//! their real upstream server, blocked ones are answered locally with a
//! short-lived negative response. Replies from upstream come back through
//! [`DnsPacketProxy::handle_dns_response`].
//!
//! The proxy performs no I/O itself; it drives an [`EventLoop`] that owns
//! the sockets and the interface.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record};
use tracing::{debug, warn};

use super::blocker::RuleMatcher;
use crate::blocklog::BlockLogger;
use crate::error::{NetworkError, Result};
use crate::metrics as counters;
use crate::network::{self, PacketInfo};
use crate::tunnel::UpstreamTable;

/// TTL of the negative-caching record attached to blocked replies.
///
/// Kept short so that unblocking a name takes effect almost immediately on
/// the client's resolver cache.
pub const NEGATIVE_CACHE_TTL: u32 = 5;

/// Owner of the negative-caching record. Lives under `.invalid` so it can
/// never resolve.
const NEGATIVE_CACHE_NAME: &str = "dnsveil.dnsveil.invalid.";

/// I/O primitives the proxy needs from the packet pump.
pub trait EventLoop {
    /// Send `payload` to `destination` from a fresh upstream socket.
    ///
    /// With `request` set, the socket is kept until the reply arrives and
    /// the reply is matched back to this original packet. Without it the
    /// socket is closed right after sending.
    fn forward_packet(
        &mut self,
        destination: SocketAddr,
        payload: &[u8],
        request: Option<&[u8]>,
    ) -> Result<()>;

    /// Queue a packet to be written to the virtual interface.
    fn queue_device_write(&mut self, packet: Vec<u8>);
}

/// Why a packet was dropped without any reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not an IPv4/IPv6 UDP packet.
    NotUdp,
    /// Destination alias does not map to a configured upstream.
    UnknownUpstream,
    /// UDP payload is not a DNS message.
    NotDns,
    /// DNS message without a question.
    NoQuestion,
    /// Forwarding or reply construction failed.
    Failed,
}

impl DropReason {
    const fn as_label(self) -> &'static str {
        match self {
            Self::NotUdp => "not_udp",
            Self::UnknownUpstream => "unknown_upstream",
            Self::NotDns => "not_dns",
            Self::NoQuestion => "no_question",
            Self::Failed => "failed",
        }
    }
}

/// What [`DnsPacketProxy::handle_dns_request`] did with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Dropped(DropReason),
    /// Empty datagram passed through without a blocking decision.
    ForwardedEmpty(SocketAddr),
    Forwarded { name: String, upstream: SocketAddr },
    Blocked { name: String },
}

/// DNS packet proxy for one configuration epoch.
pub struct DnsPacketProxy {
    matcher: Arc<dyn RuleMatcher>,
    upstreams: UpstreamTable,
    block_log: Option<BlockLogger>,
    negative_cache_record: Record,
}

impl DnsPacketProxy {
    /// Create a proxy forwarding through `upstreams`.
    ///
    /// Decisions are recorded in `block_log` when one is given.
    pub fn new(
        matcher: Arc<dyn RuleMatcher>,
        upstreams: UpstreamTable,
        block_log: Option<BlockLogger>,
    ) -> Self {
        Self {
            matcher,
            upstreams,
            block_log,
            negative_cache_record: negative_cache_record(),
        }
    }

    pub fn upstreams(&self) -> &UpstreamTable {
        &self.upstreams
    }

    /// Handle one packet read from the virtual interface.
    ///
    /// Never fails: malformed input is dropped silently and I/O failures are
    /// logged, so the caller can keep pumping.
    pub fn handle_dns_request<E: EventLoop>(
        &self,
        packet: &[u8],
        event_loop: &mut E,
    ) -> RequestOutcome {
        let outcome = self.process_request(packet, event_loop);
        match &outcome {
            RequestOutcome::Dropped(reason) => {
                metrics::counter!(counters::DROPPED_PACKETS, "reason" => reason.as_label())
                    .increment(1);
            }
            RequestOutcome::Forwarded { .. } => {
                metrics::counter!(counters::QUERIES, "verdict" => "allowed").increment(1);
            }
            RequestOutcome::Blocked { .. } => {
                metrics::counter!(counters::QUERIES, "verdict" => "blocked").increment(1);
            }
            RequestOutcome::ForwardedEmpty(_) => {}
        }
        outcome
    }

    fn process_request<E: EventLoop>(&self, packet: &[u8], event_loop: &mut E) -> RequestOutcome {
        let Some((info, payload)) = network::parse_udp(packet) else {
            debug!("Dropping non-UDP packet of {} bytes", packet.len());
            return RequestOutcome::Dropped(DropReason::NotUdp);
        };

        let Some(upstream_ip) = self.upstreams.translate(info.dest_ip) else {
            debug!("Dropping packet to unknown upstream alias {}", info.dest_ip);
            return RequestOutcome::Dropped(DropReason::UnknownUpstream);
        };
        let upstream = SocketAddr::new(upstream_ip, info.dest_port);

        // Some clients send empty datagrams; pass them through untouched.
        if payload.is_empty() {
            if let Err(err) = event_loop.forward_packet(upstream, &[], None) {
                warn!("Failed to forward empty datagram to {upstream}: {err}");
                return RequestOutcome::Dropped(DropReason::Failed);
            }
            return RequestOutcome::ForwardedEmpty(upstream);
        }

        let mut message = match Message::from_vec(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!("Dropping undecodable DNS payload: {err}");
                return RequestOutcome::Dropped(DropReason::NotDns);
            }
        };

        let Some(question) = message.queries().first() else {
            debug!("Dropping DNS message without question");
            return RequestOutcome::Dropped(DropReason::NoQuestion);
        };
        let name = query_name(question.name());

        if !self.matcher.is_blocked(&name) {
            debug!("Allowed {name}, forwarding to {upstream}");
            self.log(&name, true);
            if let Err(err) = event_loop.forward_packet(upstream, &payload, Some(packet)) {
                warn!("Failed to forward query for {name}: {err}");
                return RequestOutcome::Dropped(DropReason::Failed);
            }
            return RequestOutcome::Forwarded { name, upstream };
        }

        debug!("Blocked {name}");
        self.log(&name, false);
        self.make_negative_response(&mut message);

        let reply = message
            .to_vec()
            .map_err(crate::error::Error::from)
            .and_then(|bytes| network::build_reply(&info, &bytes));
        match reply {
            Ok(reply) => {
                event_loop.queue_device_write(reply);
                RequestOutcome::Blocked { name }
            }
            Err(err) => {
                warn!("Failed to build blocked reply for {name}: {err}");
                RequestOutcome::Dropped(DropReason::Failed)
            }
        }
    }

    /// Handle a reply read from an upstream socket.
    ///
    /// `request` is the original packet registered with
    /// [`EventLoop::forward_packet`]; the reply is addressed back to its sender.
    pub fn handle_dns_response<E: EventLoop>(
        &self,
        request: &[u8],
        response: &[u8],
        event_loop: &mut E,
    ) -> Result<()> {
        let (info, _) = network::parse_udp(request).ok_or(NetworkError::MalformedRequest)?;
        let reply = network::build_reply(&info, response)?;
        event_loop.queue_device_write(reply);
        Ok(())
    }

    /// Turn `message` into a "no error, no data" reply carrying the
    /// negative-caching authority record.
    fn make_negative_response(&self, message: &mut Message) {
        message
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError)
            .add_name_server(self.negative_cache_record.clone());
    }

    fn log(&self, name: &str, allowed: bool) {
        if let Some(block_log) = &self.block_log {
            block_log.new_connection(name, allowed);
        }
    }
}

/// Lower-cased query name, as sent on the wire, without the trailing root dot.
///
/// IDNA labels stay in their `xn--` form.
fn query_name(name: &Name) -> String {
    let mut name = name.to_ascii().to_ascii_lowercase();
    if name.len() > 1 && name.ends_with('.') {
        name.pop();
    }
    name
}

fn negative_cache_record() -> Record {
    // A constant that always parses.
    let owner = Name::from_str(NEGATIVE_CACHE_NAME).unwrap_or_else(|_| Name::root());
    let soa = SOA::new(
        owner.clone(),
        owner.clone(),
        0,
        0,
        0,
        0,
        NEGATIVE_CACHE_TTL,
    );
    Record::from_rdata(owner, NEGATIVE_CACHE_TTL, RData::SOA(soa))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::blocker::tests::StaticMatcher;
    use crate::tunnel::UpstreamServer;
    use hickory_proto::op::Query;
    use hickory_proto::rr::RecordType;
    use std::net::{IpAddr, Ipv4Addr};

    /// Event loop recording every forward and device write.
    #[derive(Default)]
    pub struct MockEventLoop {
        pub forwarded: Vec<(SocketAddr, Vec<u8>, Option<Vec<u8>>)>,
        pub device_writes: Vec<Vec<u8>>,
        pub fail_forward: bool,
    }

    impl EventLoop for MockEventLoop {
        fn forward_packet(
            &mut self,
            destination: SocketAddr,
            payload: &[u8],
            request: Option<&[u8]>,
        ) -> Result<()> {
            if self.fail_forward {
                return Err(NetworkError::SendFailed {
                    destination,
                    source: std::io::Error::other("unreachable"),
                }
                .into());
            }
            self.forwarded
                .push((destination, payload.to_vec(), request.map(<[u8]>::to_vec)));
            Ok(())
        }

        fn queue_device_write(&mut self, packet: Vec<u8>) {
            self.device_writes.push(packet);
        }
    }

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const ALIAS: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);
    const UPSTREAM: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

    pub fn dns_query(domain: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    fn request_packet(payload: &[u8], destination: Ipv4Addr) -> Vec<u8> {
        network::build_ipv4_udp(CLIENT, destination, 41000, 53, payload).unwrap()
    }

    fn aliased_upstreams() -> UpstreamTable {
        UpstreamTable::aliased(vec![UpstreamServer {
            address: IpAddr::V4(UPSTREAM),
            index: 0,
        }])
    }

    fn proxy(blocked: &'static [&'static str], block_log: Option<BlockLogger>) -> DnsPacketProxy {
        DnsPacketProxy::new(
            Arc::new(StaticMatcher::new(blocked.iter().copied())),
            aliased_upstreams(),
            block_log,
        )
    }

    #[test]
    fn should_answer_blocked_query_locally() {
        let block_log = BlockLogger::new();
        let proxy = proxy(&["ads.example.com"], Some(block_log.clone()));
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&dns_query("ads.example.com", 7), ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        assert_eq!(
            outcome,
            RequestOutcome::Blocked {
                name: "ads.example.com".into()
            }
        );
        assert!(event_loop.forwarded.is_empty());
        assert_eq!(event_loop.device_writes.len(), 1);

        let (info, payload) = network::parse_udp(&event_loop.device_writes[0]).unwrap();
        assert_eq!(info.source_ip, IpAddr::V4(ALIAS));
        assert_eq!(info.dest_ip, IpAddr::V4(CLIENT));
        assert_eq!(info.dest_port, 41000);

        let reply = Message::from_vec(&payload).unwrap();
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
        assert_eq!(reply.name_servers().len(), 1);
        let soa = &reply.name_servers()[0];
        assert_eq!(soa.record_type(), RecordType::SOA);
        assert_eq!(soa.ttl(), NEGATIVE_CACHE_TTL);
        assert_eq!(soa.name().to_utf8(), NEGATIVE_CACHE_NAME);

        let entry = block_log.get("ads.example.com").unwrap();
        assert!(!entry.allowed);
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn should_forward_allowed_query_unchanged() {
        let block_log = BlockLogger::new();
        let proxy = proxy(&["ads.example.com"], Some(block_log.clone()));
        let mut event_loop = MockEventLoop::default();

        let payload = dns_query("www.example.com", 9);
        let packet = request_packet(&payload, ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        let upstream = SocketAddr::new(IpAddr::V4(UPSTREAM), 53);
        assert_eq!(
            outcome,
            RequestOutcome::Forwarded {
                name: "www.example.com".into(),
                upstream
            }
        );
        assert!(event_loop.device_writes.is_empty());
        assert_eq!(
            event_loop.forwarded,
            vec![(upstream, payload, Some(packet))]
        );
        assert!(block_log.get("www.example.com").unwrap().allowed);
    }

    #[test]
    fn should_lowercase_name_before_matching() {
        let matcher = Arc::new(StaticMatcher::new(["ads.example.com"]));
        let proxy = DnsPacketProxy::new(matcher.clone(), aliased_upstreams(), None);
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&dns_query("ADS.Example.COM", 1), ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        assert!(matches!(outcome, RequestOutcome::Blocked { .. }));
        assert_eq!(*matcher.lookups.lock(), vec!["ads.example.com".to_string()]);
    }

    #[test]
    fn should_match_punycode_name_as_sent() {
        let block_log = BlockLogger::new();
        let matcher = Arc::new(StaticMatcher::new(["xn--bcher-kva.example"]));
        let proxy = DnsPacketProxy::new(matcher.clone(), aliased_upstreams(), Some(block_log.clone()));
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&dns_query("XN--bcher-kva.example", 2), ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        assert_eq!(
            outcome,
            RequestOutcome::Blocked {
                name: "xn--bcher-kva.example".into()
            }
        );
        assert_eq!(*matcher.lookups.lock(), vec!["xn--bcher-kva.example".to_string()]);
        assert!(event_loop.forwarded.is_empty());
        assert!(!block_log.get("xn--bcher-kva.example").unwrap().allowed);
    }

    #[test]
    fn should_pass_empty_datagram_without_decision() {
        let block_log = BlockLogger::new();
        let matcher = Arc::new(StaticMatcher::new([]));
        let proxy = DnsPacketProxy::new(matcher.clone(), aliased_upstreams(), Some(block_log.clone()));
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&[], ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        let upstream = SocketAddr::new(IpAddr::V4(UPSTREAM), 53);
        assert_eq!(outcome, RequestOutcome::ForwardedEmpty(upstream));
        assert_eq!(event_loop.forwarded, vec![(upstream, Vec::new(), None)]);
        assert!(matcher.lookups.lock().is_empty());
        assert!(block_log.is_empty());
    }

    #[test]
    fn should_drop_packet_to_unknown_alias() {
        let proxy = proxy(&[], None);
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&dns_query("example.com", 1), Ipv4Addr::new(192, 0, 2, 9));
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        assert_eq!(outcome, RequestOutcome::Dropped(DropReason::UnknownUpstream));
        assert!(event_loop.forwarded.is_empty());
    }

    #[test]
    fn should_forward_to_packet_destination_without_aliasing() {
        let proxy = DnsPacketProxy::new(
            Arc::new(StaticMatcher::new([])),
            UpstreamTable::direct(vec![UpstreamServer {
                address: IpAddr::V4(UPSTREAM),
                index: 0,
            }]),
            None,
        );
        let mut event_loop = MockEventLoop::default();

        let packet = request_packet(&dns_query("example.com", 1), UPSTREAM);
        proxy.handle_dns_request(&packet, &mut event_loop);

        assert_eq!(event_loop.forwarded[0].0, SocketAddr::new(IpAddr::V4(UPSTREAM), 53));
    }

    #[test]
    fn should_silently_drop_malformed_input() {
        let block_log = BlockLogger::new();
        let proxy = proxy(&[], Some(block_log.clone()));
        let mut event_loop = MockEventLoop::default();

        let not_dns = request_packet(&[0xff, 0x00, 0x13], ALIAS);
        assert_eq!(
            proxy.handle_dns_request(&not_dns, &mut event_loop),
            RequestOutcome::Dropped(DropReason::NotDns)
        );

        let mut empty_message = Message::new();
        empty_message.set_id(3);
        let no_question = request_packet(&empty_message.to_vec().unwrap(), ALIAS);
        assert_eq!(
            proxy.handle_dns_request(&no_question, &mut event_loop),
            RequestOutcome::Dropped(DropReason::NoQuestion)
        );

        assert_eq!(
            proxy.handle_dns_request(&[0x60, 0x00], &mut event_loop),
            RequestOutcome::Dropped(DropReason::NotUdp)
        );

        assert!(event_loop.forwarded.is_empty());
        assert!(event_loop.device_writes.is_empty());
        assert!(block_log.is_empty());
    }

    #[test]
    fn should_absorb_forward_failures() {
        let proxy = proxy(&[], None);
        let mut event_loop = MockEventLoop {
            fail_forward: true,
            ..MockEventLoop::default()
        };

        let packet = request_packet(&dns_query("example.com", 1), ALIAS);
        let outcome = proxy.handle_dns_request(&packet, &mut event_loop);

        assert_eq!(outcome, RequestOutcome::Dropped(DropReason::Failed));
    }

    #[test]
    fn should_address_upstream_reply_to_original_sender() {
        let proxy = proxy(&[], None);
        let mut event_loop = MockEventLoop::default();

        let request = request_packet(&dns_query("example.com", 5), ALIAS);
        proxy
            .handle_dns_response(&request, b"upstream-answer", &mut event_loop)
            .unwrap();

        let (info, payload) = network::parse_udp(&event_loop.device_writes[0]).unwrap();
        assert_eq!(info.source_ip, IpAddr::V4(ALIAS));
        assert_eq!(info.source_port, 53);
        assert_eq!(info.dest_ip, IpAddr::V4(CLIENT));
        assert_eq!(info.dest_port, 41000);
        assert_eq!(payload, b"upstream-answer");
    }

    #[test]
    fn should_reject_reply_for_malformed_request() {
        let proxy = proxy(&[], None);
        let mut event_loop = MockEventLoop::default();

        assert!(
            proxy
                .handle_dns_response(&[1, 2, 3], b"answer", &mut event_loop)
                .is_err()
        );
        assert!(event_loop.device_writes.is_empty());
    }
}
