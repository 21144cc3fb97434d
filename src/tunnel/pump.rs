//! Packet pump for one configuration epoch.
//!
//! A single readiness wait covers the interrupt descriptor, the virtual
//! interface and every pending upstream socket. Per-packet failures are
//! logged and the pump carries on; only interface failures end it with an
//! error.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::interrupt::{Interrupt, Signal, Wake};
use super::pending::{PendingRequest, PendingRequestTable};
use super::platform::SocketProtector;
use super::watchdog::{self, Watchdog};
use crate::dns::{DnsPacketProxy, EventLoop};
use crate::error::{NetworkError, Result, TunnelError};

/// Large enough for any UDP datagram.
const BUFFER_SIZE: usize = 65535;

/// Why the pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The interrupt descriptor was closed.
    Stopped,
    /// The platform reported the active network gone.
    NetworkLost,
}

/// Sockets and queued writes the proxy drives.
struct PumpIo<'a, P: ?Sized> {
    pending: PendingRequestTable,
    device_writes: VecDeque<Vec<u8>>,
    protector: &'a P,
}

impl<P: SocketProtector + ?Sized> EventLoop for PumpIo<'_, P> {
    fn forward_packet(
        &mut self,
        destination: SocketAddr,
        payload: &[u8],
        request: Option<&[u8]>,
    ) -> Result<()> {
        let send_failed = move |source: io::Error| NetworkError::SendFailed {
            destination,
            source,
        };

        let local: IpAddr = match destination {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((local, 0)).map_err(send_failed)?;
        if !self.protector.protect(&socket) {
            return Err(send_failed(io::Error::other("socket could not be protected")).into());
        }
        socket.send_to(payload, destination).map_err(send_failed)?;

        if let Some(request) = request {
            socket.set_nonblocking(true).map_err(send_failed)?;
            self.pending
                .add(PendingRequest::new(socket, request.to_vec()));
        }
        Ok(())
    }

    fn queue_device_write(&mut self, packet: Vec<u8>) {
        self.device_writes.push_back(packet);
    }
}

pub struct Pump<'a, P: ?Sized> {
    proxy: DnsPacketProxy,
    device: File,
    io: PumpIo<'a, P>,
    watchdog: Watchdog,
    interrupt: &'a mut Interrupt,
    buffer: Vec<u8>,
}

impl<'a, P: SocketProtector + ?Sized> Pump<'a, P> {
    /// Take ownership of `interface` for the lifetime of the pump.
    pub fn new(
        proxy: DnsPacketProxy,
        interface: OwnedFd,
        protector: &'a P,
        watchdog: Watchdog,
        interrupt: &'a mut Interrupt,
    ) -> Self {
        Self {
            proxy,
            device: File::from(interface),
            io: PumpIo {
                pending: PendingRequestTable::new(),
                device_writes: VecDeque::new(),
                protector,
            },
            watchdog,
            interrupt,
            buffer: vec![0; BUFFER_SIZE],
        }
    }

    /// Pump packets until interrupted or the interface fails.
    ///
    /// The interface and all pending sockets are closed on return.
    pub fn run(mut self) -> Result<PumpExit> {
        info!("Packet pump started");
        loop {
            if let Some(exit) = self.step()? {
                info!("Packet pump exiting: {exit:?}");
                return Ok(exit);
            }
        }
    }

    fn step(&mut self) -> Result<Option<PumpExit>> {
        let mut fds = Vec::with_capacity(2 + self.io.pending.len());
        fds.push(pollfd(self.interrupt.as_raw_fd(), libc::POLLIN));
        let mut device_events = libc::POLLIN;
        if !self.io.device_writes.is_empty() {
            device_events |= libc::POLLOUT;
        }
        fds.push(pollfd(self.device.as_raw_fd(), device_events));
        fds.extend(
            self.io
                .pending
                .iter()
                .map(|entry| pollfd(entry.socket.as_raw_fd(), libc::POLLIN)),
        );

        if poll(&mut fds, self.watchdog.poll_timeout())? == 0 {
            if let Some(target) = self.watchdog.handle_timeout(Instant::now())? {
                watchdog::send_ping(target);
            }
            return Ok(None);
        }

        if fds[0].revents != 0 {
            while let Some(wake) = self.interrupt.try_next() {
                match wake {
                    Wake::Stop => return Ok(Some(PumpExit::Stopped)),
                    Wake::Signal(Signal::NetworkLost) => return Ok(Some(PumpExit::NetworkLost)),
                    Wake::Signal(Signal::NetworkAvailable) => {
                        debug!("Network available while pumping, nothing to do");
                    }
                }
            }
        }

        let device = fds[1].revents;
        if device & libc::POLLOUT != 0 {
            self.write_to_device()?;
        }

        // Removing from the back keeps earlier indices valid.
        for (index, fd) in fds[2..].iter().enumerate().rev() {
            if fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0
                && let Some(entry) = self.io.pending.remove(index)
            {
                self.read_reply(entry);
            }
        }

        if device & libc::POLLIN != 0 {
            self.read_from_device()?;
        } else if device & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(TunnelError::Interface("virtual interface closed".into()).into());
        }

        Ok(None)
    }

    fn write_to_device(&mut self) -> Result<()> {
        let Some(packet) = self.io.device_writes.pop_front() else {
            return Ok(());
        };
        match self.device.write(&packet) {
            Ok(_) => Ok(()),
            Err(err) if is_transient(&err) => {
                self.io.device_writes.push_front(packet);
                Ok(())
            }
            Err(err) => Err(TunnelError::Io(err).into()),
        }
    }

    fn read_from_device(&mut self) -> Result<()> {
        let length = match self.device.read(&mut self.buffer) {
            Ok(0) => {
                return Err(TunnelError::Interface("virtual interface closed".into()).into());
            }
            Ok(length) => length,
            Err(err) if is_transient(&err) => return Ok(()),
            Err(err) => return Err(TunnelError::Io(err).into()),
        };

        self.watchdog.handle_packet();
        let outcome = self
            .proxy
            .handle_dns_request(&self.buffer[..length], &mut self.io);
        debug!("Handled {length} byte packet: {outcome:?}");
        Ok(())
    }

    /// Deliver the reply waiting on `entry`'s socket, then close it.
    fn read_reply(&mut self, entry: PendingRequest) {
        match entry.socket.recv(&mut self.buffer) {
            Ok(length) => {
                if let Err(err) =
                    self.proxy
                        .handle_dns_response(&entry.packet, &self.buffer[..length], &mut self.io)
                {
                    warn!("Dropping upstream reply: {err}");
                }
            }
            Err(err) => warn!("Failed to read upstream reply: {err}"),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Wait until one of `fds` is ready. `None` waits forever.
///
/// Returns the number of ready descriptors, zero on timeout.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout = timeout.map_or(-1, |timeout| {
        let millis = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
        libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
    });
    let count = libc::nfds_t::try_from(fds.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;

    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of `count` pollfd entries.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), count, timeout) };
        if let Ok(ready) = usize::try_from(ready) {
            return Ok(ready);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklog::BlockLogger;
    use crate::dns::blocker::tests::StaticMatcher;
    use crate::dns::proxy::tests::dns_query;
    use crate::network;
    use crate::tunnel::interrupt::{self, Interrupter};
    use crate::tunnel::{UpstreamServer, UpstreamTable};
    use hickory_proto::op::{Message, ResponseCode};
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const ALIAS: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Unprotected;

    impl SocketProtector for Unprotected {
        fn protect(&self, _socket: &UdpSocket) -> bool {
            true
        }
    }

    fn local_proxy(blocked: &'static [&'static str], block_log: Option<BlockLogger>) -> DnsPacketProxy {
        DnsPacketProxy::new(
            Arc::new(StaticMatcher::new(blocked.iter().copied())),
            UpstreamTable::aliased(vec![UpstreamServer {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                index: 0,
            }]),
            block_log,
        )
    }

    fn spawn_pump(
        proxy: DnsPacketProxy,
    ) -> (UnixDatagram, Interrupter, JoinHandle<Result<PumpExit>>) {
        spawn_pump_with(proxy, Watchdog::disabled())
    }

    fn spawn_pump_with(
        proxy: DnsPacketProxy,
        watchdog: Watchdog,
    ) -> (UnixDatagram, Interrupter, JoinHandle<Result<PumpExit>>) {
        let (device, peer) = UnixDatagram::pair().unwrap();
        peer.set_read_timeout(Some(TIMEOUT)).unwrap();
        let (interrupter, mut interrupt) = interrupt::channel().unwrap();
        let handle = thread::spawn(move || {
            Pump::new(
                proxy,
                OwnedFd::from(device),
                &Unprotected,
                watchdog,
                &mut interrupt,
            )
            .run()
        });
        (peer, interrupter, handle)
    }

    #[test]
    fn should_forward_query_and_relay_reply() {
        let upstream = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        upstream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let (peer, interrupter, handle) = spawn_pump(local_proxy(&[], None));

        let query = dns_query("www.example.com", 11);
        peer.send(&network::build_ipv4_udp(CLIENT, ALIAS, 41000, upstream_port, &query).unwrap())
            .unwrap();

        let mut buffer = [0u8; 1500];
        let (length, from) = upstream.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..length], &query[..]);
        upstream.send_to(b"answer", from).unwrap();

        let length = peer.recv(&mut buffer).unwrap();
        let (info, payload) = network::parse_udp(&buffer[..length]).unwrap();
        assert_eq!(info.source_ip, IpAddr::V4(ALIAS));
        assert_eq!(info.source_port, upstream_port);
        assert_eq!(info.dest_ip, IpAddr::V4(CLIENT));
        assert_eq!(info.dest_port, 41000);
        assert_eq!(payload, b"answer");

        interrupter.close();
        assert_eq!(handle.join().unwrap().unwrap(), PumpExit::Stopped);
    }

    #[test]
    fn should_answer_blocked_query_from_the_pump() {
        let block_log = BlockLogger::new();
        let (peer, interrupter, handle) =
            spawn_pump(local_proxy(&["ads.example.com"], Some(block_log.clone())));

        let query = dns_query("ads.example.com", 12);
        peer.send(&network::build_ipv4_udp(CLIENT, ALIAS, 41000, 53, &query).unwrap())
            .unwrap();

        let mut buffer = [0u8; 1500];
        let length = peer.recv(&mut buffer).unwrap();
        let (_, payload) = network::parse_udp(&buffer[..length]).unwrap();
        let reply = Message::from_vec(&payload).unwrap();
        assert_eq!(reply.id(), 12);
        assert_eq!(reply.response_code(), ResponseCode::NoError);

        interrupter.close();
        assert_eq!(handle.join().unwrap().unwrap(), PumpExit::Stopped);
        assert!(!block_log.get("ads.example.com").unwrap().allowed);
    }

    #[test]
    fn should_survive_garbage_packets() {
        let (peer, interrupter, handle) = spawn_pump(local_proxy(&["ads.example.com"], None));

        peer.send(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let query = dns_query("ads.example.com", 13);
        peer.send(&network::build_ipv4_udp(CLIENT, ALIAS, 41000, 53, &query).unwrap())
            .unwrap();

        let mut buffer = [0u8; 1500];
        assert!(peer.recv(&mut buffer).is_ok());

        interrupter.close();
        assert_eq!(handle.join().unwrap().unwrap(), PumpExit::Stopped);
    }

    #[test]
    fn should_exit_when_network_is_lost() {
        let (_peer, interrupter, handle) = spawn_pump(local_proxy(&[], None));

        interrupter.send(Signal::NetworkAvailable);
        interrupter.send(Signal::NetworkLost);

        assert_eq!(handle.join().unwrap().unwrap(), PumpExit::NetworkLost);
    }

    #[test]
    fn should_fail_when_watchdog_ping_goes_unanswered() {
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let watchdog = Watchdog::with_timeouts(
            sink.local_addr().unwrap(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        let (_peer, _interrupter, handle) = spawn_pump_with(local_proxy(&[], None), watchdog);

        let result = handle.join().unwrap();

        assert!(matches!(
            result,
            Err(crate::Error::Tunnel(TunnelError::WatchdogTimeout))
        ));
        let mut buffer = [0u8; 16];
        sink.set_read_timeout(Some(TIMEOUT)).unwrap();
        assert_eq!(sink.recv(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn should_keep_running_while_interface_answers_pings() {
        let (peer, interrupter, handle) = spawn_pump_with(
            local_proxy(&[], None),
            Watchdog::with_timeouts(
                SocketAddr::from((Ipv4Addr::LOCALHOST, 9)),
                Duration::from_millis(20),
                Duration::from_millis(200),
            ),
        );

        // Any packet read from the interface counts as proof of life.
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(40));
            peer.send(&[0u8]).unwrap();
        }
        assert!(!handle.is_finished());

        interrupter.close();
        assert_eq!(handle.join().unwrap().unwrap(), PumpExit::Stopped);
    }

    #[test]
    fn should_time_out_poll_without_descriptors_ready() {
        let (_a, b) = UnixDatagram::pair().unwrap();
        let mut fds = [pollfd(b.as_raw_fd(), libc::POLLIN)];

        let started = Instant::now();
        assert_eq!(poll(&mut fds, Some(Duration::from_millis(20))).unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
