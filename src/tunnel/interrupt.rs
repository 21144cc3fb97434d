//! Wake-up channel between the supervisor and its worker thread.
//!
//! The worker includes the read end of a socket pair in every readiness
//! wait. Signals travel over a bounded channel and each one writes a byte
//! to wake the worker; closing the write end is the cancellation token and
//! stays observable for the rest of the worker's life.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Pending signals beyond this are dropped.
const SIGNAL_CAPACITY: usize = 16;

/// Network change forwarded to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    NetworkLost,
    NetworkAvailable,
}

/// What woke the worker up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Stop,
    Signal(Signal),
}

/// Supervisor side of the channel.
#[derive(Debug)]
pub struct Interrupter {
    writer: Mutex<Option<UnixStream>>,
    signals: SyncSender<Signal>,
}

/// Worker side of the channel.
#[derive(Debug)]
pub struct Interrupt {
    reader: UnixStream,
    signals: Receiver<Signal>,
    closed: bool,
}

/// Create a connected interrupter/interrupt pair.
pub fn channel() -> io::Result<(Interrupter, Interrupt)> {
    let (writer, reader) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;
    reader.set_nonblocking(true)?;
    let (sender, receiver) = mpsc::sync_channel(SIGNAL_CAPACITY);

    Ok((
        Interrupter {
            writer: Mutex::new(Some(writer)),
            signals: sender,
        },
        Interrupt {
            reader,
            signals: receiver,
            closed: false,
        },
    ))
}

impl Interrupter {
    /// Deliver `signal` and wake the worker. Returns false once closed.
    pub fn send(&self, signal: Signal) -> bool {
        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            return false;
        };

        match self.signals.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Dropping {signal:?}, worker is not keeping up"),
            Err(TrySendError::Disconnected(_)) => return false,
        }

        match stream.write(&[1]) {
            Ok(_) => true,
            // A full pipe already guarantees a wake-up.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => {
                warn!("Failed to wake tunnel worker: {err}");
                false
            }
        }
    }

    /// Close the descriptor; the worker observes [`Wake::Stop`] from now on.
    pub fn close(&self) {
        if self.writer.lock().take().is_some() {
            debug!("Interrupt descriptor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }
}

impl AsRawFd for Interrupt {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Interrupt {
    /// Consume whatever woke the descriptor and return the next event.
    ///
    /// Stop takes precedence over pending signals.
    pub fn try_next(&mut self) -> Option<Wake> {
        self.drain();
        if self.closed {
            return Some(Wake::Stop);
        }
        match self.signals.try_recv() {
            Ok(signal) => Some(Wake::Signal(signal)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Some(Wake::Stop)
            }
        }
    }

    /// Block until an event arrives or `timeout` elapses.
    ///
    /// `None` waits forever.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<Wake>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(wake) = self.try_next() {
                return Ok(Some(wake));
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    Some(remaining)
                }
                None => None,
            };

            let mut fds = [libc::pollfd {
                fd: self.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            super::pump::poll(&mut fds, remaining)?;
        }
    }

    fn drain(&mut self) {
        let mut buffer = [0u8; 64];
        loop {
            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("Interrupt descriptor failed, stopping: {err}");
                    self.closed = true;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_report_nothing_when_idle() {
        let (_interrupter, mut interrupt) = channel().unwrap();

        assert_eq!(interrupt.try_next(), None);
        assert_eq!(
            interrupt.wait(Some(Duration::from_millis(20))).unwrap(),
            None
        );
    }

    #[test]
    fn should_deliver_signals_in_order() {
        let (interrupter, mut interrupt) = channel().unwrap();

        assert!(interrupter.send(Signal::NetworkLost));
        assert!(interrupter.send(Signal::NetworkAvailable));

        assert_eq!(
            interrupt.wait(None).unwrap(),
            Some(Wake::Signal(Signal::NetworkLost))
        );
        assert_eq!(
            interrupt.try_next(),
            Some(Wake::Signal(Signal::NetworkAvailable))
        );
        assert_eq!(interrupt.try_next(), None);
    }

    #[test]
    fn should_stay_stopped_once_closed() {
        let (interrupter, mut interrupt) = channel().unwrap();
        interrupter.send(Signal::NetworkLost);
        interrupter.close();

        assert!(interrupter.is_closed());
        assert!(!interrupter.send(Signal::NetworkAvailable));
        assert_eq!(interrupt.wait(None).unwrap(), Some(Wake::Stop));
        assert_eq!(interrupt.try_next(), Some(Wake::Stop));
    }

    #[test]
    fn should_wake_blocked_waiter_from_another_thread() {
        let (interrupter, mut interrupt) = channel().unwrap();

        let waiter = std::thread::spawn(move || interrupt.wait(Some(Duration::from_secs(10))));
        std::thread::sleep(Duration::from_millis(20));
        interrupter.close();

        let started = Instant::now();
        assert_eq!(waiter.join().unwrap().unwrap(), Some(Wake::Stop));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn should_stop_when_interrupter_is_dropped() {
        let (interrupter, mut interrupt) = channel().unwrap();
        drop(interrupter);

        assert_eq!(interrupt.try_next(), Some(Wake::Stop));
    }
}
