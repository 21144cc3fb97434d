//! Connection supervision.
//!
//! A [`Supervisor`] owns one worker thread at a time. The worker configures
//! the virtual interface, pumps packets until interrupted and reconnects
//! with exponential backoff when the interface fails. Commands arrive from
//! the caller's thread through an [`Interrupter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::blocklog::BlockLogger;
use crate::config::Config;
use crate::dns::{DnsPacketProxy, RuleMatcher};
use crate::error::Result;
use crate::metrics as counters;
use crate::status::{StatusBridge, StatusReceiver, TunnelStatus};
use crate::tunnel::interrupt::{self, Interrupt, Interrupter, Signal, Wake};
use crate::tunnel::{self, Platform, Pump, PumpExit, UpstreamServer, Watchdog};

/// How long `stop` waits for the worker before abandoning it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Port the watchdog pings on its target.
const DNS_PORT: u16 = 53;

/// Delay between reconnect attempts.
///
/// Each failed attempt doubles the next delay up to a cap. An attempt that
/// ran for long enough starts over from the minimum.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    reset_after: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub const MIN_DELAY: Duration = Duration::from_secs(5);
    pub const MAX_DELAY: Duration = Duration::from_secs(120);
    pub const RESET_AFTER: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::with_limits(Self::MIN_DELAY, Self::MAX_DELAY, Self::RESET_AFTER)
    }

    pub fn with_limits(min: Duration, max: Duration, reset_after: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            reset_after,
            current: min,
        }
    }

    /// Delay to sleep after an attempt that ran for `ran_for`.
    pub fn next_delay(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.reset_after {
            self.current = self.min;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

struct Worker {
    handle: JoinHandle<()>,
    interrupter: Interrupter,
    done: mpsc::Receiver<()>,
}

/// Owner of the tunnel's lifetime.
pub struct Supervisor<P: Platform> {
    platform: Arc<P>,
    matcher: Arc<dyn RuleMatcher>,
    config: Arc<Config>,
    backoff: Backoff,
    status: StatusBridge,
    block_log: BlockLogger,
    upstreams: Arc<Mutex<Vec<UpstreamServer>>>,
    worker: Option<Worker>,
    paused: bool,
}

impl<P: Platform> Supervisor<P> {
    /// Create a stopped supervisor. The block log is loaded from
    /// `config.block_log_path`.
    pub fn new(platform: Arc<P>, matcher: Arc<dyn RuleMatcher>, config: Config) -> Self {
        let block_log = BlockLogger::load(&config.block_log_path);
        Self {
            platform,
            matcher,
            config: Arc::new(config),
            backoff: Backoff::new(),
            status: StatusBridge::new(),
            block_log,
            upstreams: Arc::default(),
            worker: None,
            paused: false,
        }
    }

    /// Use `backoff` for the reconnect delays of later starts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the configuration used by the next start.
    pub fn set_config(&mut self, config: Config) {
        self.config = Arc::new(config);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the worker thread. No-op while a worker is running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("Tunnel already running");
            return Ok(());
        }
        self.reap_worker();
        self.paused = false;

        self.status.publish(TunnelStatus::Starting);
        if !self.config.block_logging {
            self.block_log.clear();
        }

        match self.spawn_worker() {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start tunnel worker: {err}");
                self.status.publish(TunnelStatus::Stopped);
                Err(err.into())
            }
        }
    }

    fn spawn_worker(&self) -> std::io::Result<Worker> {
        let (interrupter, interrupt) = interrupt::channel()?;
        let (done_tx, done) = mpsc::channel();

        let worker = TunnelWorker {
            platform: Arc::clone(&self.platform),
            matcher: Arc::clone(&self.matcher),
            config: Arc::clone(&self.config),
            backoff: self.backoff.clone(),
            status: self.status.clone(),
            block_log: self.config.block_logging.then(|| self.block_log.clone()),
            upstreams: Arc::clone(&self.upstreams),
            interrupt,
        };

        let handle = thread::Builder::new()
            .name("dnsveil-tunnel".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })?;

        Ok(Worker {
            handle,
            interrupter,
            done,
        })
    }

    /// Stop the worker, close the interface and flush the block log.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.status.publish(TunnelStatus::Stopping);
            worker.interrupter.close();

            match worker.done.recv_timeout(JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        warn!("Tunnel worker panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Tunnel worker did not exit within {JOIN_TIMEOUT:?}, abandoning it");
                }
            }
        }

        self.upstreams.lock().clear();
        self.status.publish(TunnelStatus::Stopped);

        if self.config.block_logging
            && let Err(err) = self.block_log.save()
        {
            warn!("Failed to save block log: {err}");
        }
    }

    /// Stop now and remember to start again on [`Self::resume`].
    pub fn pause(&mut self) {
        self.stop();
        self.paused = true;
    }

    /// Start again after [`Self::pause`]. No-op otherwise.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Ok(());
        }
        self.start()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The platform reports a usable network again.
    pub fn on_network_available(&self) {
        if self.status.current() == TunnelStatus::WaitingForNetwork {
            self.signal(Signal::NetworkAvailable);
        }
    }

    /// The platform reports the active network gone.
    ///
    /// The status moves to waiting right away so that an availability
    /// report following immediately still reaches the worker.
    pub fn on_network_lost(&self) {
        if self.worker.is_some()
            && self
                .status
                .transition(TunnelStatus::Running, TunnelStatus::WaitingForNetwork)
        {
            self.signal(Signal::NetworkLost);
        }
    }

    fn signal(&self, signal: Signal) {
        if let Some(worker) = &self.worker
            && !worker.interrupter.send(signal)
        {
            debug!("Tunnel worker gone, dropping {signal:?}");
        }
    }

    /// Whether a worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    pub fn status(&self) -> StatusReceiver {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> TunnelStatus {
        self.status.current()
    }

    pub fn block_log(&self) -> &BlockLogger {
        &self.block_log
    }

    /// Upstream servers of the current configuration epoch.
    pub fn upstream_servers(&self) -> Vec<UpstreamServer> {
        self.upstreams.lock().clone()
    }

    fn reap_worker(&mut self) {
        if let Some(worker) = self.worker.take()
            && worker.handle.join().is_err()
        {
            warn!("Tunnel worker panicked");
        }
    }
}

impl<P: Platform> Drop for Supervisor<P> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// State moved into the worker thread.
struct TunnelWorker<P> {
    platform: Arc<P>,
    matcher: Arc<dyn RuleMatcher>,
    config: Arc<Config>,
    backoff: Backoff,
    status: StatusBridge,
    block_log: Option<BlockLogger>,
    upstreams: Arc<Mutex<Vec<UpstreamServer>>>,
    interrupt: Interrupt,
}

impl<P: Platform> TunnelWorker<P> {
    fn run(mut self) {
        info!("Tunnel worker started");

        loop {
            let started = Instant::now();
            match self.run_epoch() {
                Ok(PumpExit::Stopped) => break,
                Ok(PumpExit::NetworkLost) => {
                    self.upstreams.lock().clear();
                    self.status.publish(TunnelStatus::WaitingForNetwork);
                    if !self.wait_for_network() {
                        break;
                    }
                    self.status.publish(TunnelStatus::Reconnecting);
                    metrics::counter!(counters::RECONNECTS).increment(1);
                    continue;
                }
                Err(err) if err.is_fatal() => {
                    error!("Tunnel cannot be established: {err}");
                    self.upstreams.lock().clear();
                    self.status.publish(TunnelStatus::Stopped);
                    break;
                }
                Err(err) => {
                    warn!("Tunnel failed: {err}");
                    self.upstreams.lock().clear();
                    self.status.publish(TunnelStatus::ReconnectingNetworkError);
                }
            }

            let delay = self.backoff.next_delay(started.elapsed());
            info!("Reconnecting in {delay:?}");
            if !self.sleep(delay) {
                break;
            }
            metrics::counter!(counters::RECONNECTS).increment(1);
        }

        info!("Tunnel worker exiting");
    }

    /// Configure the interface and pump until the epoch ends.
    fn run_epoch(&mut self) -> Result<PumpExit> {
        let tunnel = tunnel::configure(&*self.platform, &self.config)?;
        *self.upstreams.lock() = tunnel.upstreams.servers().to_vec();

        let watchdog = match tunnel.watchdog_target {
            Some(target) if self.config.watchdog => Watchdog::new(SocketAddr::new(target, DNS_PORT)),
            _ => Watchdog::disabled(),
        };
        let proxy = DnsPacketProxy::new(
            Arc::clone(&self.matcher),
            tunnel.upstreams,
            self.block_log.clone(),
        );

        self.status.publish(TunnelStatus::Running);
        Pump::new(
            proxy,
            tunnel.interface,
            &*self.platform,
            watchdog,
            &mut self.interrupt,
        )
        .run()
    }

    /// Returns false when stopped instead.
    fn wait_for_network(&mut self) -> bool {
        loop {
            match self.interrupt.wait(None) {
                Ok(Some(Wake::Signal(Signal::NetworkAvailable))) => return true,
                Ok(Some(Wake::Stop)) => return false,
                Ok(_) => {}
                Err(err) => return self.abort(&err),
            }
        }
    }

    /// Interruptible sleep. Returns false when stopped instead.
    fn sleep(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.interrupt.wait(Some(remaining)) {
                Ok(None) => return true,
                Ok(Some(Wake::Stop)) => return false,
                Ok(Some(Wake::Signal(signal))) => debug!("Ignoring {signal:?} during backoff"),
                Err(err) => return self.abort(&err),
            }
        }
    }

    fn abort(&self, err: &std::io::Error) -> bool {
        error!("Interrupt descriptor failed: {err}");
        self.status.publish(TunnelStatus::Stopped);
        false
    }
}
