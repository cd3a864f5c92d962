//! VPN Collector Daemon
//!
//! Runs the session layer behind a UDP packet feed:
//! - Receives raw IP frames captured from the VPN interface, one per datagram
//! - Relays each TCP/UDP flow through a real outbound socket
//! - Sends re-encapsulated return frames back to the feed peer

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use session_core::{
    AllowAll, FlowEvent, FlowEventSink, Metrics, Reactor, SessionConfig, SessionCoordinator,
    SystemDialer,
};

use collector_daemon::{FlowHandler, FrameSink};

// ============================================================================
// Constants
// ============================================================================

/// Default packet feed address
const DEFAULT_LISTEN: &str = "127.0.0.1:7700";

/// Default interval between metrics dumps, in seconds
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

/// Largest frame accepted from the feed
const MAX_FRAME_SIZE: usize = 65_535;

/// Upper bound on one wait, so the shutdown flag is noticed
const LOOP_TIMEOUT: Duration = Duration::from_millis(100);

/// mio token for the feed socket
const FEED_TOKEN: Token = Token(0);

/// mio token for reactor event wake-ups
const EVENTS_TOKEN: Token = Token(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // --listen <addr:port>         Packet feed address
    // --config <path>              JSON session configuration (optional)
    // --metrics-interval <secs>    Interval between metrics dumps
    let args: Vec<String> = std::env::args().collect();

    let listen: SocketAddr = parse_arg(&args, "--listen")
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
        .parse()
        .map_err(|_| "Invalid listen address")?;
    let config = match parse_arg(&args, "--config") {
        Some(path) => SessionConfig::from_file(&path)?,
        None => SessionConfig::default(),
    };
    let metrics_interval = parse_arg(&args, "--metrics-interval")
        .map(|v| v.parse::<u64>().map_err(|_| "Invalid metrics interval"))
        .transpose()?
        .unwrap_or(DEFAULT_METRICS_INTERVAL_SECS);

    log::info!("VPN Collector Daemon starting...");
    log::info!("  Listen:        {}", listen);
    log::info!("  Session limit: {}", config.session_limit);
    log::info!("  Connect tries: {}", config.connect_attempts);
    log::info!("  Metrics every: {}s", metrics_interval);

    // Shutdown on SIGINT/SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    // Session layer
    let metrics = Arc::new(Metrics::new());
    let dialer = SystemDialer::new(Arc::new(AllowAll), &config).with_metrics(Arc::clone(&metrics));
    let (mut reactor, reactor_handle) = Reactor::new(&config)?;
    let coordinator = Arc::new(SessionCoordinator::with_metrics(
        config,
        Arc::new(dialer),
        reactor_handle.clone(),
        Arc::clone(&metrics),
    ));

    let mut daemon = Daemon::new(listen, Arc::clone(&coordinator))?;
    let sink = daemon.event_sink()?;

    let reactor_coordinator = Arc::clone(&coordinator);
    let reactor_thread = thread::Builder::new()
        .name("reactor".into())
        .spawn(move || {
            if let Err(e) = reactor.run(&reactor_coordinator, &sink) {
                log::error!("Reactor failed: {}", e);
            }
        })?;

    let result = daemon.run(&shutdown, Duration::from_secs(metrics_interval));

    log::info!("Shutting down...");
    daemon.reset_clients();
    let closed = coordinator.close_all();
    log::info!("Closed {} remaining sessions", closed);
    if let Err(e) = reactor_handle.shutdown() {
        log::debug!("Reactor already stopped: {}", e);
    }
    if reactor_thread.join().is_err() {
        log::error!("Reactor thread panicked");
    }
    log::info!("Final metrics:\n{}", metrics.render());

    result
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Feed Output
// ============================================================================

/// The feed socket, replying to whoever sent the most recent frame
struct FeedOutput {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl FrameSink for FeedOutput {
    fn send_frame(&mut self, frame: Vec<u8>) {
        let peer = match self.peer {
            Some(p) => p,
            None => {
                log::trace!("No feed peer yet, dropping {} byte frame", frame.len());
                return;
            }
        };
        match self.socket.send_to(&frame, peer) {
            Ok(_) => log::trace!("Injected {} bytes to {}", frame.len(), peer),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Feed socket full, dropping {} byte frame", frame.len());
            }
            Err(e) => log::warn!("Failed to inject frame to {}: {}", peer, e),
        }
    }
}

// ============================================================================
// Reactor Event Sink
// ============================================================================

/// Queues flow events for the main loop and wakes its poll
struct WakingSink {
    tx: Sender<FlowEvent>,
    waker: Arc<Waker>,
}

impl FlowEventSink for WakingSink {
    fn publish(&self, event: FlowEvent) {
        if self.tx.send(event).is_err() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::debug!("Failed to wake main loop: {}", e);
        }
    }
}

// ============================================================================
// Daemon Structure
// ============================================================================

struct Daemon {
    poll: Poll,
    output: FeedOutput,
    handler: FlowHandler,
    coordinator: Arc<SessionCoordinator>,
    events_tx: Sender<FlowEvent>,
    events_rx: Receiver<FlowEvent>,
    recv_buf: Vec<u8>,
}

impl Daemon {
    fn new(listen: SocketAddr, coordinator: Arc<SessionCoordinator>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(listen)?;
        poll.registry()
            .register(&mut socket, FEED_TOKEN, Interest::READABLE)?;
        log::info!("Packet feed bound to {}", socket.local_addr()?);

        let (events_tx, events_rx) = mpsc::channel();

        Ok(Daemon {
            poll,
            output: FeedOutput { socket, peer: None },
            handler: FlowHandler::new(Arc::clone(&coordinator)),
            coordinator,
            events_tx,
            events_rx,
            recv_buf: vec![0u8; MAX_FRAME_SIZE],
        })
    }

    /// Sink for the reactor thread; wakes this loop on every event
    fn event_sink(&self) -> io::Result<WakingSink> {
        let waker = Arc::new(Waker::new(self.poll.registry(), EVENTS_TOKEN)?);
        Ok(WakingSink {
            tx: self.events_tx.clone(),
            waker,
        })
    }

    fn run(
        &mut self,
        shutdown: &AtomicBool,
        metrics_interval: Duration,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(256);
        let mut last_metrics = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(LOOP_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == FEED_TOKEN {
                    self.process_feed()?;
                }
            }

            self.process_flow_events();

            if last_metrics.elapsed() >= metrics_interval {
                last_metrics = Instant::now();
                log::info!(
                    "{} live sessions\n{}",
                    self.coordinator.session_count(),
                    self.coordinator.metrics().render()
                );
            }
        }
        Ok(())
    }

    fn process_feed(&mut self) -> io::Result<()> {
        loop {
            let (len, from) = match self.output.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            if self.output.peer != Some(from) {
                log::info!("Feed peer is now {}", from);
                self.output.peer = Some(from);
            }

            self.handler
                .handle_frame(&self.recv_buf[..len], &mut self.output);
        }
    }

    fn process_flow_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            log::trace!("Flow event {:?}", event);
            self.handler.handle_event(event, &mut self.output);
        }
    }

    fn reset_clients(&mut self) {
        self.process_flow_events();
        self.handler.reset_all(&mut self.output);
    }
}
