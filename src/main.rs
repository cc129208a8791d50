use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use nhrpd::bpf::build_capture_filter;
use nhrpd::capture::{self, PacketSocket};
use nhrpd::cli::{Cli, Mode, ResolvedCli};
use nhrpd::config::Config;
use nhrpd::error::NhrpError;
use nhrpd::forward::{Forwarder, TrafficHandler};
use nhrpd::output;
use nhrpd::registry::{Interface, Registry};
use nhrpd::sched::{Event, EventLoop};

/// Upper bound on a single event loop wait, so signal flags are noticed.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set on SIGHUP: reload the configuration and rebuild the capture filter.
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn reload_handler(_sig: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            shutdown_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            shutdown_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            reload_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &NhrpError) -> i32 {
    match err {
        NhrpError::Config(_) => 1,
        NhrpError::CaptureDevice(_) | NhrpError::NotOpen => 2,
        NhrpError::CaptureEof => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse().resolve();

    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: &ResolvedCli) -> Result<(), NhrpError> {
    match cli.mode {
        Mode::ShowFilter => show_filter(cli),
        Mode::Run => run_daemon(cli),
    }
}

fn load(cli: &ResolvedCli) -> Result<(Config, Registry), NhrpError> {
    let mut config = Config::load(&cli.config)?;
    if let Some(max) = cli.max_filter_insns {
        config.max_filter_insns = max;
    }
    let registry = config.to_registry(capture::if_nametoindex)?;
    log::info!(
        "Loaded {} interface(s), {} peer(s) from {}",
        registry.interfaces().len(),
        registry.peers().len(),
        cli.config.display()
    );
    Ok((config, registry))
}

fn show_filter(cli: &ResolvedCli) -> Result<(), NhrpError> {
    let (config, registry) = load(cli)?;
    let program = build_capture_filter(&registry, config.max_filter_insns)?;
    output::write_filter(&program, cli.format, &mut io::stdout().lock())
}

/// Unicast hand-off point for NHRP encapsulation.
///
/// Resolution and registration live outside the capture core; frames that
/// reach this point are accounted and logged.
#[derive(Default)]
struct EncapsulationQueue {
    frames: u64,
    bytes: u64,
}

impl TrafficHandler for EncapsulationQueue {
    fn send_traffic(&mut self, iface: &Interface, protocol: u16, frame: &[u8]) {
        self.frames += 1;
        self.bytes += frame.len() as u64;
        log::debug!(
            "Traffic for NHRP on {} (protocol 0x{:04x}, {} bytes)",
            iface.name,
            protocol,
            frame.len()
        );
    }
}

fn run_daemon(cli: &ResolvedCli) -> Result<(), NhrpError> {
    // 0. Install signal handlers for graceful shutdown and reload.
    install_signal_handlers();

    // 1. Load configuration and build the topology.
    let (config, mut registry) = load(cli)?;
    if registry.interfaces().is_empty() {
        log::warn!("No interfaces configured: all captured traffic will be filtered");
    }

    // 2. Open the capture socket and queue the first filter install.
    let socket = PacketSocket::open()?;
    let fd = socket.as_raw_fd();
    let mut sched = EventLoop::new();
    sched.register_fd(fd);
    let mut forwarder = Forwarder::new(config.settings());
    forwarder.open(socket, &mut sched);

    // 3. Event loop.
    let mut traffic = EncapsulationQueue::default();
    let result = 'main: loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            break Ok(());
        }
        if RELOAD_REQUESTED.swap(false, Ordering::Relaxed) {
            match load(cli) {
                Ok((_, reloaded)) => {
                    registry = reloaded;
                    forwarder.local_addresses_changed(&mut sched);
                }
                Err(e) => log::error!("Reload failed, keeping previous configuration: {e}"),
            }
        }

        let events = match sched.wait(POLL_INTERVAL) {
            Ok(events) => events,
            Err(e) => break Err(e),
        };
        for event in events {
            match event {
                Event::Readable(_) => {
                    if let Err(e) = forwarder.capture_readable(&registry, &mut traffic) {
                        if e.is_fatal() {
                            sched.unregister_fd(fd);
                            break 'main Err(e);
                        }
                        log::warn!("Capture: {e}");
                    }
                }
                Event::Task(task) => forwarder.run_task(task, &registry, &mut sched),
            }
        }
    };

    log::info!(
        "Capture stopped in state {}: {:?}, {} frame(s) / {} byte(s) handed to NHRP",
        forwarder.state(),
        forwarder.stats(),
        traffic.frames,
        traffic.bytes
    );
    forwarder.close(&mut sched);
    result
}
