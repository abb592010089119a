// ============================================================================
// PSM THROTTLE DAEMON
// ============================================================================
// Hosts a `Monitor` behind three endpoints:
// - the control socket, where the controller registers and toggles choking
// - an optional packet tap: `[direction byte][IPv4 packet]` in, packet out
// - an HTTP diagnostics server on 127.0.0.1
//
// Usage: psm-throttle [config.json]

use std::env;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use threadpool::ThreadPool;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use psm_throttle::{
    Clock, ControlChannel, EmulatedRadio, Monitor, MonitorConfig, MonitorError, SystemClock,
    TimerDriver, render_table,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config() -> psm_throttle::Result<MonitorConfig> {
    match env::args().nth(1) {
        Some(path) => MonitorConfig::from_file(path),
        None => Ok(MonitorConfig::default()),
    }
}

fn is_timeout(e: &MonitorError) -> bool {
    matches!(
        e,
        MonitorError::Io(io)
            if matches!(io.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

// ============================================================================
// HTTP DIAGNOSTICS
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    choking: bool,
    armed_timers: usize,
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        concat!(
            "HTTP/1.1 {status}\r\n",
            "Content-Type: {content_type}\r\n",
            "Content-Length: {}\r\n",
            "Connection: close\r\n\r\n{body}",
        ),
        body.len(),
        status = status,
        content_type = content_type,
        body = body,
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
        debug!(error = %e, "failed to write HTTP response");
    }
}

fn respond_json<T: Serialize>(stream: &mut TcpStream, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(body) => respond(stream, "200 OK", "application/json", &body),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            respond(stream, "500 Internal Server Error", "text/plain", "Internal Server Error\n");
        }
    }
}

fn handle_client(mut stream: TcpStream, monitor: &Monitor, radio: &EmulatedRadio) {
    let mut buffer = [0_u8; 4096];
    let Ok(bytes_read) = stream.read(&mut buffer) else {
        return;
    };
    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let path = request
        .strip_prefix("GET ")
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("");

    match path {
        "/connections" => respond_json(&mut stream, &monitor.dump()),
        "/connections/table" => {
            let table = render_table(&monitor.dump());
            respond(&mut stream, "200 OK", "text/plain", &table)
        }
        "/radio" => respond_json(&mut stream, &radio.stats()),
        "/health" => respond_json(
            &mut stream,
            &HealthResponse {
                status: "ok",
                connections: monitor.registry().count(),
                choking: monitor.is_choking(),
                armed_timers: monitor.timers().armed_count(),
            },
        ),
        "/config" => respond_json(&mut stream, monitor.config()),
        _ => respond(&mut stream, "404 Not Found", "text/plain", "Not Found\n"),
    }
}

// ============================================================================
// SOCKET LOOPS
// ============================================================================

fn spawn_control_loop(
    channel: Arc<ControlChannel>,
    monitor: Arc<Monitor>,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("psm-control".to_owned()).spawn(move || {
        while running.load(Ordering::SeqCst) {
            match channel.recv() {
                Ok(request) => {
                    debug!(?request, "control request");
                    monitor.apply_control(request);
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => warn!(error = %e, "bad control message"),
            }
        }
    })
}

fn spawn_packet_tap(
    path: &Path,
    monitor: Arc<Monitor>,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let _ = std::fs::remove_file(path);
    let socket = UnixDatagram::bind(path)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    info!(path = %path.display(), "packet tap listening");

    thread::Builder::new().name("psm-tap".to_owned()).spawn(move || {
        let mut buffer = vec![0u8; 65536];
        while running.load(Ordering::SeqCst) {
            let (len, from) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "packet tap receive failed");
                    continue;
                }
            };
            let Some((direction, packet)) = buffer[..len].split_first_mut() else {
                continue;
            };
            match *direction {
                0 => monitor.hook_local_out(packet),
                1 => monitor.hook_local_in(packet),
                other => {
                    trace!(direction = other, "unknown tap direction");
                    continue;
                }
            };
            if let Some(reply_to) = from.as_pathname()
                && let Err(e) = socket.send_to(packet, reply_to)
            {
                debug!(error = %e, "packet tap reply failed");
            }
        }
    })
}

// ============================================================================
// MAIN
// ============================================================================

fn run(config: MonitorConfig) -> psm_throttle::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let radio = Arc::new(EmulatedRadio::new());
    let channel = Arc::new(ControlChannel::bind(&config.control_socket_path)?);

    let tap_path: Option<PathBuf> = config.packet_socket_path.clone();
    let http_port = config.http_port;
    let use_tcp_info = config.use_tcp_info;

    let mut monitor = Monitor::new(config, Arc::clone(&clock), radio.clone(), channel.clone())?;
    #[cfg(all(target_os = "linux", feature = "netlink"))]
    if use_tcp_info {
        monitor = monitor.with_tcp_info(Arc::new(psm_throttle::netlink::InetDiagSource::new()));
        info!("tcp_info lookups enabled");
    }
    #[cfg(not(all(target_os = "linux", feature = "netlink")))]
    if use_tcp_info {
        warn!("tcp_info lookups need the netlink feature on Linux; using handshake estimates");
    }
    let monitor = Arc::new(monitor);

    let driver_monitor = Arc::clone(&monitor);
    let mut driver = TimerDriver::spawn(Arc::clone(monitor.timers()), clock, move || {
        driver_monitor.run_due_timers();
    })?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .map_err(|e| MonitorError::config(format!("cannot install Ctrl-C handler: {e}")))?;

    let mut workers = vec![spawn_control_loop(
        Arc::clone(&channel),
        Arc::clone(&monitor),
        Arc::clone(&running),
    )?];
    if let Some(path) = &tap_path {
        workers.push(spawn_packet_tap(path, Arc::clone(&monitor), Arc::clone(&running))?);
    }

    let cpu_count = thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(4);
    let thread_count = (cpu_count * 2).clamp(4, 16);
    let pool = ThreadPool::new(thread_count);

    let listener = TcpListener::bind(("127.0.0.1", http_port))?;
    listener.set_nonblocking(true)?;
    info!(
        port = http_port,
        workers = thread_count,
        "diagnostics at http://127.0.0.1:{http_port}/connections"
    );

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                // Accepted sockets inherit non-blocking mode on some platforms
                if let Err(e) = stream.set_nonblocking(false) {
                    debug!(error = %e, "cannot make client socket blocking");
                }
                let monitor = Arc::clone(&monitor);
                let radio = Arc::clone(&radio);
                pool.execute(move || handle_client(stream, &monitor, &radio));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100))
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    info!("shutting down");
    for worker in workers {
        let _ = worker.join();
    }
    monitor.shutdown();
    driver.stop();
    if let Some(path) = &tap_path {
        let _ = std::fs::remove_file(path);
    }
    pool.join();
    Ok(())
}

fn main() {
    let config = load_config();
    let level = config.as_ref().map_or("info", |c| c.log_level.as_str()).to_owned();
    init_tracing(&level);

    let result = config.and_then(run);
    if let Err(e) = result {
        error!(error = %e, "psm-throttle failed");
        std::process::exit(1);
    }
}
