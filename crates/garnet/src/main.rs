use garnet_log::GarnetLogger;
use garnet_transport::Endpoint;
use log::{LevelFilter, error, info, warn};
use std::net::SocketAddr;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

pub mod config;

fn main() {
    GarnetLogger::init(LevelFilter::Info).expect("logger init failed");

    let start_time = Instant::now();
    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let opts = match config.transport_options() {
        Ok(opts) => opts,
        Err(e) => {
            error!("Invalid transport configuration: {}", e);
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::from_str(&config.network.address).expect("validated address");
    let endpoint = match Endpoint::bind(addr) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    let listener = match endpoint.listen(opts, config.network.backlog) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start listening: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "garnet serving on {} ({} mode), ready in {:.2}s",
        config.network.address,
        config.transport.mode,
        start_time.elapsed().as_secs_f64()
    );

    loop {
        let stream = match listener.accept(Duration::from_secs(5)) {
            Ok(stream) => stream,
            Err(garnet_transport::TransportError::ConnectionTimeout) => continue,
            Err(e) => {
                error!("Accept failed: {}", e);
                break;
            }
        };
        info!(
            "Accepted connection @{} from {}",
            stream.socket_id(),
            stream.peer_addr()
        );
        thread::Builder::new()
            .name(format!("garnet-sink-{}", stream.socket_id()))
            .spawn(move || sink(stream))
            .expect("failed to spawn connection thread");
    }
}

/// Drains one connection, reporting throughput once a second.
fn sink(stream: garnet_transport::Stream) {
    let mut buf = vec![0u8; 65536];
    let mut bytes: u64 = 0;
    let mut messages: u64 = 0;
    let mut window = Instant::now();
    loop {
        match stream.recv(&mut buf) {
            Ok(n) => {
                bytes += n as u64;
                messages += 1;
                if window.elapsed() >= Duration::from_secs(1) {
                    info!(
                        "@{}: {} msgs, {:.1} kB/s",
                        stream.socket_id(),
                        messages,
                        bytes as f64 / window.elapsed().as_secs_f64() / 1000.0
                    );
                    bytes = 0;
                    messages = 0;
                    window = Instant::now();
                }
            }
            Err(e) => {
                warn!("@{}: receive ended: {}", stream.socket_id(), e);
                return;
            }
        }
    }
}
