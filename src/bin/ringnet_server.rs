use std::{
    error::Error,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use log::{info, warn};
use ringnet::{
    Server, ServerConfig,
    config::{DEFAULT_MAX_SESSIONS, DEFAULT_PORT},
    protocol::DEFAULT_MAX_PACKET_SIZE,
};

/// Relay server: every packet received is broadcast to all connected sessions.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Size of the session table
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
    /// Largest packet accepted, header included
    #[arg(long, default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: u32,
    /// Completion workers, 0 for one per core
    #[arg(short, long, default_value_t = 0)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        max_sessions: cli.max_sessions,
        max_packet_size: cli.max_packet_size,
        receive_buffer_size: cli.max_packet_size as usize * 2,
        workers: cli.workers,
        ..ServerConfig::with_address(SocketAddr::new(cli.host, cli.port))
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::Release))?;
    }

    let mut server = Server::start(config)?;
    println!("listening on {}", server.local_addr());

    while running.load(Ordering::Acquire) {
        server.process_connect_user_sessions(|session| {
            info!(
                "session {} joined from {:?}",
                session.id(),
                session.peer_addr()
            );
        });
        server.process_received_packet(|session, frame| {
            match server.broadcast(frame.header(), frame.payload()) {
                Ok(n) => info!("relayed packet from session {} to {n} sessions", session.id()),
                Err(e) => warn!("failed to relay packet from session {}: {e}", session.id()),
            }
        });
        server.process_disconnect_user_sessions(|session| {
            info!("session {} left", session.id());
        });

        thread::sleep(Duration::from_millis(1));
    }

    server.shutdown();
    Ok(())
}
