use std::{
    error::Error,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use clap::Parser;
use ringnet::{
    Client, ClientConfig, Header,
    cli::{Input, PACKET_CHAT, PromptError, prompt},
};

/// Interactive chat client for `ringnet_server`.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:7777")]
    address: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut client = Client::connect(cli.address, ClientConfig::default())?;
    let done = AtomicBool::new(false);

    let result = thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) && client.is_connected() {
                client.process_received_packet(|frame| {
                    if frame.kind() == PACKET_CHAT {
                        println!("< {}", String::from_utf8_lossy(frame.payload()));
                    }
                });
                thread::sleep(Duration::from_millis(10));
            }
        });

        let result = chat(&client);
        done.store(true, Ordering::Release);
        result
    });

    client.disconnect();
    result
}

fn chat(client: &Client) -> Result<(), Box<dyn Error>> {
    loop {
        let input = match prompt(io::stdin().lock(), io::stdout().lock()) {
            Ok(input) => input,
            Err(PromptError::Unrecognized(cmd)) => {
                eprintln!("unrecognized command '{cmd}'");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match input {
            Input::Quit => return Ok(()),
            Input::Chat(line) if line.is_empty() => {}
            Input::Chat(line) => {
                let header = Header::new(PACKET_CHAT, line.len())?;
                client.send(header, line.as_bytes())?;
            }
        }
    }
}
