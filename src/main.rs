//! FrameNet demo - ping and broadcast over a FrameNet server
//!
//! `framenet server` accepts clients, echoes pings and relays "message
//! all" requests. `framenet client` reads commands from stdin: `1` pings
//! the server, `2` greets every other client, `q` quits.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use framenet::config::{self, Config};
use framenet::network::AcceptAll;
use framenet::protocol::DEFAULT_PORT;
use framenet::{AddressCounter, Client, Connection, Message, Server, ServerHooks};

/// FrameNet - message-oriented TCP endpoints
#[derive(Parser)]
#[command(name = "framenet")]
#[command(author = "FrameNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Ping/broadcast demo over FrameNet endpoints", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo server
    Server {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Accept everyone and ignore messages
        #[arg(long)]
        silent: bool,
    },

    /// Run the interactive demo client
    Client {
        /// Server host to connect to
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Message kinds spoken by the demo programs.
///
/// There is no deny message: a refused client is closed before the
/// handshake, so nothing can be written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
enum MsgType {
    ServerAccept,
    ServerPing,
    MessageAll,
    ServerMessage,
}

impl From<MsgType> for u32 {
    fn from(kind: MsgType) -> u32 {
        kind as u32
    }
}

impl TryFrom<u32> for MsgType {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(MsgType::ServerAccept),
            1 => Ok(MsgType::ServerPing),
            2 => Ok(MsgType::MessageAll),
            3 => Ok(MsgType::ServerMessage),
            other => Err(other),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, silent } => {
            run_server(&config, port, silent)?;
        }
        Commands::Client { server, port } => {
            run_client(&config, &server, port)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Server-side behaviour of the demo
struct DemoServer {
    per_address: AddressCounter,
    max_per_address: u32,
}

impl ServerHooks<MsgType> for DemoServer {
    // Refusal is a silent close; the client sees the socket drop
    fn on_client_connect(&self, connection: &Connection<MsgType>) -> bool {
        let ip = connection.remote_addr().ip();
        if !self.per_address.try_acquire(ip, self.max_per_address) {
            tracing::warn!(
                "{} already holds {} connections, denying",
                ip,
                self.max_per_address
            );
            return false;
        }

        connection.send(Message::new(MsgType::ServerAccept));
        true
    }

    fn on_client_validated(&self, connection: &Connection<MsgType>) {
        tracing::info!("[{}] Client validated", connection.id());
    }

    fn on_client_disconnect(&self, connection: &Connection<MsgType>) {
        self.per_address.decrement(connection.remote_addr().ip());
        tracing::info!("[{}] Client has been disconnected", connection.id());
    }

    fn on_message(
        &self,
        server: &Server<MsgType>,
        origin: &Connection<MsgType>,
        message: Message<MsgType>,
    ) {
        match message.kind() {
            MsgType::ServerPing => {
                tracing::info!("[{}] Server ping", origin.id());
                server.send_to_client(origin, message);
            }
            MsgType::MessageAll => {
                tracing::info!("[{}] Message all", origin.id());
                let mut greeting = Message::new(MsgType::ServerMessage);
                greeting.push(&origin.id());
                let clients = server.get_online_clients();
                server.broadcast_message(&greeting, &clients, Some(origin), true);
            }
            other => {
                tracing::warn!("[{}] Unexpected message kind {:?}", origin.id(), other);
            }
        }
    }
}

/// Run the demo server until the process is killed
fn run_server(config: &Config, port: Option<u16>, silent: bool) -> anyhow::Result<()> {
    let net_config = config.network_config();
    let port = port.unwrap_or(net_config.port);

    let mut server = if silent {
        Server::new(net_config, AcceptAll)
    } else {
        let hooks = DemoServer {
            per_address: AddressCounter::new(),
            max_per_address: config.network.max_connections_per_ip,
        };
        Server::new(net_config, hooks)
    };

    let addr = server.start(port)?;

    println!("\n========================================");
    println!("  FrameNet Server '{}' Running", config.general.name);
    println!("========================================");
    println!("  Address: {}", addr);
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    loop {
        server.update(usize::MAX, true);
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Print one message received from the server
fn handle_server_message(mut message: Message<MsgType>) {
    match message.kind() {
        MsgType::ServerAccept => println!("Server has accepted the connection."),
        MsgType::ServerPing => match message.pop::<u64>() {
            Ok(sent) => {
                let elapsed = now_micros().saturating_sub(sent);
                println!("Ping: {:.3} ms", elapsed as f64 / 1000.0);
            }
            Err(e) => tracing::warn!("Malformed ping reply: {}", e),
        },
        MsgType::ServerMessage => match message.pop::<u64>() {
            Ok(client_id) => println!("Hello from client {}", client_id),
            Err(e) => tracing::warn!("Malformed server message: {}", e),
        },
        MsgType::MessageAll => tracing::warn!("Unexpected {}", message),
    }
}

/// Run the interactive demo client
fn run_client(config: &Config, host: &str, port: Option<u16>) -> anyhow::Result<()> {
    let net_config = config.network_config();
    let port = port.unwrap_or(if net_config.port == 0 {
        DEFAULT_PORT
    } else {
        net_config.port
    });

    let mut client = Client::new(net_config);
    println!("Connecting to {}:{}...", host, port);
    client.connect(host, port)?;

    let incoming = client.incoming();
    let connection = client
        .connection()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Connection vanished right after connecting"))?;
    let quit = Arc::new(AtomicBool::new(false));

    let pump = {
        let quit = quit.clone();
        std::thread::Builder::new()
            .name("framenet-pump".to_string())
            .spawn(move || {
                while !quit.load(Ordering::SeqCst) {
                    if !connection.is_connected() {
                        println!("Disconnected by the server (refused or shutting down).");
                        quit.store(true, Ordering::SeqCst);
                        break;
                    }
                    if incoming.wait_timeout(Duration::from_millis(200)) {
                        while let Some(received) = incoming.pop_front() {
                            handle_server_message(received.message);
                        }
                    }
                }
            })?
    };

    println!("Enter 1 to ping, 2 to message everyone, q to quit.");
    for line in std::io::stdin().lock().lines() {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        match line?.trim() {
            "1" => {
                let mut ping = Message::new(MsgType::ServerPing);
                ping.push(&now_micros());
                client.send(ping);
            }
            "2" => client.send(Message::new(MsgType::MessageAll)),
            "q" | "quit" => break,
            "" => {}
            other => println!("Unknown command '{}'", other),
        }
    }

    quit.store(true, Ordering::SeqCst);
    if pump.join().is_err() {
        tracing::error!("Message pump panicked");
    }
    client.disconnect();

    Ok(())
}
