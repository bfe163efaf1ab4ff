use anyhow::Result;
use clap::{Parser, Subcommand};
use lanmsg_core::{Config, Direction, Event, EventReceiver, FileOffer, LanmsgCore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "lanmsg")]
#[command(about = "IPMSG/FeiQ compatible LAN messenger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Display name announced to the segment
    #[arg(short, long)]
    name: Option<String>,

    /// Group name announced alongside the nickname
    #[arg(short, long)]
    group: Option<String>,

    /// UDP control / TCP transfer port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory accepted files are saved into
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Expire peers unseen for this many seconds (off by default)
    #[arg(long)]
    peer_expiry: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat mode (the default)
    Chat,
    /// Print the wire protocol summary
    Protocol,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("lanmsg_core=debug,lanmsg_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::default();
    if let Some(name) = cli.name {
        config.nickname = name;
    }
    if let Some(group) = cli.group {
        config.group = group;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(save_dir) = cli.save_dir {
        config.save_dir = save_dir;
    }
    config.peer_expiry_secs = cli.peer_expiry;

    match cli.command {
        Some(Commands::Protocol) => {
            print_protocol_info();
            Ok(())
        }
        Some(Commands::Chat) | None => run_chat(config).await,
    }
}

async fn run_chat(config: Config) -> Result<()> {
    let default_port = config.port;
    let (mut core, events) = LanmsgCore::new(config);
    core.start().await?;

    println!("💬 LanMsg started as '{}' on port {}", core.config().nickname, default_port);
    println!("   Commands: /peers /msg <ip[:port]> <text> /send <ip[:port]> <path>");
    println!("             /accept <n> [dir] /decline <n> /quit");

    // Offers are numbered as they arrive so /accept can refer to them.
    let offers: Arc<Mutex<Vec<FileOffer>>> = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(print_events(events, Arc::clone(&offers)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match handle_command(&core, &offers, &line, default_port).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => println!("⚠️  {}", e),
        }
    }

    core.stop().await;
    Ok(())
}

/// Returns Ok(true) when the user asked to quit.
async fn handle_command(
    core: &LanmsgCore,
    offers: &Mutex<Vec<FileOffer>>,
    line: &str,
    default_port: u16,
) -> Result<bool> {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or("");
    match command {
        "/quit" | "/exit" => return Ok(true),
        "/peers" => {
            let peers = core.peers();
            if peers.is_empty() {
                println!("No peers online");
            } else {
                for peer in peers {
                    let group = if peer.group.is_empty() { "-" } else { peer.group.as_str() };
                    println!("  [{}] {} @ {}:{}", group, peer.nickname, peer.addr, peer.udp_port);
                }
            }
        }
        "/msg" => {
            let addr = parse_addr(parts.next(), default_port)?;
            let text = parts.next().unwrap_or("");
            if text.is_empty() {
                anyhow::bail!("usage: /msg <ip[:port]> <text>");
            }
            let packet_no = core.send_text(addr, text).await?;
            println!("📤 Sent (packet {})", packet_no);
        }
        "/send" => {
            let addr = parse_addr(parts.next(), default_port)?;
            let path = PathBuf::from(parts.next().unwrap_or(""));
            if path.as_os_str().is_empty() {
                anyhow::bail!("usage: /send <ip[:port]> <path>");
            }
            let token = core.offer_file(addr, &path, "").await?;
            println!("📎 Offered {:?} (token {})", path, token);
        }
        "/accept" => {
            let index: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: /accept <n> [dir]"))?;
            let save_dir = parts.next().map(PathBuf::from);
            let offer = offers
                .lock()
                .unwrap()
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such offer: {}", index))?;
            for file in &offer.files {
                let token = core.accept_file(&offer, file, save_dir.as_deref()).await?;
                println!("📥 Accepting {} (token {})", file.filename, token);
            }
        }
        "/decline" => {
            let index: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("usage: /decline <n>"))?;
            let offer = offers
                .lock()
                .unwrap()
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such offer: {}", index))?;
            for file in &offer.files {
                core.decline_file(&offer, file);
            }
            println!("🚫 Declined offer {}", index);
        }
        "/help" => {
            println!("  /peers                      list known peers");
            println!("  /msg <ip[:port]> <text>     send a message");
            println!("  /send <ip[:port]> <path>    offer a file");
            println!("  /accept <n> [dir]           accept offer n");
            println!("  /decline <n>                decline offer n");
            println!("  /quit                       broadcast exit and leave");
        }
        _ => anyhow::bail!("unknown command: {} (try /help)", command),
    }
    Ok(false)
}

fn parse_addr(arg: Option<&str>, default_port: u16) -> Result<SocketAddr> {
    let arg = arg.ok_or_else(|| anyhow::anyhow!("missing address"))?;
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = arg
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid address: {}", arg))?;
    Ok(SocketAddr::new(ip, default_port))
}

async fn print_events(mut events: EventReceiver, offers: Arc<Mutex<Vec<FileOffer>>>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::PeerOnline { peer } => {
                println!("🟢 {} is online ({})", peer.nickname, peer.addr);
            }
            Event::PeerOffline { peer } => {
                println!("🔴 {} went offline ({})", peer.nickname, peer.addr);
            }
            Event::Message { sender, text, from, .. } => {
                println!("💬 {} [{}]: {}", sender, from.ip(), text);
            }
            Event::MessageDelivered { packet_no, .. } => {
                println!("✅ Delivered (packet {})", packet_no);
            }
            Event::FileOffer { offer } => {
                let mut offers = offers.lock().unwrap();
                let index = offers.len();
                for file in &offer.files {
                    println!(
                        "📎 Offer {} from {}: {} ({} bytes), /accept {}",
                        index, offer.sender, file.filename, file.size, index
                    );
                }
                offers.push(offer);
            }
            Event::FileProgress { .. } => {}
            Event::FileComplete { token, direction, path } => match direction {
                Direction::Inbound => println!("✅ Received {:?} (token {})", path, token),
                Direction::Outbound => println!("✅ Sent {:?} (token {})", path, token),
            },
            Event::FileError { token, reason, .. } => {
                println!("❌ Transfer {} failed: {}", token, reason);
            }
        }
    }
}

fn print_protocol_info() {
    println!("LanMsg wire protocol (IPMSG/FeiQ compatible)");
    println!("  frame    version:packetNo:sender:host:command:extra");
    println!("  version  1");
    println!("  port     2425 (UDP control, TCP bulk transfer)");
    println!("  modes    1 entry, 2 exit, 3 ans-entry, 0x20 message,");
    println!("           0x21 receipt, 0x60 get-file-data");
    println!("  options  0x100 delivery check, 0x200000 file attach");
}
