// Nebula signaling shell
// Brings up a signaling session for one identity, prints calls, sync payloads and errors,
// and optionally pushes a sync payload to another peer

use std::io;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::{info, warn};

use nebula_signal::{config, debug, start_signaling, SessionError, SignalClient};

struct Args {
    identity: String,
    sync: Option<(String, Value)>,
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    debug::init(args.debug)?;

    let config = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        config::Config::default()
    });

    let client = start_signaling(&config.signaling.relay_url, config.manager_settings());

    client.set_on_incoming_call(|call| {
        println!("📞 Incoming call {} from {}", call.call_id, call.peer);
    })?;
    client.set_on_error(|err: &SessionError| {
        eprintln!("⚠️  Signaling error: {}", err);
    })?;
    client.set_sync_callback(|payload| {
        println!("🔄 Sync payload: {}", payload);
    })?;

    client.init(&args.identity)?;
    let timeout = Duration::from_secs(config.signaling.connection_timeout_secs);
    wait_for_ready(&client, timeout).await?;
    println!("✅ Signed in as {} via {}", args.identity, config.signaling.relay_url);

    if let Some((target, payload)) = args.sync {
        let connection = client.connect(&target).await?;
        client.send_sync(&connection, payload).await?;
        println!("📤 Sync payload sent to {}", target);
    }

    println!("Press Ctrl-C to sign out");
    tokio::signal::ctrl_c().await?;

    info!("Signing out");
    client.cleanup()?;
    // Let the driver tear the socket down before the runtime exits
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let program = args.first().map(String::as_str).unwrap_or("nebula-signal");
    let mut identity = None;
    let mut sync = None;
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--identity" | "-i" => {
                identity = Some(args.get(i + 1).context("--identity requires a value")?.clone());
                i += 2;
            }
            "--sync" | "-s" => {
                let (Some(target), Some(json)) = (args.get(i + 1), args.get(i + 2)) else {
                    bail!("--sync requires a target and a JSON payload");
                };
                let payload: Value =
                    serde_json::from_str(json).context("--sync payload is not valid JSON")?;
                sync = Some((target.clone(), payload));
                i += 3;
            }
            "--debug" | "-d" => {
                debug = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage(program);
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_usage(program);
                std::process::exit(1);
            }
        }
    }

    let Some(identity) = identity else {
        print_usage(program);
        std::process::exit(1);
    };

    Ok(Args {
        identity,
        sync,
        debug,
    })
}

fn print_usage(program: &str) {
    println!("Nebula Signal - peer signaling session manager");
    println!();
    println!("Usage:");
    println!(
        "  {} --identity <id>                        # Sign in and wait for calls",
        program
    );
    println!(
        "  {} --identity <id> --sync <peer> <json>   # Sign in and push a sync payload",
        program
    );
    println!();
    println!("Options:");
    println!("  --debug    Write debug logs to {}", debug::LOG_FILE_PATH);
    println!();
    println!("Relay URL, ICE servers and timings are read from:");
    println!("  {}", config::get_config_path().display());
}

async fn wait_for_ready(client: &SignalClient, timeout: Duration) -> Result<(), io::Error> {
    use std::io::Write;

    let spinner = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let mut frame = 0;
    let start = Instant::now();

    while !client.is_ready().await {
        if start.elapsed() > timeout {
            eprint!("\r\x1b[K");
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Timed out waiting for the signaling relay",
            ));
        }
        eprint!("\r{} Connecting to signaling relay...", spinner[frame]);
        io::stderr().flush()?;
        frame = (frame + 1) % spinner.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    eprint!("\r\x1b[K");
    Ok(())
}
