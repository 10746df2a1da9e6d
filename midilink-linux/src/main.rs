// MidiLink: bridge the local MIDI graph to RTP-MIDI (AppleMIDI) peers.

use midilink_linux::config::{self, ConnectTarget};
use midilink_linux::mdns::{DiscoveryEvent, NullPublisher};
use midilink_linux::registry::Registry;
use midilink_linux::seq::NullSequencer;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("midilink-linux {} — RTP-MIDI bridge daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    midilink-linux [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Publishes local MIDI ports as RTP-MIDI sessions and exposes");
    println!("    discovered remote sessions as local virtual ports. MIDI");
    println!("    events travel both ways with byte-level fidelity.");
    println!();
    println!("    Sessions     UDP 5004/5005    (AppleMIDI control + MIDI)");
    println!("    Discovery    _apple-midi._udp (multicast DNS)");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/midilink/config.toml");
    println!("      /etc/midilink/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      name = \"studio\"");
    println!("      ports = [5004]");
    println!("      connect_to = [\"pad:10.0.0.7\", \"10.0.0.9:5008\"]");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    MIDILINK_NAME          Announced daemon name");
    println!("    MIDILINK_PORTS         Comma separated server ports");
    println!("    MIDILINK_CONNECT_TO    Comma separated connect targets");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("midilink-linux {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("midilink-linux: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("midilink_core=info".parse()?)
                .add_directive("midilink_linux=info".parse()?),
        )
        .init();

    let cfg = config::load();
    let targets = cfg
        .connect_to
        .iter()
        .map(|spec| ConnectTarget::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // The sequencer and mDNS collaborators feed these channels; startup
        // connect targets enter through the discovery path so they share
        // the dedup and subscription logic with browsed endpoints.
        let (seq_tx, seq_rx) = tokio::sync::mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut registry = Registry::new(
            cfg.name.clone(),
            Box::new(NullSequencer::new()),
            Box::new(NullPublisher),
        );
        for port in &cfg.ports {
            match registry.add_import_server(*port).await {
                Ok(control_port) => info!("{} listening on {control_port}", cfg.name),
                Err(err) => warn!("cannot open server on port {port}: {err}"),
            }
        }
        for target in targets {
            let _ = discovery_tx.send(DiscoveryEvent::Discovered {
                name: target.name,
                address: target.host,
                port: target.port,
            });
        }
        tokio::spawn(registry.run(seq_rx, discovery_rx));

        let result = shutdown_signal().await;
        drop(seq_tx);
        drop(discovery_tx);
        result
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit.
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
