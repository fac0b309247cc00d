//! egress-gate: egress filtering daemon for a forwarding gateway.

use clap::{Parser, Subcommand};
use egress_gate::filter::classify;
use egress_gate::{Config, Filter, MemoryNetfilter, Resolver, RuleKind, Settings};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

#[derive(Parser)]
#[command(name = "egress-gate")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Fail-closed egress filtering with nftables", long_about = None)]
struct Cli {
    /// Rule configuration file (YAML or JSON)
    #[arg(short, long, default_value = "/etc/egress-gate/config.yaml")]
    config: PathBuf,

    /// Upstream DNS server, queried in the order given (repeatable)
    #[arg(long = "dns", value_parser = parse_dns_server)]
    dns: Vec<SocketAddr>,

    /// Path to the nft binary
    #[arg(long, default_value = "nft")]
    nft: PathBuf,

    /// nftables table to manage
    #[arg(long, default_value = egress_gate::compiler::DEFAULT_TABLE)]
    table: String,

    /// Do not reload the configuration when the file changes
    #[arg(long)]
    no_watch: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the rules and keep them current until interrupted
    Run,

    /// Validate the configuration and show how each rule compiles
    Check {
        /// Compile in memory and print the nftables JSON that would be applied
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = settings(&cli);

    let result = match cli.command {
        Commands::Run => run(&cli.config, &settings),
        Commands::Check { dry_run } => check(&cli.config, &settings, dry_run),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn settings(cli: &Cli) -> Settings {
    let mut settings = Settings::default()
        .with_nft_path(cli.nft.clone())
        .with_table(cli.table.clone())
        .with_watch(!cli.no_watch);
    if !cli.dns.is_empty() {
        settings = settings.with_servers(cli.dns.clone());
    }
    settings
}

/// Accept `IP` or `IP:PORT`; the port defaults to 53.
fn parse_dns_server(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| format!("invalid DNS server address: {}", s))
}

fn run(config_path: &Path, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    log::info!(
        "Loaded configuration version {} with {} rules",
        config.version,
        config.rules.len()
    );

    enable_ip_forwarding();

    let filter = Filter::from_settings(config, config_path, settings)?;

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        let _ = shutdown_tx.try_send(());
    })?;

    filter.start()?;
    log::info!("Egress filtering active");

    let _ = shutdown_rx.recv();

    filter.stop()?;
    Ok(())
}

fn enable_ip_forwarding() {
    match fs::write(IP_FORWARD, "1") {
        Ok(()) => log::info!("Enabled IPv4 forwarding"),
        Err(e) => log::warn!("Failed to enable IPv4 forwarding: {}", e),
    }
}

fn check(
    config_path: &Path,
    settings: &Settings,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    println!(
        "Configuration version {} is valid: {} rules",
        config.version,
        config.rules.len()
    );

    for rule in &config.rules {
        let kind = classify(rule);
        println!(
            "  [{}] {} {} ({})",
            rule.order,
            rule.action,
            rule.name,
            kind.as_str()
        );
        if let RuleKind::Domain { wildcards, .. } = &kind {
            for pattern in wildcards {
                println!("      {} is matched for updates only", pattern);
            }
        }
    }

    if !dry_run {
        return Ok(());
    }

    let netfilter = Arc::new(MemoryNetfilter::new());
    let resolver = Arc::new(Resolver::new(&settings.resolver)?);
    let filter = Filter::new(config, config_path, resolver, netfilter.clone()).with_watch(false);
    filter.start()?;

    for batch in netfilter.history() {
        println!("{}", serde_json::to_string_pretty(&batch.to_json())?);
    }

    filter.stop()?;
    Ok(())
}
