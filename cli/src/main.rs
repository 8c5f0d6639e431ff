// attendbeacon: operator CLI for the BLE attendance session protocol
//
// Inspect tokens and beacon payloads, check organization isolation, and run a
// full officer/member session against the in-memory radio and backend.

mod config;
mod simulate;

use anyhow::{Context, Result};
use attendbeacon_core::{
    build, encode, organization_of, validate, Organization, RawBeacon, SessionToken,
};
use clap::{Parser, Subcommand};
use colored::*;

#[derive(Parser)]
#[command(name = "attendbeacon")]
#[command(about = "Attendance Beacon: BLE session check-in tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session token utilities
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Organization registry
    Org {
        #[command(subcommand)]
        action: OrgAction,
    },
    /// Beacon payload utilities
    Beacon {
        #[command(subcommand)]
        action: BeaconAction,
    },
    /// Run an officer/member session end to end in memory
    Simulate {
        #[arg(short, long)]
        org: Option<String>,
        #[arg(short, long, default_value = "Weekly Meeting")]
        title: String,
        /// Session lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print the 16-bit digest of a token
    Encode { token: String },
    /// Check whether a string is a well-formed token
    Check { token: String },
    /// Generate random tokens
    Generate {
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum OrgAction {
    List,
}

#[derive(Subcommand)]
enum BeaconAction {
    /// Build the advertised payload for a token
    Build {
        token: String,
        #[arg(short, long)]
        org: Option<String>,
    },
    /// Validate received major/minor fields for an observer organization
    Validate {
        major: u16,
        minor: u16,
        #[arg(short, long)]
        org: Option<String>,
    },
    /// Name the organization a major value belongs to
    Classify { major: u16 },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Token { action } => cmd_token(action),
        Commands::Org { action } => cmd_org(action),
        Commands::Beacon { action } => cmd_beacon(action),
        Commands::Simulate { org, title, ttl } => cmd_simulate(org, title, ttl).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_token(action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Encode { token } => {
            let digest = encode(&token).context("Cannot encode token")?;
            println!("{}", digest);
        }
        TokenAction::Check { token } => match SessionToken::parse(&token) {
            Ok(parsed) => {
                println!("  {} Valid token (digest {})", "✓".green(), parsed.digest());
            }
            Err(err) => {
                println!("  {} {}", "✗".red(), err);
                std::process::exit(1);
            }
        },
        TokenAction::Generate { count } => {
            let mut rng = rand::thread_rng();
            for _ in 0..count {
                let token = SessionToken::generate(&mut rng);
                println!("{}  {}", token.as_str().bright_yellow(), token.digest());
            }
        }
    }
    Ok(())
}

fn cmd_org(action: OrgAction) -> Result<()> {
    match action {
        OrgAction::List => {
            println!("{}", "Organizations".bold());
            for org in Organization::known() {
                println!(
                    "  {:<6} code={}  id={}  {}",
                    org.slug().bright_cyan(),
                    org.code(),
                    org.advertisement_id(),
                    org.display_name()
                );
            }
        }
    }
    Ok(())
}

fn resolve_org(explicit: Option<String>) -> Result<String> {
    match explicit {
        Some(slug) => Ok(slug),
        None => Ok(config::Config::load()?.default_org),
    }
}

fn cmd_beacon(action: BeaconAction) -> Result<()> {
    match action {
        BeaconAction::Build { token, org } => {
            let slug = resolve_org(org)?;
            let payload = build(&token, &slug).context("Cannot build beacon payload")?;
            println!("{}", "Beacon Payload".bold());
            println!("  Identifier: {}", payload.identifier.to_string().bright_cyan());
            println!("  Major:      {}", payload.major);
            println!("  Minor:      {}", payload.minor.to_string().bright_yellow());
        }
        BeaconAction::Validate { major, minor, org } => {
            let slug = resolve_org(org)?;
            if validate(major, minor, &slug) {
                println!("  {} Accepted for {}", "✓".green(), slug);
            } else {
                println!("  {} Rejected for {}", "✗".red(), slug);
                std::process::exit(1);
            }
        }
        BeaconAction::Classify { major } => {
            let beacon = RawBeacon {
                identifier: uuid::Uuid::nil(),
                major,
                minor: 0,
                rssi: 0,
                timestamp: chrono::Utc::now(),
            };
            println!("{}", organization_of(&beacon));
        }
    }
    Ok(())
}

async fn cmd_simulate(org: Option<String>, title: String, ttl: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let org = match org {
        Some(slug) => Organization::from_slug(&slug),
        None => config.organization(),
    };
    if !org.is_known() {
        anyhow::bail!("Unknown organization");
    }

    println!("{}", "Simulating attendance session...".bold());
    println!();
    let report = simulate::run(org, &title, ttl, config.protocol).await?;

    println!();
    println!("{}", "Summary".bold());
    println!("  Organization: {}", report.organization.display_name());
    println!("  Event:        {}", report.event_id);
    println!("  Digest:       {}", report.digest);
    let passed = report.recorded && report.duplicate_collapsed && report.foreign_rejected;
    if passed {
        println!("  {}", "All checks passed".green().bold());
        Ok(())
    } else {
        anyhow::bail!("Simulation checks failed")
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("  {} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
            println!();
            println!("  File: {}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
