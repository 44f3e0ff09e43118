//! DKG Party CLI
//!
//! Command-line participant node:
//! - Generate a long-term roster keypair
//! - Announce a session for a roster
//! - Join a session and run the DKG to produce a key share

use anyhow::Result;
use clap::{Parser, Subcommand};
use dkg_party::{KeyShare, PartyClient};
use k256::ecdsa::SigningKey;
use rand_core::OsRng;
use std::path::PathBuf;
use tracing::{info, Level};

/// DKG Party - threshold key-generation participant
#[derive(Parser)]
#[command(name = "dkg-party")]
#[command(about = "Participant node for coordinated threshold DKG")]
#[command(version)]
struct Cli {
    /// Coordinator WebSocket URL
    #[arg(short, long, env = "COORDINATOR_URL", default_value = "ws://127.0.0.1:8080/v1/ws")]
    url: String,

    /// Roster identifier of this participant (1-based)
    #[arg(short, long, env = "PARTY_ID")]
    identifier: u16,

    /// Data directory for keys and key shares
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a roster keypair and print the public key
    GenKey,

    /// Announce a session for a roster file and print the session id
    Announce {
        /// Threshold (t-of-n)
        #[arg(short, long)]
        min_signers: u16,

        /// Group label
        #[arg(short, long)]
        group_id: String,

        /// Roster file: JSON list of [identifier, pubkey_hex]
        #[arg(short, long)]
        roster: PathBuf,
    },

    /// Join a session and run the DKG
    Keygen {
        /// Session id from the announcer
        #[arg(short, long)]
        session: String,

        /// Threshold (t-of-n)
        #[arg(short, long)]
        min_signers: u16,

        /// Roster file: JSON list of [identifier, pubkey_hex]
        #[arg(short, long)]
        roster: PathBuf,
    },

    /// Show the stored key share
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    // Ensure data directory exists
    std::fs::create_dir_all(&cli.dest)?;

    match cli.command {
        Commands::GenKey => gen_key(&cli)?,
        Commands::Announce {
            min_signers,
            ref group_id,
            ref roster,
        } => run_announce(&cli, min_signers, group_id, roster).await?,
        Commands::Keygen {
            ref session,
            min_signers,
            ref roster,
        } => run_keygen(&cli, session, min_signers, roster).await?,
        Commands::Info => show_info(&cli)?,
    }

    Ok(())
}

fn gen_key(cli: &Cli) -> Result<()> {
    let key = SigningKey::random(&mut OsRng);
    let path = key_path(cli);
    std::fs::write(&path, hex::encode(key.to_bytes()))?;

    let pubkey = hex::encode(key.verifying_key().to_sec1_bytes());
    info!(identifier = cli.identifier, path = ?path, "Roster keypair generated");
    println!("Public Key: {}", pubkey);

    Ok(())
}

async fn run_announce(
    cli: &Cli,
    min_signers: u16,
    group_id: &str,
    roster_path: &PathBuf,
) -> Result<()> {
    let roster = load_roster(roster_path)?;

    let mut client = PartyClient::connect(&cli.url).await?;
    let session = client
        .announce_session(min_signers, group_id, &roster)
        .await?;

    info!(
        session = %session,
        group_id,
        min_signers,
        max_signers = roster.len(),
        "Session announced"
    );
    println!("Session: {}", session);

    Ok(())
}

async fn run_keygen(
    cli: &Cli,
    session: &str,
    min_signers: u16,
    roster_path: &PathBuf,
) -> Result<()> {
    let key = load_key(cli)?;
    let roster = load_roster(roster_path)?;

    info!(
        identifier = cli.identifier,
        session = %session,
        "Joining DKG session"
    );

    let mut client = PartyClient::connect(&cli.url).await?;
    client.login(&key).await?;

    let key_share = client
        .run_dkg(session, cli.identifier, min_signers, &key, &roster)
        .await?;

    let share_path = share_path(cli);
    std::fs::write(&share_path, serde_json::to_string_pretty(&key_share)?)?;

    info!(
        group_verifying_key = %hex::encode(&key_share.group_verifying_key),
        path = ?share_path,
        "DKG completed, key share saved"
    );
    println!(
        "Group Verifying Key: {}",
        hex::encode(&key_share.group_verifying_key)
    );

    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let json = std::fs::read_to_string(share_path(cli))?;
    let share: KeyShare = serde_json::from_str(&json)?;

    println!("Key Share Info:");
    println!("  Identifier: {}", share.identifier);
    println!("  Min Signers: {}", share.min_signers);
    println!("  Max Signers: {}", share.max_signers);
    println!("  Session: {}", share.session_id);
    println!(
        "  Group Verifying Key: {}",
        hex::encode(&share.group_verifying_key)
    );

    Ok(())
}

fn key_path(cli: &Cli) -> PathBuf {
    cli.dest.join(format!("party.{}.key", cli.identifier))
}

fn share_path(cli: &Cli) -> PathBuf {
    cli.dest.join(format!("keyshare.{}.json", cli.identifier))
}

fn load_key(cli: &Cli) -> Result<SigningKey> {
    let encoded = std::fs::read_to_string(key_path(cli))?;
    let bytes = hex::decode(encoded.trim())?;
    Ok(SigningKey::from_slice(&bytes)?)
}

fn load_roster(path: &PathBuf) -> Result<Vec<(u16, Vec<u8>)>> {
    let json = std::fs::read_to_string(path)?;
    let entries: Vec<(u16, String)> = serde_json::from_str(&json)?;
    entries
        .into_iter()
        .map(|(identifier, pubkey)| Ok((identifier, hex::decode(&pubkey)?)))
        .collect()
}
