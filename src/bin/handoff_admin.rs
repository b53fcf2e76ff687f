//! handoff-admin: operational commands against a cluster's store and relay
//!
//! ## Usage
//! ```text
//! handoff-admin sweep <server>            release a crashed server's checkouts
//! handoff-admin history <uuid>            list retained snapshots, newest first
//! handoff-admin pin <uuid> <version>      exempt a snapshot from pruning
//! handoff-admin unpin <uuid> <version>    return a snapshot to normal retention
//! ```
//!
//! ## Configuration
//! Loaded like every handoff process: `handoff.yaml`, then `HANDOFF_CONFIG`,
//! then `HANDOFF__*` environment overrides. Logging via `HANDOFF_LOG`.

use tracing::{info, warn};
use uuid::Uuid;

use handoff::config::Config;
use handoff::relay::{MessageType, RelayMessage, Target};
use handoff::sync::SyncContext;
use handoff::utils::bootstrap::{build_context, init_tracing};

const SOURCE: &str = "handoff-admin";

const USAGE: &str = "usage: handoff-admin <sweep <server> | history <uuid> | pin <uuid> <version> | unpin <uuid> <version>>";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, PartialEq)]
enum Command {
    Sweep(String),
    History(Uuid),
    SetPinned { user: Uuid, version: Uuid, pinned: bool },
}

fn parse_command(args: &[String]) -> Result<Command, BoxError> {
    let Some(command) = args.first() else {
        return Err(USAGE.into());
    };
    let command = match (command.as_str(), &args[1..]) {
        ("sweep", [server]) => Command::Sweep(server.clone()),
        ("history", [user]) => Command::History(Uuid::parse_str(user)?),
        ("pin", [user, version]) => Command::SetPinned {
            user: Uuid::parse_str(user)?,
            version: Uuid::parse_str(version)?,
            pinned: true,
        },
        ("unpin", [user, version]) => Command::SetPinned {
            user: Uuid::parse_str(user)?,
            version: Uuid::parse_str(version)?,
            pinned: false,
        },
        _ => return Err(USAGE.into()),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let config = Config::load(None).map_err(|e| e.to_string())?;
    let ctx = build_context(config).await?;

    match command {
        Command::Sweep(server) => sweep(&ctx, &server).await?,
        Command::History(user) => history(&ctx, user).await?,
        Command::SetPinned {
            user,
            version,
            pinned,
        } => set_pinned(&ctx, user, version, pinned).await?,
    }

    ctx.relay.close().await?;
    Ok(())
}

async fn sweep(ctx: &SyncContext, server: &str) -> Result<(), BoxError> {
    let released = ctx.relay.clear_checked_out_for_server(server).await?;
    for user in &released {
        let message = RelayMessage::new(MessageType::CheckoutClear, SOURCE, Target::Cluster)
            .with_field(user.to_string());
        if let Err(e) = ctx.relay.publish(message).await {
            warn!(user = %user, error = %e, "Failed to announce checkout clear");
        }
        println!("{}", user);
    }
    info!(server = %server, released = released.len(), "Sweep complete");
    Ok(())
}

async fn history(ctx: &SyncContext, user: Uuid) -> Result<(), BoxError> {
    let Some(known) = ctx.store.get_user(user).await? else {
        return Err(format!("unknown user {}", user).into());
    };
    println!("{}", known);
    for snapshot in ctx.store.get_snapshot_history(user).await? {
        println!(
            "{}  {}  {:<16} {:<12} v{} {:>8}B{}",
            snapshot.version_id(),
            snapshot.timestamp().to_rfc3339(),
            snapshot.save_cause(),
            snapshot.server_name(),
            snapshot.payload().format_version,
            snapshot.payload().data.len(),
            if snapshot.is_pinned() { "  pinned" } else { "" }
        );
    }
    Ok(())
}

async fn set_pinned(
    ctx: &SyncContext,
    user: Uuid,
    version: Uuid,
    pinned: bool,
) -> Result<(), BoxError> {
    if !ctx.store.set_pinned(user, version, pinned).await? {
        return Err(format!("no snapshot {} for user {}", version, user).into());
    }
    info!(user = %user, version = %version, pinned, "Updated snapshot pin");
    Ok(())
}
