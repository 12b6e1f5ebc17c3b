use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pin_tracker::{
    Cid, Pin, PinInfo, PinTracker, TrackerError,
    ipfs::{self, IpfsClient},
    settings::{self, Settings},
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time,
};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "pin-tracker",
    version,
    about = "Track pin and unpin operations against a local IPFS node"
)]
struct Cli {
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pin a CID and wait for the result
    Pin {
        cid: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Unpin a CID and wait for the result
    Unpin { cid: String },
    /// Show what the daemon has pinned
    Status { cid: Option<String> },
    /// Serve line commands from stdin until ctrl-c or EOF
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pin_tracker=debug"));
    fmt().with_env_filter(env_filter).json().init();

    let cli = Cli::parse();
    let cfg = settings::load(cli.config.as_deref())?;
    tracing::info!(?cfg, "effective_config");

    let ipfs = Arc::new(ipfs::Client::new(
        &cfg.ipfs.api_url,
        cfg.ipfs.request_timeout(),
    )?);

    match cli.command {
        Commands::Status { cid } => print_remote(ipfs.as_ref(), cid.as_deref()).await?,
        Commands::Pin { cid, name } => {
            let tracker = PinTracker::new(&cfg.tracker, ipfs)?;
            let mut pin = Pin::new(&cid);
            if let Some(name) = name {
                pin = pin.with_name(name);
            }
            tracker.track(pin)?;
            let info = wait_settled(&tracker, &Cid::parse(&cid)?).await;
            tracker.shutdown().await?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Commands::Unpin { cid } => {
            let tracker = PinTracker::new(&cfg.tracker, ipfs)?;
            tracker.untrack(&cid)?;
            let info = wait_settled(&tracker, &Cid::parse(&cid)?).await;
            tracker.shutdown().await?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Commands::Run => run(&cfg, ipfs).await?,
    }

    Ok(())
}

async fn wait_settled<C: IpfsClient + 'static>(tracker: &PinTracker<C>, cid: &Cid) -> PinInfo {
    loop {
        let info = tracker.status(cid);
        if !info.status.is_active() {
            return info;
        }
        time::sleep(Duration::from_millis(200)).await;
    }
}

async fn print_remote(ipfs: &ipfs::Client, cid: Option<&str>) -> Result<()> {
    let out = match cid {
        Some(cid) => {
            let cid = Cid::parse(cid)?;
            let status = ipfs.pin_ls_single(&cid).await?;
            json!({ "cid": cid, "remote": status })
        }
        None => json!(ipfs.pin_ls_all().await?),
    };
    println!("{out}");
    Ok(())
}

async fn run(cfg: &Settings, ipfs: Arc<ipfs::Client>) -> Result<()> {
    let tracker = PinTracker::new(&cfg.tracker, ipfs)?;

    let sync_secs = cfg.tracker.sync_interval_secs;
    let mut sync = time::interval(Duration::from_secs(sync_secs.max(1)));
    sync.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("tracker_running");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("shutdown");
                break;
            }
            _ = sync.tick(), if sync_secs > 0 => {
                match tracker.sync_all().await {
                    Ok(changed) => tracing::debug!(changed = changed.len(), "sync_done"),
                    Err(e) => tracing::warn!(error = %e, "sync_failed"),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("stdin_closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&tracker, &line)
                    .await
                    .unwrap_or_else(|e| json!({ "error": e.to_string() }));
                println!("{reply}");
            }
        }
    }

    tracker.shutdown().await?;
    Ok(())
}

async fn handle_line<C: IpfsClient + 'static>(
    tracker: &PinTracker<C>,
    line: &str,
) -> Result<Value, TrackerError> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let arg = words.next();

    let reply = match (cmd, arg) {
        ("pin", Some(cid)) => {
            let mut pin = Pin::new(cid);
            if let Some(name) = words.next() {
                pin = pin.with_name(name);
            }
            tracker.track(pin)?;
            json!(tracker.status(&Cid::parse(cid)?))
        }
        ("unpin", Some(cid)) => {
            tracker.untrack(cid)?;
            json!(tracker.status(&Cid::parse(cid)?))
        }
        ("status", Some(cid)) => json!(tracker.status(&Cid::parse(cid)?)),
        ("status", None) => json!(tracker.status_all()),
        ("sync", Some(cid)) => json!(tracker.sync(&Cid::parse(cid)?).await?),
        ("sync", None) => match tracker.sync_all().await {
            Ok(changed) => json!(changed),
            Err(TrackerError::Sync { partial, failures }) => json!({
                "changed": partial,
                "failures": failures
                    .iter()
                    .map(|(cid, e)| json!({ "cid": cid, "error": e }))
                    .collect::<Vec<_>>(),
            }),
            Err(e) => return Err(e),
        },
        ("recover", Some(cid)) => json!(tracker.recover(&Cid::parse(cid)?)?),
        ("recover", None) => json!(tracker.recover_all()?),
        _ => json!({ "error": format!("unknown command: {line}") }),
    };
    Ok(reply)
}
