use std::time::Duration;

use anyhow::Context;
use bililive::{Engine, EngineBuilder, ReconnectPolicy, RoomId, Viewer};
use clap::Parser;
use colored::*;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Room ids to join (short ids are resolved)
    #[arg(required = true)]
    rooms: Vec<RoomId>,

    /// Dispatcher workers. Events of a room stay ordered only with 1
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Print unknown and ignored commands
    #[arg(long)]
    debug: bool,

    /// Hide chat messages that duplicate a storm broadcast
    #[arg(long)]
    storm_filter: bool,

    /// Account uid, used together with --cookie
    #[arg(long, requires = "cookie")]
    uid: Option<u64>,

    /// Cookie of a logged-in account
    #[arg(long, env = "BILILIVE_COOKIE", requires = "uid")]
    cookie: Option<String>,

    /// Consecutive failures after which a room is dropped
    #[arg(long, default_value_t = 10)]
    max_failures: u32,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "bililive=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let viewer = match (args.uid, args.cookie.clone()) {
        (Some(uid), Some(cookie)) => Viewer::authenticated(uid, cookie),
        _ => Viewer::Anonymous,
    };

    let engine = register_printers(
        Engine::builder()
            .workers(args.workers)
            .debug(args.debug)
            .storm_filter(args.storm_filter)
            .viewer(viewer)
            .heartbeat_interval(Duration::from_secs(args.heartbeat.max(1)))
            .reconnect(ReconnectPolicy {
                max_consecutive_failures: args.max_failures.max(1),
                ..Default::default()
            }),
        args.json,
    )
    .build()
    .context("Failed to build engine")?;

    engine.start().context("Failed to start engine")?;
    engine
        .join(&args.rooms)
        .with_context(|| format!("Failed to join rooms {:?}", args.rooms))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C"),
        _ = wait_until_empty(&engine) => warn!("no rooms left"),
    }

    engine.shutdown();
    engine.wait().await;
    Ok(())
}

fn init_logging(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
    Ok(())
}

/// Resolves once every room has been dropped by the engine.
async fn wait_until_empty(engine: &Engine) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if engine.rooms().is_empty() {
            return;
        }
    }
}

fn emit<T: Serialize>(room_id: RoomId, kind: &str, event: &T) {
    let line = serde_json::json!({ "room_id": room_id, "kind": kind, "event": event });
    println!("{}", line);
}

fn tag(room_id: RoomId) -> ColoredString {
    format!("[{}]", room_id).dimmed()
}

fn register_printers(builder: EngineBuilder, json: bool) -> EngineBuilder {
    if json {
        return builder
            .on_chat(|room, e| emit(room, "chat", &e))
            .on_gift(|room, e| emit(room, "gift", &e))
            .on_combo_end(|room, e| emit(room, "combo_end", &e))
            .on_guard_purchase(|room, e| emit(room, "guard_purchase", &e))
            .on_super_chat(|room, e| emit(room, "super_chat", &e))
            .on_storm(|room, e| emit(room, "storm", &e))
            .on_room_change(|room, e| emit(room, "room_change", &e))
            .on_live_start(|room, e| emit(room, "live_start", &e))
            .on_live_end(|room, e| emit(room, "live_end", &e))
            .on_popularity(|room, count| emit(room, "popularity", &count))
            .on_raw(|room, raw| {
                let payload = String::from_utf8_lossy(&raw.payload);
                emit(room, "raw", &serde_json::json!({"cmd": raw.cmd, "payload": payload}))
            });
    }

    builder
        .on_chat(|room, msg| {
            let medal = msg
                .medal
                .as_ref()
                .map(|m| format!("[{} {}] ", m.name, m.level))
                .unwrap_or_default();
            println!(
                "{} {}{}: {}",
                tag(room),
                medal.yellow(),
                msg.user_name.cyan(),
                msg.text
            );
        })
        .on_gift(|room, gift| {
            println!(
                "{} {} sent {} x{}",
                tag(room),
                gift.uname.cyan(),
                gift.gift_name.magenta(),
                gift.num
            );
        })
        .on_combo_end(|room, combo| {
            println!(
                "{} {} combo {} x{}",
                tag(room),
                combo.uname.cyan(),
                combo.gift_name.magenta(),
                combo.combo_num
            );
        })
        .on_guard_purchase(|room, guard| {
            println!(
                "{} {} bought {} x{}",
                tag(room),
                guard.username.cyan(),
                guard.gift_name.bright_magenta().bold(),
                guard.num
            );
        })
        .on_super_chat(|room, sc| {
            println!(
                "{} {} {}: {}",
                tag(room),
                format!("[SC {}]", sc.price).red().bold(),
                sc.user_info.uname.cyan(),
                sc.message
            );
        })
        .on_storm(|room, storm| {
            println!("{} storm {:?}: {}", tag(room), storm.action, storm.content);
        })
        .on_room_change(|room, change| {
            println!(
                "{} {} {} / {}",
                tag(room),
                "room changed:".green(),
                change.title,
                change.area_name
            );
        })
        .on_live_start(|room, _| println!("{} {}", tag(room), "live started".green().bold()))
        .on_live_end(|room, end| {
            println!("{} {} ({})", tag(room), "live ended".red().bold(), end.command);
        })
        .on_popularity(|room, count| println!("{} popularity {}", tag(room), count))
        .on_raw(|room, raw| {
            println!(
                "{} {} {}",
                tag(room),
                raw.cmd.dimmed(),
                String::from_utf8_lossy(&raw.payload).dimmed()
            );
        })
}
