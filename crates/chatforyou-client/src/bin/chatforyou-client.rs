use anyhow::Context;
use chatforyou_client::loopback::LoopbackDevices;
use chatforyou_client::rtc::PeerFactory;
use chatforyou_client::{
    signaling_url, ApiClient, CallSession, ClientConfig, LeaveReason, PlaceholderVideoFactory,
    SessionCommand, SessionDeps, SessionEvent, SignalingChannel,
};
use chatforyou_core::QualityPreset;
use clap::Parser;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "chatforyou-client")]
struct Args {
    /// Base URL of the room server's REST API
    #[arg(long, env = "CFY_API_BASE_URL", default_value = "http://localhost:8080")]
    api_base: String,
    /// Room to join
    #[arg(long)]
    room: String,
    /// User id; looked up from the room when omitted
    #[arg(long)]
    user: Option<String>,
    /// Display name; looked up from the room when omitted
    #[arg(long)]
    nick: Option<String>,
    /// Screen-share quality sampling interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    quality_interval_ms: u64,
    /// Leave quality at the selected preset instead of adapting it
    #[arg(long, default_value_t = false)]
    no_auto_optimize: bool,
    /// Start with a fixed preset instead of automatic quality
    #[arg(long, default_value = "auto")]
    quality: QualityPreset,
    /// Directory for received files
    #[arg(long, default_value = "received-files")]
    file_out_dir: PathBuf,
    /// Maximum inbound file size in bytes
    #[arg(long, default_value_t = chatforyou_common::file_transfer::DEFAULT_MAX_FILE_BYTES)]
    file_max_bytes: u64,
}

/// Turns one stdin line into a session command. Lines without a leading
/// slash are chat.
fn parse_command_line(line: &str) -> Result<SessionCommand, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err("empty command".into());
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Ok(SessionCommand::SendChat(trimmed.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let require_arg = |what: &str| {
        if rest.is_empty() {
            Err(format!("/{name} needs {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    match name {
        "share" => Ok(SessionCommand::StartScreenShare),
        "unshare" => Ok(SessionCommand::StopScreenShare),
        "quality" => Ok(SessionCommand::SetQuality(require_arg("a preset")?.parse()?)),
        "auto" => Ok(SessionCommand::ToggleAutoOptimize),
        "optimize" => Ok(SessionCommand::OptimizeNow),
        "report" => Ok(SessionCommand::ReportQuality),
        "file" => Ok(SessionCommand::SendFile(PathBuf::from(require_arg("a path")?))),
        "game" => {
            let raw = require_arg("a JSON payload")?;
            let payload = serde_json::from_str(&raw).map_err(|e| format!("invalid JSON: {e}"))?;
            Ok(SessionCommand::SendGameEvent(payload))
        }
        "caption" => Ok(SessionCommand::SubmitCaption {
            text: require_arg("text")?,
            confidence: None,
        }),
        "leave" => Ok(SessionCommand::Leave(LeaveReason::User)),
        other => Err(format!("unknown command /{other}")),
    }
}

#[cfg(feature = "webrtc-rs")]
fn peer_factory() -> anyhow::Result<Arc<dyn PeerFactory>> {
    let factory = chatforyou_client::backend::webrtc::WebRtcPeerFactory::new()?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-rs"))]
fn peer_factory() -> anyhow::Result<Arc<dyn PeerFactory>> {
    warn!("built without webrtc-rs, peer connections are simulated in memory");
    Ok(Arc::new(chatforyou_client::loopback::LoopbackHub::new().factory()))
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ChatReceived {
            nick_name, text, ..
        } => println!("<{nick_name}> {text}"),
        SessionEvent::CaptionReceived { text, .. } => println!("[caption] {text}"),
        SessionEvent::PerformanceWarning {
            message,
            suggestion,
            ..
        } => warn!("{message} ({suggestion})"),
        SessionEvent::PermissionDenied { title, guidance, .. } => {
            warn!("{title}");
            for line in guidance {
                eprintln!("  - {line}");
            }
        }
        other => info!(event = ?other, "session event"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatforyou_common::init_tracing();
    let args = Args::parse();

    let api = ApiClient::new(Url::parse(&args.api_base).context("parsing --api-base")?);
    let (user_id, nick_name) = match (args.user, args.nick) {
        (Some(user), Some(nick)) => (user, nick),
        (user, nick) => {
            let identity = api.room_identity(&args.room).await?;
            (
                user.unwrap_or(identity.user_id),
                nick.unwrap_or(identity.nick_name),
            )
        }
    };

    let mut config = ClientConfig::new(args.room, user_id, nick_name);
    config.quality.interval = Duration::from_millis(args.quality_interval_ms.max(100));
    config.quality.auto_optimize = !args.no_auto_optimize;
    config.file_out_dir = args.file_out_dir;
    config.file_max_bytes = args.file_max_bytes;

    let deps = SessionDeps {
        factory: peer_factory()?,
        devices: Arc::new(LoopbackDevices::new()),
        synthetic: Arc::new(PlaceholderVideoFactory),
        ice_servers: api.ice_servers().await,
    };

    let url = signaling_url(&args.api_base)?;
    let (signaling, signal_rx) = SignalingChannel::connect(url.as_str(), config.join_message())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    info!(room = %config.room_id, nick = %config.nick_name, "joining room");

    let (session, handle, mut events) = CallSession::new(config, deps, signaling);
    if args.quality != QualityPreset::Auto {
        handle.set_quality(args.quality);
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.leave(LeaveReason::User);
        }
    });

    let stdin_handle = handle.clone();
    std::thread::spawn(move || {
        eprintln!("Type to chat. Commands: /share /unshare /quality <preset> /auto /optimize /report /file <path> /game <json> /caption <text> /leave");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => match parse_command_line(&line) {
                    Ok(command) => {
                        if !stdin_handle.send(command) {
                            break;
                        }
                    }
                    Err(err) => eprintln!("invalid command `{}`: {}", line.trim(), err),
                },
                Err(err) => {
                    eprintln!("stdin read failed: {}", err);
                    break;
                }
            }
        }
        stdin_handle.leave(LeaveReason::User);
    });

    session.run(signal_rx).await
}
