mod file_storage;
mod renderer;
mod socket;

use crate::file_storage::FileStorage;
use crate::renderer::LogRenderer;
use crate::socket::{ChannelSocket, SocketCommand};
use anyhow::{Context, bail};
use clap::Parser;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use projection_ui_sync_runtime::{ConnectionEvent, MemoryStorage, Session, SyncConfig};
use std::cell::Cell;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Connecting = Pin<Box<dyn Future<Output = Result<Ws, String>>>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "ui_host", about = "Headless Projection sync client")]
struct Cli {
    /// Server socket URL; overrides the config document.
    #[arg(long, env = "PROJECTION_SYNC_URL")]
    url: Option<String>,

    /// JSON config document. Without it the PROJECTION_* variables are read.
    #[arg(long, env = "PROJECTION_CONFIG")]
    config: Option<PathBuf>,

    /// File backing the `local` storage namespace.
    #[arg(long, env = "PROJECTION_LOCAL_STORE", default_value = "projection-local.json")]
    local_store: PathBuf,

    /// Channel to join once connected. Repeatable.
    #[arg(long = "channel", value_name = "CHANNEL")]
    channels: Vec<String>,
}

impl Cli {
    fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                SyncConfig::from_json(&raw)?
            }
            None => SyncConfig::from_env()?,
        };

        if let Some(url) = self.url.as_ref().filter(|url| !url.is_empty()) {
            config.url = url.clone();
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.sync_config()?;
    let local = FileStorage::open(&cli.local_store)?;
    info!(url = %config.url, local_store = %local.path().display(), "starting ui_host");

    let (socket, commands) = ChannelSocket::new();
    let session = Session::new(
        config,
        Box::new(socket),
        Box::new(local),
        Box::new(MemoryStorage::new()),
    );
    let _renderer = session.attach_renderer(Rc::new(LogRenderer));

    for channel in &cli.channels {
        session.events().subscribe(channel);
    }

    drive(session, commands).await
}

/// Single loop over socket commands, the pending connect, inbound frames, the
/// next runtime deadline and ctrl-c. Every session call happens here, one at
/// a time.
async fn drive(
    session: Rc<Session>,
    mut commands: UnboundedReceiver<SocketCommand>,
) -> anyhow::Result<()> {
    let gave_up = Rc::new(Cell::new(None));
    let flag = gave_up.clone();
    let _watch = session.transport().on_connection_change(move |event| {
        if let ConnectionEvent::GaveUp { attempts } = event {
            flag.set(Some(*attempts));
        }
    });

    let mut sink: Option<SplitSink<Ws, Message>> = None;
    let mut stream: Option<SplitStream<Ws>> = None;
    let mut connecting: Option<Connecting> = None;

    session.connect(Instant::now());

    loop {
        let deadline = session.next_deadline();

        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Open(url)) => {
                    connecting = Some(open_socket(url, CONNECT_TIMEOUT));
                }
                Some(SocketCommand::Send(frame)) => {
                    let Some(write) = sink.as_mut() else {
                        debug!("dropping frame for a closed socket");
                        continue;
                    };
                    if let Err(err) = write.send(Message::Text(frame)).await {
                        sink = None;
                        stream = None;
                        session.handle_error(Instant::now(), &err.to_string());
                    }
                }
                Some(SocketCommand::Close) => {
                    connecting = None;
                    if let Some(mut write) = sink.take() {
                        let _ = write.close().await;
                    }
                    stream = None;
                }
                None => break,
            },
            opened = next_connect(&mut connecting) => {
                connecting = None;
                match opened {
                    Ok(ws) => {
                        let (write, read) = ws.split();
                        sink = Some(write);
                        stream = Some(read);
                        session.handle_open(Instant::now());
                    }
                    Err(reason) => session.handle_error(Instant::now(), &reason),
                }
            }
            frame = next_frame(&mut stream) => match frame {
                Some(Ok(Message::Text(text))) => {
                    session.handle_frame(&text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    sink = None;
                    stream = None;
                    session.handle_close(Instant::now());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    sink = None;
                    stream = None;
                    session.handle_error(Instant::now(), &err.to_string());
                }
            },
            () = sleep_until(deadline) => session.poll(Instant::now()),
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "ctrl-c handler failed");
                }
                info!("shutting down");
                session.disconnect();
                if let Some(mut write) = sink.take() {
                    let _ = write.close().await;
                }
                return Ok(());
            }
        }

        if let Some(attempts) = gave_up.get() {
            bail!("server unreachable after {attempts} reconnect attempts");
        }
    }

    Ok(())
}

/// Starts a handshake that gives up after `limit`.
fn open_socket(url: String, limit: Duration) -> Connecting {
    Box::pin(async move {
        match tokio::time::timeout(limit, connect_async(url)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("connect timed out after {}ms", limit.as_millis())),
        }
    })
}

async fn next_connect(connecting: &mut Option<Connecting>) -> Result<Ws, String> {
    match connecting {
        Some(handshake) => handshake.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(stream: &mut Option<SplitStream<Ws>>) -> Option<Result<Message, WsError>> {
    match stream {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_flag_overrides_config_document() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"url":"ws://from-file/socket","reconnect":{"max_attempts":2}}"#)
            .expect("write config");

        let cli = Cli::parse_from([
            "ui_host",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--url",
            "ws://from-flag/socket",
        ]);
        let config = cli.sync_config().expect("valid config");

        assert_eq!(config.url, "ws://from-flag/socket");
        assert_eq!(config.reconnect.max_attempts, 2);
    }

    #[test]
    fn channels_are_repeatable() {
        let cli = Cli::parse_from(["ui_host", "--channel", "a", "--channel", "b"]);
        assert_eq!(cli.channels, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        // Accepts at the TCP level but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}/socket", listener.local_addr().expect("local addr"));

        let mut connecting = Some(open_socket(url, Duration::from_millis(50)));
        let err = match next_connect(&mut connecting).await {
            Ok(_) => panic!("handshake should not complete"),
            Err(err) => err,
        };
        assert!(err.contains("timed out"), "{err}");
        drop(listener);
    }

    #[tokio::test]
    async fn idle_connect_slot_never_resolves() {
        let mut connecting = None;
        let idle = tokio::time::timeout(Duration::from_millis(20), next_connect(&mut connecting)).await;
        assert!(idle.is_err());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let cli = Cli::parse_from(["ui_host", "--config", "/definitely/not/here.json"]);
        assert!(cli.sync_config().is_err());
    }
}
