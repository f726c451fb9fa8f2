//! WebSocket transport for the directory server.
//!
//! Connection tasks are deliberately dumb: they decode text frames to JSON
//! and forward them to the directory task, and pump the directory's
//! outbound queue back into the socket. All protocol logic lives behind the
//! event channel.

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::account::cert::AccountCertificate;
use crate::config::ServerConfig;
use crate::directory::DirectoryEvent;
use crate::proto::Message;

/// Header a client presents its PEM certificate in during the WebSocket
/// upgrade, standing in for transport-level client authentication.
/// Newlines are escaped as `\n` to fit a header line.
pub const CERTIFICATE_HEADER: &str = "x-scribe-certificate";

pub async fn run(
    config: Arc<ServerConfig>,
    directory: mpsc::UnboundedSender<DirectoryEvent>,
) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "directory server listening");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — saving sessions and stopping");
                let (done_tx, done_rx) = oneshot::channel();
                if directory.send(DirectoryEvent::Shutdown { done: done_tx }).is_ok() {
                    let _ = done_rx.await;
                }
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let directory = directory.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, directory).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("directory server stopped");
    Ok(())
}

/// Resolves when a shutdown signal is received. On Unix both SIGTERM and
/// Ctrl-C count; elsewhere Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(
    stream: TcpStream,
    directory: mpsc::UnboundedSender<DirectoryEvent>,
) -> Result<()> {
    let mut certificate_pem: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(value) = req.headers().get(CERTIFICATE_HEADER) {
                if let Ok(text) = value.to_str() {
                    certificate_pem = Some(text.replace("\\n", "\n"));
                }
            }
            Ok(resp)
        },
    )
    .await?;

    // Login keys off the certificate fingerprint; a malformed certificate
    // simply means the default account.
    let fingerprint = certificate_pem
        .as_deref()
        .and_then(|pem| AccountCertificate::from_pem(pem).ok())
        .map(|cert| cert.fingerprint());

    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (reply_tx, reply_rx) = oneshot::channel();
    if directory
        .send(DirectoryEvent::Connect {
            tx: out_tx,
            fingerprint,
            reply: reply_tx,
        })
        .is_err()
    {
        return Ok(());
    }
    let conn = reply_rx.await?;

    // Writer: directory outbound queue -> socket, one JSON object per text
    // frame.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!(err = %e, "unserializable outbound message dropped");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Reader: socket -> directory events, in order.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(raw) => {
                    if directory.send(DirectoryEvent::Frame { conn, raw }).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(conn, err = %e, "undecodable frame dropped"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, err = %e, "socket error");
                break;
            }
        }
    }

    let _ = directory.send(DirectoryEvent::Disconnect { conn });
    writer.abort();
    Ok(())
}
