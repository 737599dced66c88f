//! WebSocket read pump: forwards inbound frames as transport events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{CLOSE_ABNORMAL, CLOSE_NORMAL, TransportEvent};

/// Reads frames from the WebSocket and forwards text frames to `events_tx`.
///
/// Any inbound frame resets a pong deadline; if nothing arrives within
/// `pong_wait` the socket is considered dead and the pump exits. On exit the
/// socket is marked closed and exactly one [`TransportEvent::Closed`] is sent.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<TransportEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    open: Arc<AtomicBool>,
    max_message_size: usize,
    pong_wait: Duration,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(pong_deadline);

    let (code, reason) = loop {
        tokio::select! {
            _ = cancel.cancelled() => break (CLOSE_NORMAL, "closed by client".to_string()),

            () = &mut pong_deadline => {
                warn!("pong timeout, closing dead connection");
                break (CLOSE_ABNORMAL, "pong timeout".to_string());
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + pong_wait);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                if text.len() > max_message_size {
                                    warn!("message too large ({} bytes), dropping", text.len());
                                    continue;
                                }
                                if events_tx.send(TransportEvent::Message(text.to_string())).await.is_err() {
                                    debug!("event receiver dropped, stopping read pump");
                                    break (CLOSE_NORMAL, "receiver dropped".to_string());
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(?frame, "received close frame");
                                break match frame {
                                    Some(f) => (u16::from(f.code), f.reason.to_string()),
                                    None => (CLOSE_NORMAL, String::new()),
                                };
                            }
                            _ => trace!("ignoring binary frame"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break (CLOSE_ABNORMAL, "stream ended".to_string());
                    }
                }
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events_tx.send(TransportEvent::Closed { code, reason }).await;
}
