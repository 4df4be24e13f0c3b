//! Connection adapter
//!
//! Bridges one WebSocket to the hub. Each connection runs two pumps:
//! the inbound pump decodes client frames and dispatches them to the
//! hub or the external collaborators, the outbound pump drains the
//! bounded frame queue onto the wire and keeps the ping cadence
//! going. Either pump exiting tears the whole connection down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, warn};

use crate::config::Config;
use crate::envelope::{self, ClientEnvelope, ServerEnvelope};
use crate::hub::{ConnId, Hub, UserId};
use crate::store::{MembershipChecker, MessageStore};

/// One-shot close signal shared by every teardown path.
///
/// The inbound pump, a hub-side eviction, and external shutdown may all
/// try to close a connection at the same time; only the first attempt
/// wins and the rest are no-ops.
#[derive(Clone, Debug, Default)]
pub struct CloseSignal {
    inner: Arc<CloseInner>,
}

#[derive(Debug, Default)]
struct CloseInner {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns true for the one caller that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires. Returns immediately if it already
    /// has.
    pub async fn closed(&self) {
        while !self.is_closed() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before rechecking: `notify_waiters` only wakes
            // already-registered waiters, so a close landing between the
            // recheck and the first poll would otherwise be missed.
            notified.as_mut().enable();
            if self.is_closed() {
                break;
            }
            notified.await;
        }
    }
}

/// Drive one upgraded WebSocket until it dies.
///
/// Registers with the hub, spawns the outbound pump, then runs the
/// inbound pump on the current task. Returns once the connection is
/// fully torn down.
pub async fn run_connection<S>(
    socket: WebSocketStream<S>,
    user_id: UserId,
    hub: Hub,
    store: Arc<dyn MessageStore>,
    checker: Arc<dyn MembershipChecker>,
    config: Config,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = ConnId::next();
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(config.outbound_queue_depth);
    let close = CloseSignal::new();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    hub.register(conn_id, user_id, outbound_tx.clone(), close.clone());

    let writer = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        close.clone(),
        last_pong.clone(),
        conn_id,
        config.clone(),
    ));

    read_pump(
        stream,
        conn_id,
        user_id,
        &hub,
        store,
        checker,
        &outbound_tx,
        &last_pong,
        &close,
        &config,
    )
    .await;

    // The inbound pump is done for whatever reason; make teardown
    // unconditional. Both calls are idempotent.
    hub.unregister(conn_id);
    close.close();
    let _ = writer.await;
    debug!(%conn_id, %user_id, "connection torn down");
}

/// Inbound pump: wire frames -> envelopes -> hub/collaborator calls.
///
/// Exits on read error, close frame, an oversized frame, or the close
/// signal; a connection the hub has evicted must not keep feeding
/// messages in. Frames from one connection are dispatched strictly in
/// arrival order.
#[allow(clippy::too_many_arguments)]
async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    conn_id: ConnId,
    user_id: UserId,
    hub: &Hub,
    store: Arc<dyn MessageStore>,
    checker: Arc<dyn MembershipChecker>,
    outbound: &mpsc::Sender<String>,
    last_pong: &Mutex<Instant>,
    close: &CloseSignal,
    config: &Config,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Biased so that once the connection is closed, no buffered
        // frame gets dispatched.
        let result = tokio::select! {
            biased;
            _ = close.closed() => {
                debug!(%conn_id, "close signalled, stopping inbound pump");
                break;
            }
            next = stream.next() => match next {
                Some(result) => result,
                None => break,
            },
        };

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!(%conn_id, error = %e, "read error");
                break;
            }
        };

        let text = match message {
            Message::Text(text) => {
                // The accept loop also caps this at the transport; this
                // covers sockets handed to [`run_connection`] directly.
                if text.len() > config.max_frame_size {
                    warn!(%conn_id, len = text.len(), "oversized frame, closing connection");
                    break;
                }
                text
            }
            Message::Pong(_) => {
                *last_pong.lock() = Instant::now();
                continue;
            }
            Message::Ping(_) => {
                // Pong replies are queued by the protocol layer.
                *last_pong.lock() = Instant::now();
                continue;
            }
            Message::Close(_) => {
                debug!(%conn_id, "close frame received");
                break;
            }
            Message::Binary(data) => {
                warn!(%conn_id, len = data.len(), "ignoring binary frame");
                continue;
            }
            Message::Frame(_) => continue,
        };

        let parsed = match envelope::parse(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%conn_id, error = %e, "ignoring invalid envelope");
                continue;
            }
        };

        match parsed {
            ClientEnvelope::Subscribe { channel_id } => {
                match checker.is_member(user_id, channel_id).await {
                    Ok(true) => hub.subscribe(conn_id, channel_id),
                    Ok(false) => {
                        send_error(outbound, conn_id, "not a member of this channel");
                    }
                    Err(e) => {
                        warn!(%conn_id, %channel_id, error = %e, "membership check failed");
                        send_error(outbound, conn_id, "failed to verify channel membership");
                    }
                }
            }
            ClientEnvelope::Unsubscribe { channel_id } => {
                hub.unsubscribe(conn_id, channel_id);
            }
            ClientEnvelope::Message {
                channel_id,
                content,
            } => {
                if content.is_empty() {
                    continue;
                }
                if content.len() > config.max_content_len {
                    warn!(%conn_id, %user_id, len = content.len(), "message too long, dropping");
                    continue;
                }
                match store.save_message(channel_id, user_id, &content).await {
                    Ok(saved) => {
                        let payload =
                            envelope::encode(&ServerEnvelope::Message { message: saved });
                        hub.broadcast_to_channel(channel_id, payload);
                    }
                    Err(e) => {
                        // Fire-and-forget: the sender is not notified.
                        warn!(%conn_id, %channel_id, error = %e, "failed to persist message, dropping");
                    }
                }
            }
            ClientEnvelope::PresenceRequest => {
                let user_ids = hub.presence().online_user_ids();
                let payload = envelope::encode(&ServerEnvelope::PresenceList { user_ids });
                if outbound.try_send(payload).is_err() {
                    warn!(%conn_id, "outbound queue full, dropping presence list");
                }
            }
        }
    }
}

/// Queue a request-scoped error envelope for this connection only.
fn send_error(outbound: &mpsc::Sender<String>, conn_id: ConnId, message: &str) {
    let payload = envelope::encode(&ServerEnvelope::Error {
        message: message.to_string(),
    });
    if outbound.try_send(payload).is_err() {
        warn!(%conn_id, "outbound queue full, dropping error envelope");
    }
}

/// Outbound pump: drains the frame queue onto the wire, pings on an
/// interval, and tears down when the peer stays silent too long. Every
/// write runs under the configured deadline. Exiting closes the
/// transport.
async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
    close: CloseSignal,
    last_pong: Arc<Mutex<Instant>>,
    conn_id: ConnId,
    config: Config,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if write_with_deadline(&mut sink, Message::Text(frame.into()), &config, conn_id)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    // Queue released by the hub: orderly goodbye.
                    let _ = write_with_deadline(&mut sink, Message::Close(None), &config, conn_id)
                        .await;
                    break;
                }
            },
            _ = ping.tick() => {
                let silence = last_pong.lock().elapsed();
                if silence > config.silence_window {
                    warn!(%conn_id, silence_secs = silence.as_secs(), "peer silent too long, closing");
                    break;
                }
                if write_with_deadline(&mut sink, Message::Ping(Bytes::new()), &config, conn_id)
                    .await
                    .is_err()
                {
                    break;
                }
            },
            _ = close.closed() => {
                let _ = write_with_deadline(&mut sink, Message::Close(None), &config, conn_id)
                    .await;
                break;
            }
        }
    }

    // Whatever ended this pump ends the connection: firing the signal
    // stops the inbound pump too, even when the exit was a write error.
    close.close();
    let _ = sink.close().await;
    debug!(%conn_id, "write pump stopped");
}

async fn write_with_deadline<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    config: &Config,
    conn_id: ConnId,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(config.write_deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(%conn_id, error = %e, "write error");
            Err(())
        }
        Err(_) => {
            warn!(%conn_id, "write deadline exceeded");
            Err(())
        }
    }
}
