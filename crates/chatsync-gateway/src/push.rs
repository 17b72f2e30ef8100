use std::sync::{Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::sleep};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use chatsync_core::{ConnectionState, ConnectionStateMachine, RetryPolicy};

use crate::wire::{PushInbound, PushOutbound};

const OUTBOUND_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PushSession {
    stop: CancellationToken,
    task: JoinHandle<()>,
    outbound_tx: mpsc::Sender<PushOutbound>,
}

/// Owns the lifecycle of the single push-channel session.
///
/// Inbound events and state transitions are forwarded to the runtime over
/// the channels supplied at construction; outbound commands are
/// fire-and-forget mirrors whose failure never affects delivery
/// correctness.
pub struct PushChannel {
    ws_url: Url,
    retry: RetryPolicy,
    inbound_tx: mpsc::Sender<PushInbound>,
    status_tx: mpsc::Sender<ConnectionState>,
    session: Mutex<Option<PushSession>>,
}

impl PushChannel {
    pub fn new(
        ws_url: Url,
        retry: RetryPolicy,
        inbound_tx: mpsc::Sender<PushInbound>,
        status_tx: mpsc::Sender<ConnectionState>,
    ) -> Self {
        Self {
            ws_url,
            retry,
            inbound_tx,
            status_tx,
            session: Mutex::new(None),
        }
    }

    /// Open the session. Calling while one is live is a no-op.
    pub fn connect(&self, token: String) {
        let mut guard = self.lock();
        if let Some(session) = guard.as_ref()
            && !session.task.is_finished()
        {
            debug!("push channel already connected; ignoring connect");
            return;
        }

        let stop = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let task = tokio::spawn(run_session(
            self.ws_url.clone(),
            token,
            self.retry,
            outbound_rx,
            self.inbound_tx.clone(),
            self.status_tx.clone(),
            stop.child_token(),
        ));

        *guard = Some(PushSession {
            stop,
            task,
            outbound_tx,
        });
    }

    /// Tear down the session, releasing socket, timers, and task.
    pub async fn disconnect(&self) {
        let session = self.lock().take();
        if let Some(session) = session {
            session.stop.cancel();
            let _ = session.task.await;
        }
    }

    /// Whether a session task is currently alive.
    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Mirror a command onto the push channel.
    ///
    /// Returns whether the command was handed to a live session. Dropping
    /// it is fine: the peer converges through its next REST fetch.
    pub fn send(&self, command: PushOutbound) -> bool {
        let guard = self.lock();
        match guard.as_ref() {
            Some(session) if !session.task.is_finished() => {
                session.outbound_tx.try_send(command).is_ok()
            }
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PushSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_session(
    ws_url: Url,
    token: String,
    retry: RetryPolicy,
    mut outbound_rx: mpsc::Receiver<PushOutbound>,
    inbound_tx: mpsc::Sender<PushInbound>,
    status_tx: mpsc::Sender<ConnectionState>,
    stop: CancellationToken,
) {
    let mut machine = ConnectionStateMachine::default();
    let mut attempt: u32 = 0;

    if let Some(state) = machine.connect() {
        let _ = status_tx.send(state).await;
    }

    loop {
        let url = authenticated_url(&ws_url, &token);
        let connected = tokio::select! {
            _ = stop.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((mut ws, _response)) => {
                attempt = 0;
                if let Ok(state) = machine.established() {
                    let _ = status_tx.send(state).await;
                }

                let cancelled = drive_socket(&mut ws, &mut outbound_rx, &inbound_tx, &stop).await;
                let _ = ws.close(None).await;
                if cancelled {
                    break;
                }
                debug!("push channel session dropped");
            }
            Err(err) if is_auth_rejection(&err) => {
                warn!(error = %err, "push channel credential rejected");
                let _ = status_tx.send(machine.unavailable()).await;
                return;
            }
            Err(err) => {
                debug!(error = %err, "push channel connect failed");
            }
        }

        if stop.is_cancelled() {
            break;
        }

        if let Ok(state) = machine.transport_error() {
            let _ = status_tx.send(state).await;
        }

        if retry.attempts_exhausted(attempt) {
            warn!(attempt, "push channel retry budget exhausted");
            let _ = status_tx.send(machine.unavailable()).await;
            return;
        }

        let delay = retry.delay_for_attempt(attempt, None);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep(delay) => {}
        }

        if let Ok(state) = machine.retry() {
            let _ = status_tx.send(state).await;
        }
    }

    let _ = status_tx.send(machine.disconnect()).await;
}

/// Pump one established socket until it drops or the session is cancelled.
///
/// Returns `true` when the session was cancelled, `false` on transport
/// drop.
async fn drive_socket(
    ws: &mut WsStream,
    outbound_rx: &mut mpsc::Receiver<PushOutbound>,
    inbound_tx: &mpsc::Sender<PushInbound>,
    stop: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return true,
            command = outbound_rx.recv() => {
                let Some(command) = command else { return true };
                match serde_json::to_string(&command) {
                    Ok(payload) => {
                        if ws.send(WsMessage::text(payload)).await.is_err() {
                            return false;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode push command"),
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<PushInbound>(text.as_str()) {
                            Ok(event) => {
                                let _ = inbound_tx.send(event).await;
                            }
                            Err(err) => debug!(error = %err, "ignoring unrecognized push frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return false,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn authenticated_url(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

fn is_auth_rejection(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(response) => matches!(response.status().as_u16(), 401 | 403),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn channel_pair() -> (
        PushChannel,
        mpsc::Receiver<PushInbound>,
        mpsc::Receiver<ConnectionState>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = mpsc::channel(16);
        // Nothing listens on port 9; connects fail fast and the long base
        // delay keeps the session parked in backoff for the test duration.
        let channel = PushChannel::new(
            Url::parse("ws://127.0.0.1:9/ws/chat/").expect("url"),
            RetryPolicy::new(60_000, 60_000, 8),
            inbound_tx,
            status_tx,
        );
        (channel, inbound_rx, status_rx)
    }

    #[test]
    fn appends_the_credential_as_a_query_pair() {
        let base = Url::parse("wss://api.example.org/ws/chat/").expect("url");
        let url = authenticated_url(&base, "secret-token");
        assert_eq!(
            url.as_str(),
            "wss://api.example.org/ws/chat/?token=secret-token"
        );
    }

    #[tokio::test]
    async fn connect_announces_connecting_and_disconnect_joins_the_task() {
        let (channel, _inbound_rx, mut status_rx) = channel_pair();

        channel.connect("tok".into());
        assert!(channel.is_active());

        let state = timeout(Duration::from_secs(2), status_rx.recv())
            .await
            .expect("status timeout")
            .expect("status recv");
        assert_eq!(state, ConnectionState::Connecting);

        channel.disconnect().await;
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn second_connect_while_live_is_a_no_op() {
        let (channel, _inbound_rx, mut status_rx) = channel_pair();

        channel.connect("tok".into());
        let first = timeout(Duration::from_secs(2), status_rx.recv())
            .await
            .expect("status timeout")
            .expect("status recv");
        assert_eq!(first, ConnectionState::Connecting);

        channel.connect("tok".into());
        channel.connect("tok".into());
        assert!(channel.is_active());

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn send_without_a_session_reports_not_mirrored() {
        let (channel, _inbound_rx, _status_rx) = channel_pair();
        assert!(!channel.send(PushOutbound::ReadReceipt { message_id: 1 }));
    }
}
