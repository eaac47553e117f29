//! WebSocket push for blindscan notifications
//!
//! Clients connect to /api/ws and receive one message per terminal scan
//! transition: `{"notification":"blindscan","uuid":...,"state":...,
//! "peaks":...,"duration":...}`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use satscan_core::scan::session::{ScanEvent, ScanNotifier};

use crate::AppState;

/// Wire form of a scan notification
#[derive(Serialize)]
struct Notification<'a> {
    notification: &'static str,
    #[serde(flatten)]
    event: &'a ScanEvent,
}

/// Bridges the core's notifier trait onto the WebSocket broadcast channel
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl ScanNotifier for BroadcastNotifier {
    fn scan_finished(&self, event: &ScanEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let wire = Notification {
            notification: "blindscan",
            event,
        };
        if let Ok(json) = serde_json::to_string(&wire) {
            let _ = self.tx.send(json);
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();

    // Forward broadcast messages to this client
    let mut send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Drain incoming messages until the client closes
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use satscan_core::scan::session::SessionState;

    #[test]
    fn test_notification_wire_shape() {
        let event = ScanEvent {
            uuid: "abcd".into(),
            state: SessionState::Complete,
            peaks: 7,
            duration: 4200,
        };
        let wire = Notification {
            notification: "blindscan",
            event: &event,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&wire).unwrap()).unwrap();
        assert_eq!(json["notification"], "blindscan");
        assert_eq!(json["uuid"], "abcd");
        assert_eq!(json["state"], "complete");
        assert_eq!(json["peaks"], 7);
        assert_eq!(json["duration"], 4200);
    }

    #[test]
    fn test_notifier_drops_without_subscribers() {
        let (tx, _) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);
        // no receiver: must not error or block
        notifier.scan_finished(&ScanEvent {
            uuid: "x".into(),
            state: SessionState::Cancelled,
            peaks: 0,
            duration: 1,
        });
    }
}
