//! Relay subscription over WebSocket
//!
//! Each connection gets a hub subscriber and two tasks: a write pump that
//! drains the subscriber queue into the socket, and a read loop that
//! forwards client messages to the peripheral. Whichever ends first tears
//! the other down and the subscriber is removed from the hub.

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use protocol::HubFrame;
use tracing::{debug, info, trace, warn};

use super::AppState;
use crate::hub::Outbound;

/// `GET /ws`
pub async fn subscribe(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| relay(socket, state))
}

fn to_message(msg: Outbound) -> Option<Message> {
    match msg {
        Outbound::Data(bytes) => Some(Message::Binary(bytes)),
        Outbound::Status(snapshot) => match HubFrame::Status(snapshot).to_text() {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("Failed to encode status frame: {}", e);
                None
            }
        },
        Outbound::Probe => Some(Message::Ping(Bytes::new())),
    }
}

async fn relay(socket: WebSocket, state: AppState) {
    let (subscriber, outbound) = state.hub.new_subscriber();
    let id = subscriber.id();
    state.hub.subscribe(subscriber);

    let (mut sink, mut stream) = socket.split();

    let mut write_pump = tokio::spawn(async move {
        while let Ok(msg) = outbound.recv().await {
            let Some(frame) = to_message(msg) else {
                continue;
            };
            if let Err(e) = sink.send(frame).await {
                debug!("Subscriber {:?} send failed: {}", id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = state.session.clone();
    let mut read_loop = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Subscriber {:?} receive failed: {}", id, e);
                    break;
                }
            };

            let session = session.clone();
            let len = data.len();
            match tokio::task::spawn_blocking(move || session.write(&data)).await {
                Ok(Ok(written)) => trace!("Subscriber {:?} wrote {} bytes", id, written),
                Ok(Err(e)) => debug!("Dropped {} bytes from {:?}: {}", len, id, e),
                Err(e) => warn!("Peripheral write task failed: {}", e),
            }
        }
    });

    tokio::select! {
        _ = &mut write_pump => read_loop.abort(),
        _ = &mut read_loop => write_pump.abort(),
    }

    state.hub.unsubscribe(id);
    info!("Subscriber {:?} disconnected", id);
}
