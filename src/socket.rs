// src/socket.rs
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::coordinator::CoordinatorHandle;
use crate::events::{ClientEvent, Outbound, ServerEvent};

/// Pumps one WebSocket until either side closes it.
///
/// Inbound frames are parsed and forwarded to the coordinator; everything the
/// coordinator queues for this connection is written back out. `Outbound::Close`
/// ends the connection from the server side.
pub async fn serve_socket(socket: WebSocket, coordinator: CoordinatorHandle) {
    let id = coordinator.next_connection_id();
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Outbound>();
    coordinator.connect(id, outbound.clone());
    debug!("User connected: {id}");

    let mut writer = tokio::spawn(async move {
        while let Some(item) = queue.recv().await {
            match item {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode outbound event: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let forward = coordinator.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match ClientEvent::parse(text.as_str()) {
                    Ok(event) => forward.client_event(id, event),
                    Err(err) => {
                        let _ = outbound.send(Outbound::Event(ServerEvent::from(&err)));
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    coordinator.disconnect(id);
    debug!("User disconnected: {id}");
}
