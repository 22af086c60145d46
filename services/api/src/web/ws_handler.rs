//! services/api/src/web/ws_handler.rs
//!
//! The entry point and control loop for a WebSocket connection: joins the
//! user's personal room, relays room broadcasts out to the socket, and
//! dispatches inbound chat events.

use crate::web::{
    chat_task,
    protocol::{ClientMessage, ServerMessage},
    rooms::RoomId,
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::StreamExt;
use futures::SinkExt;
use lm_chat_core::domain::ChatKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
///
/// The auth middleware has already refused unauthenticated requests with 401,
/// so the handshake itself fails for anonymous clients.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: Uuid) {
    info!("New WebSocket connection established for user: {}", user_id);

    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Room broadcasts originate in other tasks, so the connection owns an
    // outbound channel that this loop drains into the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    app_state
        .rooms
        .join(RoomId::User(user_id), conn_id, outbound_tx.clone());

    // Generation tasks started from this connection, by chat id. Finished
    // entries are pruned on the next send.
    let mut generation_tasks: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                let json = serde_json::to_string(&message).unwrap();
                if sender.send(Message::Text(json.into())).await.is_err() {
                    info!("Client went away mid-send.");
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_message(
                            text.to_string(),
                            &app_state,
                            user_id,
                            conn_id,
                            &outbound_tx,
                            &mut generation_tasks,
                        )
                        .await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client sent close message.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        info!("Client disconnected.");
                        break;
                    }
                }
            }
        }
    }

    // Membership ends with the connection. In-flight generations keep
    // running; their output stays persisted even with nobody in the room.
    app_state.rooms.leave_all(conn_id);
    info!("WebSocket connection closed.");
}

/// Parses an inbound text frame and dispatches it. A frame that fails to
/// parse gets a local error reply and causes no side effects.
pub(crate) async fn handle_text_message(
    text: String,
    app_state: &Arc<AppState>,
    user_id: Uuid,
    conn_id: Uuid,
    outbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    generation_tasks: &mut HashMap<Uuid, JoinHandle<()>>,
) {
    match serde_json::from_str::<ClientMessage>(&text) {
        Ok(client_msg) => {
            handle_client_message(
                app_state,
                user_id,
                conn_id,
                outbound_tx,
                client_msg,
                generation_tasks,
            )
            .await;
        }
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            let _ = outbound_tx.send(ServerMessage::Error {
                chat_id: None,
                error: format!("invalid message: {}", e),
            });
        }
    }
}

/// Helper function to handle the logic for different `ClientMessage` variants.
pub(crate) async fn handle_client_message(
    app_state: &Arc<AppState>,
    user_id: Uuid,
    conn_id: Uuid,
    outbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
    generation_tasks: &mut HashMap<Uuid, JoinHandle<()>>,
) {
    match message {
        ClientMessage::JoinChat { chat_id } => {
            // Ownership is re-validated here. A chat that is not yours looks
            // exactly like a chat that does not exist: the join is silently
            // skipped and no error reveals anything.
            match app_state.db.get_chat(chat_id, user_id).await {
                Ok(Some(_)) => {
                    app_state
                        .rooms
                        .join(RoomId::Chat(chat_id), conn_id, outbound_tx.clone());
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to look up chat {}: {}", chat_id, e),
            }
        }
        ClientMessage::LeaveChat { chat_id } => {
            app_state.rooms.leave(RoomId::Chat(chat_id), conn_id);
        }
        ClientMessage::SendMessage {
            chat_id,
            content,
            chat_type,
        } => {
            generation_tasks.retain(|_, handle| !handle.is_finished());
            let kind = ChatKind::from_name(&chat_type);
            match chat_task::start_turn(app_state.clone(), chat_id, content, kind).await {
                Ok(handle) => {
                    generation_tasks.insert(chat_id, handle);
                }
                Err(e) => {
                    // A refused or failed send is reported to this connection
                    // only; nothing was persisted or broadcast.
                    let _ = outbound_tx.send(ServerMessage::Error {
                        chat_id: Some(chat_id),
                        error: e.to_string(),
                    });
                }
            }
        }
        ClientMessage::StopGeneration { chat_id } => {
            // Deregistering is the whole cancellation mechanism; the task
            // notices at its next fragment boundary. Stopping an idle chat
            // does nothing.
            app_state.generations.remove(chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::testing::{drain, test_state, MemoryStore, RecordingCatalog, StreamLm};
    use serde_json::json;

    fn empty_state_with_store(store: Arc<MemoryStore>) -> Arc<AppState> {
        test_state(
            store,
            Arc::new(StreamLm::ok(&[])),
            Arc::new(RecordingCatalog::new(vec![])),
        )
    }

    #[tokio::test]
    async fn joining_an_unowned_chat_grants_no_visibility() {
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let chat_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new().with_chat(chat_id, owner));
        let state = empty_state_with_store(store);

        let (intruder_tx, mut intruder_rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        handle_client_message(
            &state,
            intruder,
            Uuid::new_v4(),
            &intruder_tx,
            ClientMessage::JoinChat { chat_id },
            &mut tasks,
        )
        .await;

        let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();
        handle_client_message(
            &state,
            owner,
            Uuid::new_v4(),
            &owner_tx,
            ClientMessage::JoinChat { chat_id },
            &mut tasks,
        )
        .await;

        state.rooms.broadcast(
            RoomId::Chat(chat_id),
            ServerMessage::ResponseComplete {
                chat_id,
                message_id: Uuid::new_v4(),
            },
        );

        // The owner hears the room; the intruder got neither membership nor
        // an error hinting the chat exists.
        assert_eq!(drain(&mut owner_rx).len(), 1);
        assert!(drain(&mut intruder_rx).is_empty());
    }

    #[tokio::test]
    async fn leaving_a_chat_stops_delivery() {
        let user = Uuid::new_v4();
        let chat_id = Uuid::new_v4();
        let conn_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new().with_chat(chat_id, user));
        let state = empty_state_with_store(store);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        handle_client_message(
            &state,
            user,
            conn_id,
            &tx,
            ClientMessage::JoinChat { chat_id },
            &mut tasks,
        )
        .await;
        handle_client_message(
            &state,
            user,
            conn_id,
            &tx,
            ClientMessage::LeaveChat { chat_id },
            &mut tasks,
        )
        .await;

        state.rooms.broadcast(
            RoomId::Chat(chat_id),
            ServerMessage::ResponseComplete {
                chat_id,
                message_id: Uuid::new_v4(),
            },
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn stop_generation_for_an_idle_chat_is_a_noop() {
        let state = empty_state_with_store(Arc::new(MemoryStore::new()));
        let chat_id = Uuid::new_v4();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        handle_client_message(
            &state,
            Uuid::new_v4(),
            Uuid::new_v4(),
            &tx,
            ClientMessage::StopGeneration { chat_id },
            &mut tasks,
        )
        .await;

        assert!(drain(&mut rx).is_empty());
        assert!(!state.generations.contains(chat_id));
    }

    #[tokio::test]
    async fn unparseable_frames_get_a_local_error_and_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let state = empty_state_with_store(store.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        handle_text_message(
            json!({"type": "send_message", "chat_id": Uuid::new_v4()}).to_string(),
            &state,
            Uuid::new_v4(),
            Uuid::new_v4(),
            &tx,
            &mut tasks,
        )
        .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerMessage::Error { chat_id: None, .. }
        ));
        assert!(store.stored_messages().is_empty());
    }
}
