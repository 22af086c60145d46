//! services/api/src/web/chat_task.rs
//!
//! The streaming turn orchestrator: accepts a user turn, persists and echoes
//! it, then drives the generation task that relays model output fragment by
//! fragment until completion, cancellation, or failure.

use crate::web::{
    protocol::ServerMessage,
    rooms::RoomId,
    state::AppState,
};
use futures::StreamExt;
use lm_chat_core::domain::ChatKind;
use lm_chat_core::ports::{GenerationOptions, PortError, PortResult, TokenStream};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Accepts an inbound user turn. Persists the message, echoes it to the chat
/// room, registers the chat as generating and spawns the generation task,
/// whose handle is returned so the caller (and tests) can await it.
///
/// A chat holds at most one generation at a time: a send that arrives while
/// one is running is refused before any state changes.
pub async fn start_turn(
    app_state: Arc<AppState>,
    chat_id: Uuid,
    content: String,
    kind: ChatKind,
) -> PortResult<JoinHandle<()>> {
    if !app_state.generations.try_insert(chat_id) {
        return Err(PortError::Unexpected(
            "a response is already being generated for this chat".to_string(),
        ));
    }

    // The user's turn is committed before anyone hears about it; the sender
    // sees their own message come back through the room, not a local echo.
    let message = match app_state.db.add_message(chat_id, &content, true).await {
        Ok(message) => message,
        Err(e) => {
            app_state.generations.remove(chat_id);
            return Err(e);
        }
    };

    app_state.rooms.broadcast(
        RoomId::Chat(chat_id),
        ServerMessage::NewMessage {
            id: message.id,
            content: message.content,
            timestamp: message.created_at,
            is_user: message.is_user,
        },
    );

    Ok(tokio::spawn(generation_process(
        app_state, chat_id, content, kind,
    )))
}

/// The generation task. Failures anywhere in the pipeline become a single
/// `error` event; the active-set registration is released on every terminal
/// path so the chat can never stick in a generating state.
pub async fn generation_process(
    app_state: Arc<AppState>,
    chat_id: Uuid,
    content: String,
    kind: ChatKind,
) {
    info!("Generation started for chat {}", chat_id);

    if let Err(e) = run_generation(&app_state, chat_id, &content, kind).await {
        warn!("Generation for chat {} failed: {}", chat_id, e);
        app_state.rooms.broadcast(
            RoomId::Chat(chat_id),
            ServerMessage::Error {
                chat_id: Some(chat_id),
                error: e.to_string(),
            },
        );
    }

    app_state.generations.remove(chat_id);
}

async fn run_generation(
    app_state: &Arc<AppState>,
    chat_id: Uuid,
    content: &str,
    kind: ChatKind,
) -> PortResult<()> {
    let mut stream = open_stream(app_state, content, kind).await?;

    // Created empty; every chunk event for this turn references this id as
    // the content is overwritten with the growing accumulator.
    let response_message = app_state.db.add_message(chat_id, "", false).await?;
    let mut accumulated = String::new();

    while let Some(fragment) = stream.next().await {
        // Cancellation is cooperative and checked once per fragment: when the
        // chat is no longer registered, consumption stops at this boundary
        // and whatever was last persisted stands. Dropping the stream also
        // closes the backend connection.
        if !app_state.generations.contains(chat_id) {
            info!("Generation for chat {} cancelled", chat_id);
            return Ok(());
        }

        let fragment = fragment?;
        accumulated.push_str(&fragment);
        app_state
            .db
            .update_message_content(response_message.id, &accumulated)
            .await?;
        app_state.rooms.broadcast(
            RoomId::Chat(chat_id),
            ServerMessage::ResponseChunk {
                chat_id,
                message_id: response_message.id,
                chunk: fragment,
            },
        );
    }

    if app_state.generations.contains(chat_id) {
        app_state
            .db
            .update_message_content(response_message.id, &accumulated)
            .await?;
        app_state.rooms.broadcast(
            RoomId::Chat(chat_id),
            ServerMessage::ResponseComplete {
                chat_id,
                message_id: response_message.id,
            },
        );
        info!("Generation for chat {} complete", chat_id);
    }

    Ok(())
}

/// Opens the fragment stream for a turn. Music chats run translate → query →
/// render first and stream over the rendered rows; general chats stream over
/// the user's content directly.
async fn open_stream(
    app_state: &Arc<AppState>,
    content: &str,
    kind: ChatKind,
) -> PortResult<TokenStream> {
    match kind {
        ChatKind::Music => {
            let sql = app_state.music.generate_sql(content).await?;
            let results = app_state.catalog.execute_query(&sql).await?;
            let rendered = app_state.music.format_results(&results).await?;
            app_state
                .lm
                .generate_stream(&rendered, GenerationOptions::default())
                .await
        }
        ChatKind::General => {
            app_state
                .lm
                .generate_stream(content, GenerationOptions::default())
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::testing::{
        drain, test_state, ChannelLm, MemoryStore, MusicLm, RecordingCatalog, StreamLm,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("room subscription closed")
    }

    #[tokio::test]
    async fn general_turn_streams_chunks_and_persists_the_full_response() {
        let store = Arc::new(MemoryStore::new());
        let lm = Arc::new(StreamLm::ok(&["Hi", " there", "!"]));
        let catalog = Arc::new(RecordingCatalog::new(vec![]));
        let state = test_state(store.clone(), lm, catalog);

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        let handle = start_turn(state.clone(), chat_id, "hello".to_string(), ChatKind::General)
            .await
            .unwrap();
        handle.await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(
            &events[0],
            ServerMessage::NewMessage { content, is_user: true, .. } if content == "hello"
        ));

        let assistant_id = match &events[1] {
            ServerMessage::ResponseChunk {
                message_id, chunk, ..
            } => {
                assert_eq!(chunk, "Hi");
                *message_id
            }
            other => panic!("expected a chunk, got {:?}", other),
        };
        assert!(matches!(
            &events[2],
            ServerMessage::ResponseChunk { chunk, message_id, .. }
                if chunk == " there" && *message_id == assistant_id
        ));
        assert!(matches!(
            &events[3],
            ServerMessage::ResponseChunk { chunk, .. } if chunk == "!"
        ));
        assert!(matches!(
            &events[4],
            ServerMessage::ResponseComplete { message_id, .. } if *message_id == assistant_id
        ));

        let messages = store.stored_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user);
        assert_eq!(messages[0].content, "hello");
        assert!(!messages[1].is_user);
        assert_eq!(messages[1].id, assistant_id);
        assert_eq!(messages[1].content, "Hi there!");
        assert!(messages[1].created_at >= messages[0].created_at);

        assert!(!state.generations.contains(chat_id));
    }

    #[tokio::test]
    async fn stopping_midstream_halts_events_and_keeps_partial_content() {
        let store = Arc::new(MemoryStore::new());
        let (lm, fragments) = ChannelLm::new();
        let catalog = Arc::new(RecordingCatalog::new(vec![]));
        let state = test_state(store.clone(), Arc::new(lm), catalog);

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        let handle = start_turn(state.clone(), chat_id, "hello".to_string(), ChatKind::General)
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::NewMessage { .. }
        ));

        fragments.send(Ok("Hi".to_string())).unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::ResponseChunk { chunk, .. } if chunk == "Hi"
        ));
        fragments.send(Ok(" there".to_string())).unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            ServerMessage::ResponseChunk { chunk, .. } if chunk == " there"
        ));

        // The stop request lands between fragments; the next one is where the
        // task notices and goes quiet.
        state.generations.remove(chat_id);
        fragments.send(Ok("!".to_string())).unwrap();
        drop(fragments);
        handle.await.unwrap();

        assert!(drain(&mut rx).is_empty());

        let messages = store.stored_messages();
        assert_eq!(messages[1].content, "Hi there");
        assert!(!state.generations.contains(chat_id));
    }

    #[tokio::test]
    async fn music_turn_translates_executes_and_renders() {
        let sql = "SELECT * FROM music WHERE lower(artist) LIKE '%beatles%'";
        let rendering = "The catalog has Abbey Road by The Beatles.";
        let store = Arc::new(MemoryStore::new());
        let lm = Arc::new(MusicLm::new(sql, rendering, &["The catalog", " has Abbey Road."]));
        let catalog = Arc::new(RecordingCatalog::new(vec![json!({
            "album": "Abbey Road",
            "artist": "The Beatles",
            "year": 1969
        })]));
        let state = test_state(store.clone(), lm.clone(), catalog.clone());

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        let handle = start_turn(
            state.clone(),
            chat_id,
            "Find albums by Beatles".to_string(),
            ChatKind::Music,
        )
        .await
        .unwrap();
        handle.await.unwrap();

        // Exactly the vetted translation reached the catalog.
        assert_eq!(catalog.executed(), vec![sql.to_string()]);
        // The final stream ran over the rendered rows, not the user's text.
        assert_eq!(
            lm.last_stream_prompt.lock().unwrap().as_deref(),
            Some(rendering)
        );

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerMessage::NewMessage { .. }));
        assert!(matches!(
            events.last().unwrap(),
            ServerMessage::ResponseComplete { .. }
        ));

        let messages = store.stored_messages();
        assert_eq!(messages[1].content, "The catalog has Abbey Road.");
    }

    #[tokio::test]
    async fn unsafe_translation_never_reaches_the_catalog() {
        let store = Arc::new(MemoryStore::new());
        let lm = Arc::new(MusicLm::new("DROP TABLE music", "unused", &[]));
        let catalog = Arc::new(RecordingCatalog::new(vec![]));
        let state = test_state(store.clone(), lm, catalog.clone());

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        let handle = start_turn(
            state.clone(),
            chat_id,
            "Find albums by Beatles".to_string(),
            ChatKind::Music,
        )
        .await
        .unwrap();
        handle.await.unwrap();

        assert!(catalog.executed().is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ServerMessage::NewMessage { .. }));
        assert!(matches!(
            &events[1],
            ServerMessage::Error { chat_id: Some(id), .. } if *id == chat_id
        ));

        // Only the user's turn was stored; no assistant message was created.
        assert_eq!(store.stored_messages().len(), 1);
        assert!(!state.generations.contains(chat_id));
    }

    #[tokio::test]
    async fn overlapping_sends_to_one_chat_are_refused() {
        let store = Arc::new(MemoryStore::new());
        let lm = Arc::new(StreamLm::ok(&["never"]));
        let catalog = Arc::new(RecordingCatalog::new(vec![]));
        let state = test_state(store.clone(), lm, catalog);

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        // A generation is already running for this chat.
        assert!(state.generations.try_insert(chat_id));

        let err = start_turn(state.clone(), chat_id, "again".to_string(), ChatKind::General)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already being generated"));

        // Refused before any side effects, and the running slot is untouched.
        assert!(drain(&mut rx).is_empty());
        assert!(store.stored_messages().is_empty());
        assert!(state.generations.contains(chat_id));
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_an_error_event() {
        let store = Arc::new(MemoryStore::new());
        let lm = Arc::new(StreamLm::with_script(vec![
            Ok("Hal".to_string()),
            Err("connection reset by peer".to_string()),
        ]));
        let catalog = Arc::new(RecordingCatalog::new(vec![]));
        let state = test_state(store.clone(), lm, catalog);

        let chat_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.rooms.join(RoomId::Chat(chat_id), Uuid::new_v4(), tx);

        let handle = start_turn(state.clone(), chat_id, "hello".to_string(), ChatKind::General)
            .await
            .unwrap();
        handle.await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ServerMessage::NewMessage { .. }));
        assert!(matches!(
            &events[1],
            ServerMessage::ResponseChunk { chunk, .. } if chunk == "Hal"
        ));
        assert!(matches!(
            &events[2],
            ServerMessage::Error { error, .. } if error.contains("connection reset")
        ));

        // The fragments that made it through stay persisted.
        assert_eq!(store.stored_messages()[1].content, "Hal");
        assert!(!state.generations.contains(chat_id));
    }
}
