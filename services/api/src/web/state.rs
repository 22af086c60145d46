//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and the active-generation set that
//! carries the streaming core's cancellation signal.

use crate::config::Config;
use crate::music::MusicQueryProcessor;
use crate::web::rooms::RoomManager;
use lm_chat_core::ports::{DatabaseService, LanguageModelService, MusicCatalogService};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn DatabaseService>,
    pub lm: Arc<dyn LanguageModelService>,
    pub catalog: Arc<dyn MusicCatalogService>,
    pub music: MusicQueryProcessor,
    pub rooms: RoomManager,
    pub generations: ActiveGenerations,
}

//=========================================================================================
// ActiveGenerations (The Cancellation Signal)
//=========================================================================================

/// The set of chat ids with a generation task in flight.
///
/// Membership is the sole cancellation signal: a generation task checks its
/// chat id once per fragment and stops consuming the moment the id is gone.
/// The set is shared between connection handlers and generation tasks, so all
/// access goes through this one synchronized interface.
#[derive(Default)]
pub struct ActiveGenerations {
    inner: Mutex<HashSet<Uuid>>,
}

impl ActiveGenerations {
    /// Registers a chat as generating. Returns false when a generation is
    /// already active for it, leaving the existing registration untouched.
    pub fn try_insert(&self, chat_id: Uuid) -> bool {
        self.inner.lock().unwrap().insert(chat_id)
    }

    pub fn contains(&self, chat_id: Uuid) -> bool {
        self.inner.lock().unwrap().contains(&chat_id)
    }

    /// Deregisters a chat. Removing an id that is not present is a no-op, so
    /// a stray stop request is harmless.
    pub fn remove(&self, chat_id: Uuid) {
        self.inner.lock().unwrap().remove(&chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_chat_holds_at_most_one_active_slot() {
        let generations = ActiveGenerations::default();
        let chat_id = Uuid::new_v4();

        assert!(generations.try_insert(chat_id));
        assert!(!generations.try_insert(chat_id));
        assert!(generations.contains(chat_id));

        generations.remove(chat_id);
        assert!(!generations.contains(chat_id));
        // Removing again is fine.
        generations.remove(chat_id);
    }
}
