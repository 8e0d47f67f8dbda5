use crate::types::SessionId;

/// Conversation identity plus the "start fresh after a pause" policy.
///
/// Owned by whatever owns the conversation view; nothing here is global, so two
/// conversations in the same process never share an id. Not persisted.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    id: Option<SessionId>,
    was_paused: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current id, created on first use.
    pub fn get_session_id(&mut self) -> SessionId {
        self.id.get_or_insert_with(SessionId::generate).clone()
    }

    /// Id to use for a freshly typed message. A paused previous run gets a new backend
    /// run, so the id is regenerated and the flag cleared.
    pub fn get_session_id_for_new_message(&mut self) -> SessionId {
        if self.was_paused {
            let fresh = SessionId::generate();
            tracing::debug!(
                "Session regenerated after pause: [{}...] -> [{}...]",
                self.id.as_ref().map(|id| id.short()).unwrap_or("none"),
                fresh.short()
            );
            self.id = Some(fresh);
            self.was_paused = false;
        }
        self.get_session_id()
    }

    pub fn mark_session_as_paused(&mut self) {
        self.was_paused = true;
    }

    pub fn current_id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    pub fn was_paused(&self) -> bool {
        self.was_paused
    }
}
