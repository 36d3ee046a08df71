//! Conversation State Store
//!
//! Per-session mutable state with idle eviction. [`IdleStore`] is the generic
//! idle-expiring keyed store; [`ConversationStore`] layers the trip-planning
//! flow on top of it. Two instances exist at runtime: web sessions (24h idle)
//! and bot chat turns (30min idle).

use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Slot names stored in `collected_data`
pub mod slots {
    pub const DESTINATION: &str = "destination";
    pub const ORIGIN: &str = "origin";
    pub const DATES: &str = "dates";
    pub const BUDGET: &str = "budget";
    pub const TRAVELERS: &str = "travelers";
    pub const PREFERENCES: &str = "preferences";
}

/// Keyed store whose entries vanish after `idle` without activity
pub struct IdleStore<V> {
    name: String,
    entries: Cache<String, Arc<Mutex<V>>>,
    idle: Duration,
}

impl<V> IdleStore<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(name: &str, idle: Duration, max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_idle(idle)
            .build();

        Self {
            name: name.to_string(),
            entries,
            idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idle_window(&self) -> Duration {
        self.idle
    }

    /// Fetch an entry, creating it on first use. Counts as activity.
    pub async fn get_or_insert_with<F>(&self, key: &str, init: F) -> Arc<Mutex<V>>
    where
        F: FnOnce() -> V,
    {
        self.entries
            .get_with(key.to_string(), async move { Arc::new(Mutex::new(init())) })
            .await
    }

    /// Fetch an existing entry. Counts as activity.
    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<V>>> {
        self.entries.get(key).await
    }

    /// Mutate an existing entry in place
    pub async fn with_mut<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = self.entries.get(key).await?;
        let mut value = entry.lock();
        Some(f(&mut value))
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).await.is_some()
    }

    /// Evict idle entries now instead of lazily
    pub async fn sweep(&self) {
        self.entries.run_pending_tasks().await;
    }

    /// Approximate number of live entries
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Steps of the trip-planning dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    CollectingDestination,
    CollectingDates,
    CollectingBudget,
    CollectingPreferences,
    Generating,
}

/// What the current turn contributes to the flow
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    /// The turn's intent is trip related
    pub trip_intent: bool,
    /// The user asked to start over
    pub cancel: bool,
}

impl FlowState {
    /// Next state given the current turn and everything collected so far
    pub fn advance(self, input: &TurnInput, collected: &BTreeMap<String, String>) -> FlowState {
        if input.cancel {
            return FlowState::Idle;
        }

        match self {
            FlowState::Idle if !input.trip_intent => FlowState::Idle,
            FlowState::Generating => FlowState::Generating,
            _ => Self::first_missing(collected),
        }
    }

    fn first_missing(collected: &BTreeMap<String, String>) -> FlowState {
        if !collected.contains_key(slots::DESTINATION) {
            FlowState::CollectingDestination
        } else if !collected.contains_key(slots::DATES) {
            FlowState::CollectingDates
        } else if !collected.contains_key(slots::BUDGET) {
            FlowState::CollectingBudget
        } else if !collected.contains_key(slots::PREFERENCES) {
            FlowState::CollectingPreferences
        } else {
            FlowState::Generating
        }
    }

    /// Slot this state is waiting for
    pub fn pending_slot(&self) -> Option<&'static str> {
        match self {
            FlowState::CollectingDestination => Some(slots::DESTINATION),
            FlowState::CollectingDates => Some(slots::DATES),
            FlowState::CollectingBudget => Some(slots::BUDGET),
            FlowState::CollectingPreferences => Some(slots::PREFERENCES),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: i64, // Unix millis
}

impl ConversationMessage {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Mutable per-conversation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    pub user_id: String,
    pub current_state: FlowState,
    pub collected_data: BTreeMap<String, String>,
    pub history: VecDeque<ConversationMessage>,
    pub interaction_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip)]
    max_history: usize,
}

impl ConversationState {
    pub fn new(conversation_id: &str, user_id: &str, max_history: usize) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            current_state: FlowState::Idle,
            collected_data: BTreeMap::new(),
            history: VecDeque::new(),
            interaction_count: 0,
            created_at: now,
            last_activity_at: now,
            max_history,
        }
    }

    /// Append a message, dropping the oldest beyond the history bound
    pub fn push_message(&mut self, message: ConversationMessage) {
        self.history.push_back(message);
        while self.history.len() > self.max_history.max(1) {
            self.history.pop_front();
        }
    }

    fn touch(&mut self) {
        self.interaction_count += 1;
        self.last_activity_at = Utc::now();
    }
}

/// Changes applied to a conversation by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub state: Option<FlowState>,
    pub collected: BTreeMap<String, String>,
    pub clear_collected: bool,
    pub messages: Vec<ConversationMessage>,
}

/// Conversation store with idle expiry
pub struct ConversationStore {
    store: IdleStore<ConversationState>,
    max_history: usize,
}

impl ConversationStore {
    pub fn new(name: &str, idle: Duration, max_history: usize, max_sessions: u64) -> Self {
        info!("Conversation store '{}' idle window {:?}", name, idle);
        Self {
            store: IdleStore::new(name, idle, max_sessions),
            max_history,
        }
    }

    /// Fetch or create the state, bumping activity and the interaction counter
    pub async fn get_or_create(&self, conversation_id: &str, user_id: &str) -> ConversationState {
        let max_history = self.max_history;
        let entry = self
            .store
            .get_or_insert_with(conversation_id, || {
                debug!("New conversation {} for user {}", conversation_id, user_id);
                ConversationState::new(conversation_id, user_id, max_history)
            })
            .await;

        let mut state = entry.lock();
        state.touch();
        state.clone()
    }

    /// Apply a patch; returns the updated state, or `None` if the conversation expired
    pub async fn update(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Option<ConversationState> {
        self.store
            .with_mut(conversation_id, |state| {
                if patch.clear_collected {
                    state.collected_data.clear();
                }
                state.collected_data.extend(patch.collected);
                for message in patch.messages {
                    state.push_message(message);
                }
                if let Some(next) = patch.state {
                    if next != state.current_state {
                        debug!(
                            "Conversation {}: {:?} -> {:?}",
                            state.conversation_id, state.current_state, next
                        );
                    }
                    state.current_state = next;
                }
                state.last_activity_at = Utc::now();
                state.clone()
            })
            .await
    }

    /// Record the user's turn: merge slots, then advance the flow
    pub async fn advance_turn(
        &self,
        conversation_id: &str,
        message: &str,
        extracted: BTreeMap<String, String>,
        input: &TurnInput,
    ) -> Option<ConversationState> {
        self.store
            .with_mut(conversation_id, |state| {
                if input.cancel {
                    state.collected_data.clear();
                } else {
                    // A free-text reply while waiting for preferences is the preference
                    if state.current_state == FlowState::CollectingPreferences
                        && !extracted.contains_key(slots::PREFERENCES)
                    {
                        state
                            .collected_data
                            .insert(slots::PREFERENCES.to_string(), message.trim().to_string());
                    }
                    state.collected_data.extend(extracted);
                }
                state.push_message(ConversationMessage::new(Role::User, message));

                let next = state.current_state.advance(input, &state.collected_data);
                if next != state.current_state {
                    debug!(
                        "Conversation {}: {:?} -> {:?}",
                        state.conversation_id, state.current_state, next
                    );
                }
                state.current_state = next;
                state.last_activity_at = Utc::now();
                state.clone()
            })
            .await
    }

    /// Record the assistant's reply and close a finished generation
    pub async fn complete_turn(&self, conversation_id: &str, reply: &str) -> Option<ConversationState> {
        let mut patch = ConversationPatch {
            messages: vec![ConversationMessage::new(Role::Assistant, reply)],
            ..Default::default()
        };
        let current = self.peek(conversation_id).await?;
        if current.current_state == FlowState::Generating {
            patch.state = Some(FlowState::Idle);
        }
        self.update(conversation_id, patch).await
    }

    /// Read the state without bumping the interaction counter
    pub async fn peek(&self, conversation_id: &str) -> Option<ConversationState> {
        let entry = self.store.get(conversation_id).await?;
        let state = entry.lock().clone();
        Some(state)
    }

    pub async fn remove(&self, conversation_id: &str) -> bool {
        self.store.remove(conversation_id).await
    }

    pub async fn sweep(&self) {
        self.store.sweep().await;
    }

    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn idle_window(&self) -> Duration {
        self.store.idle_window()
    }

    /// Periodically evict idle conversations until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.sweep().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Conversation sweeper [{}] stopped", store.store.name());
                        break;
                    }
                }
            }
        })
    }
}
