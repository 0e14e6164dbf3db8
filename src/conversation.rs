//! Multi-turn conversation model.
//!
//! A [`Conversation`] holds an ordered sequence of [`Turn`]s between two
//! participants, serialized mutations behind a per-conversation lock,
//! per-conversation rolling-window rate limits, and JSON round-tripping.
//! Conversations live in memory only; lifecycle is caller-managed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::validation::{ContentKind, default_validator};

/// Estimated object overhead multiplier on top of raw string bytes.
const MEMORY_OVERHEAD_FACTOR: f64 = 1.5;

/// Kind of conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    #[default]
    Human,
    Bot,
    Agent,
    AiModel,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantKind::Human => write!(f, "human"),
            ParticipantKind::Bot => write!(f, "bot"),
            ParticipantKind::Agent => write!(f, "agent"),
            ParticipantKind::AiModel => write!(f, "ai_model"),
            ParticipantKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One prompt-response exchange. `response` is `None` until the model
/// replies; a turn with only a prompt is *incomplete*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub speaker: String,
    pub listener: String,
    pub speaker_type: ParticipantKind,
    pub listener_type: ParticipantKind,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Turn {
    /// True when the turn has both prompt and response.
    pub fn is_complete(&self) -> bool {
        self.response.is_some()
    }
}

/// The two participants of a conversation, referenced by string identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participants {
    pub initiator: String,
    pub responder: String,
    #[serde(default)]
    pub initiator_type: ParticipantKind,
    #[serde(default)]
    pub responder_type: ParticipantKind,
}

/// Per-conversation rate limit configuration. Windows are rolling: 60
/// seconds for the minute limit, 3600 seconds for the hour limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns_per_hour: Option<u32>,
}

impl TurnRateLimit {
    fn is_configured(&self) -> bool {
        self.turns_per_minute.is_some() || self.turns_per_hour.is_some()
    }
}

/// What to do when a conversation rate limit fires. Affects logging only;
/// the check's return value is purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    Block,
    Warn,
    Log,
}

#[derive(Debug, Default)]
struct ConversationState {
    turns: Vec<Turn>,
    last_activity: Option<DateTime<Utc>>,
    rate_limit: TurnRateLimit,
    rate_limit_turns: Vec<DateTime<Utc>>,
}

/// An ordered multi-turn conversation with thread-safe mutation.
#[derive(Debug)]
pub struct Conversation {
    conversation_id: String,
    participants: Participants,
    model_info: Map<String, Value>,
    metadata: Map<String, Value>,
    created_at: DateTime<Utc>,
    state: Mutex<ConversationState>,
}

impl Conversation {
    /// Creates a conversation between two participants.
    pub fn new(
        initiator: impl Into<String>,
        responder: impl Into<String>,
        initiator_type: ParticipantKind,
        responder_type: ParticipantKind,
    ) -> Self {
        let participants = Participants {
            initiator: initiator.into(),
            responder: responder.into(),
            initiator_type,
            responder_type,
        };
        let conversation_id = Uuid::new_v4().to_string();
        tracing::info!(
            conversation_id = %conversation_id,
            initiator = %participants.initiator,
            responder = %participants.responder,
            "created conversation"
        );
        Self {
            conversation_id,
            participants,
            model_info: Map::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            state: Mutex::new(ConversationState::default()),
        }
    }

    /// Human-to-AI conversation. `model_id` is recorded in `model_info`.
    pub fn human_ai(user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let mut conversation = Self::new(
            user_id,
            model_id.clone(),
            ParticipantKind::Human,
            ParticipantKind::AiModel,
        );
        conversation
            .model_info
            .insert("model_id".to_string(), Value::String(model_id));
        conversation
    }

    /// Bot-to-bot conversation.
    pub fn bot_to_bot(bot1: impl Into<String>, bot2: impl Into<String>) -> Self {
        Self::new(bot1, bot2, ParticipantKind::Bot, ParticipantKind::Bot)
    }

    /// Agent-to-agent conversation.
    pub fn agent_to_agent(agent1: impl Into<String>, agent2: impl Into<String>) -> Self {
        Self::new(agent1, agent2, ParticipantKind::Agent, ParticipantKind::Agent)
    }

    /// Human-to-human conversation.
    pub fn human_to_human(user1: impl Into<String>, user2: impl Into<String>) -> Self {
        Self::new(user1, user2, ParticipantKind::Human, ParticipantKind::Human)
    }

    /// Sets an explicit conversation id (builder-style).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = id.into();
        self
    }

    /// Sets the per-conversation rate limit (builder-style).
    pub fn with_rate_limit(self, rate_limit: TurnRateLimit) -> Self {
        self.state.lock().rate_limit = rate_limit;
        self
    }

    pub fn id(&self) -> &str {
        &self.conversation_id
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn model_info(&self) -> &Map<String, Value> {
        &self.model_info
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().last_activity.unwrap_or(self.created_at)
    }

    /// Adds a complete prompt-response exchange.
    pub fn add_exchange(&self, prompt: &str, response: &str) -> Result<Turn> {
        self.add_turn(prompt, Some(response), Map::new())
    }

    /// Adds a complete exchange with per-turn metadata.
    pub fn add_exchange_with_metadata(
        &self,
        prompt: &str,
        response: &str,
        metadata: Map<String, Value>,
    ) -> Result<Turn> {
        self.add_turn(prompt, Some(response), metadata)
    }

    /// Adds a prompt-only (incomplete) turn; the response arrives later via
    /// [`add_response`](Self::add_response).
    pub fn add_prompt(&self, prompt: &str) -> Result<Turn> {
        self.add_turn(prompt, None, Map::new())
    }

    fn add_turn(
        &self,
        prompt: &str,
        response: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<Turn> {
        let validator = default_validator();
        validator.validate_content(prompt, ContentKind::Prompt)?;
        if let Some(response) = response {
            validator.validate_content(response, ContentKind::Response)?;
        }

        let mut state = self.state.lock();

        // At most one trailing incomplete turn.
        if let Some(last) = state.turns.last()
            && !last.is_complete()
        {
            return Err(Error::conversation_limit(
                "previous turn has no response yet; call add_response first",
            ));
        }

        let memory_mb = estimate_memory_mb(&state.turns, prompt, response);
        validator
            .validate_conversation(state.turns.len() + 1, memory_mb, self.created_at)
            .map_err(|e| Error::conversation_limit(e.to_string()))?;

        let now = Utc::now();
        let turn = Turn {
            timestamp: now,
            prompt: prompt.to_string(),
            response: response.map(str::to_string),
            speaker: self.participants.initiator.clone(),
            listener: self.participants.responder.clone(),
            speaker_type: self.participants.initiator_type,
            listener_type: self.participants.responder_type,
            metadata,
        };

        state.turns.push(turn.clone());
        state.last_activity = Some(now);
        state.rate_limit_turns.push(now);
        Self::cleanup_rate_limit_entries(&mut state, now);

        tracing::debug!(
            conversation_id = %self.conversation_id,
            turn_count = state.turns.len(),
            "added turn"
        );
        Ok(turn)
    }

    /// Completes the trailing incomplete turn with a response.
    ///
    /// Errors when no incomplete turn exists.
    pub fn add_response(&self, response: &str) -> Result<Turn> {
        default_validator().validate_content(response, ContentKind::Response)?;

        let mut state = self.state.lock();
        let Some(last) = state.turns.last_mut() else {
            return Err(Error::conversation_limit(
                "no prompt-only turn exists to add a response to",
            ));
        };
        if last.is_complete() {
            return Err(Error::conversation_limit(
                "no prompt-only turn exists to add a response to",
            ));
        }

        last.response = Some(response.to_string());
        let turn = last.clone();
        state.last_activity = Some(Utc::now());
        Ok(turn)
    }

    /// Merges metadata into the most recent turn. Used by the pipeline to
    /// annotate turns with guardrail verdicts.
    pub fn annotate_last_turn(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        if let Some(last) = state.turns.last_mut() {
            last.metadata.insert(key.to_string(), value);
        }
    }

    /// Conversation history in chronological order; `limit` keeps only the
    /// most recent turns.
    pub fn history(&self, limit: Option<usize>) -> Vec<Turn> {
        let state = self.state.lock();
        match limit {
            Some(n) if n < state.turns.len() => state.turns[state.turns.len() - n..].to_vec(),
            _ => state.turns.clone(),
        }
    }

    /// All turns that have both prompt and response.
    pub fn complete_turns(&self) -> Vec<Turn> {
        self.state
            .lock()
            .turns
            .iter()
            .filter(|t| t.is_complete())
            .cloned()
            .collect()
    }

    /// All prompt-only turns.
    pub fn incomplete_turns(&self) -> Vec<Turn> {
        self.state
            .lock()
            .turns
            .iter()
            .filter(|t| !t.is_complete())
            .cloned()
            .collect()
    }

    pub fn turn_count(&self) -> usize {
        self.state.lock().turns.len()
    }

    /// Seconds from creation to last activity.
    pub fn duration_seconds(&self) -> f64 {
        let state = self.state.lock();
        match state.last_activity {
            Some(last) => (last - self.created_at).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }

    /// Checks the conversation's rolling-window rate limits.
    ///
    /// Returns true when any configured window is exceeded. The `action`
    /// controls log severity only.
    pub fn check_rate_limit(&self, action: RateLimitAction) -> bool {
        let state = self.state.lock();
        if !state.rate_limit.is_configured() {
            return false;
        }

        let now = Utc::now();
        let mut fired = Vec::new();

        if let Some(limit) = state.rate_limit.turns_per_minute {
            let cutoff = now - chrono::Duration::seconds(60);
            let count = state.rate_limit_turns.iter().filter(|t| **t >= cutoff).count();
            if count >= limit as usize {
                fired.push(format!("minute limit: {count}/{limit}"));
            }
        }
        if let Some(limit) = state.rate_limit.turns_per_hour {
            let cutoff = now - chrono::Duration::seconds(3600);
            let count = state.rate_limit_turns.iter().filter(|t| **t >= cutoff).count();
            if count >= limit as usize {
                fired.push(format!("hour limit: {count}/{limit}"));
            }
        }

        if fired.is_empty() {
            return false;
        }

        let message = format!(
            "Rate limit exceeded for conversation {}: {}",
            self.conversation_id,
            fired.join(", ")
        );
        match action {
            RateLimitAction::Block | RateLimitAction::Warn => tracing::warn!("{message}"),
            RateLimitAction::Log => tracing::info!("{message}"),
        }
        true
    }

    /// Replaces the rate limit configuration.
    pub fn set_rate_limit(&self, rate_limit: TurnRateLimit) {
        self.state.lock().rate_limit = rate_limit;
    }

    /// Clears rate limit tracking.
    pub fn reset_rate_limit(&self) {
        self.state.lock().rate_limit_turns.clear();
    }

    /// Estimated memory footprint in megabytes.
    pub fn estimated_memory_mb(&self) -> f64 {
        let state = self.state.lock();
        estimate_memory_mb(&state.turns, "", None)
    }

    fn cleanup_rate_limit_entries(state: &mut ConversationState, now: DateTime<Utc>) {
        if !state.rate_limit.is_configured() {
            return;
        }
        // Keep the widest configured window.
        let window = if state.rate_limit.turns_per_hour.is_some() {
            3600
        } else {
            60
        };
        let cutoff = now - chrono::Duration::seconds(window);
        state.rate_limit_turns.retain(|t| *t >= cutoff);
    }

    /// Serializes the conversation to a JSON value.
    pub fn to_json(&self) -> Value {
        let state = self.state.lock();
        serde_json::to_value(ConversationSnapshot {
            conversation_id: self.conversation_id.clone(),
            participants: self.participants.clone(),
            model_info: self.model_info.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity.unwrap_or(self.created_at),
            turn_count: state.turns.len(),
            rate_limit: state.rate_limit.clone(),
            turns: state.turns.clone(),
        })
        .expect("conversation snapshot serializes")
    }

    /// Restores a conversation from [`to_json`](Self::to_json) output.
    pub fn from_json(value: &Value) -> Result<Self> {
        let snapshot: ConversationSnapshot = serde_json::from_value(value.clone())
            .map_err(|e| Error::config(format!("invalid conversation snapshot: {e}")))?;

        let rate_limit_turns = snapshot.turns.iter().map(|t| t.timestamp).collect();
        Ok(Self {
            conversation_id: snapshot.conversation_id,
            participants: snapshot.participants,
            model_info: snapshot.model_info,
            metadata: snapshot.metadata,
            created_at: snapshot.created_at,
            state: Mutex::new(ConversationState {
                turns: snapshot.turns,
                last_activity: Some(snapshot.last_activity),
                rate_limit: snapshot.rate_limit,
                rate_limit_turns,
            }),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ConversationSnapshot {
    conversation_id: String,
    participants: Participants,
    #[serde(default)]
    model_info: Map<String, Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    #[serde(default)]
    turn_count: usize,
    #[serde(default)]
    rate_limit: TurnRateLimit,
    #[serde(default)]
    turns: Vec<Turn>,
}

fn estimate_memory_mb(turns: &[Turn], pending_prompt: &str, pending_response: Option<&str>) -> f64 {
    let mut total_bytes = pending_prompt.len() + pending_response.map_or(0, str::len);
    for turn in turns {
        total_bytes += turn.prompt.len();
        total_bytes += turn.response.as_deref().map_or(0, str::len);
    }
    (total_bytes as f64 * MEMORY_OVERHEAD_FACTOR) / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_exchange_and_history() {
        let conversation = Conversation::human_ai("user_1", "gpt-4o-mini");
        conversation.add_exchange("hello", "hi there").unwrap();
        conversation.add_exchange("how are you?", "fine").unwrap();

        let history = conversation.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].prompt, "hello");
        assert_eq!(history[0].response.as_deref(), Some("hi there"));
        assert_eq!(history[0].speaker, "user_1");
        assert_eq!(history[0].speaker_type, ParticipantKind::Human);
        assert!(history[0].timestamp <= history[1].timestamp);
    }

    #[test]
    fn test_history_limit() {
        let conversation = Conversation::human_ai("u", "m");
        for i in 0..5 {
            conversation
                .add_exchange(&format!("p{i}"), &format!("r{i}"))
                .unwrap();
        }
        let recent = conversation.history(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].prompt, "p3");
        assert_eq!(recent[1].prompt, "p4");
    }

    #[test]
    fn test_prompt_then_response() {
        let conversation = Conversation::human_ai("u", "m");
        conversation.add_prompt("pending question").unwrap();
        assert_eq!(conversation.incomplete_turns().len(), 1);
        assert_eq!(conversation.complete_turns().len(), 0);

        conversation.add_response("the answer").unwrap();
        assert_eq!(conversation.incomplete_turns().len(), 0);
        assert_eq!(conversation.complete_turns().len(), 1);
    }

    #[test]
    fn test_add_response_without_prompt_fails() {
        let conversation = Conversation::human_ai("u", "m");
        assert!(conversation.add_response("orphan").is_err());

        conversation.add_exchange("p", "r").unwrap();
        assert!(conversation.add_response("still orphan").is_err());
    }

    #[test]
    fn test_at_most_one_trailing_incomplete_turn() {
        let conversation = Conversation::human_ai("u", "m");
        conversation.add_prompt("first").unwrap();
        let err = conversation.add_prompt("second").unwrap_err();
        assert!(matches!(err, Error::ConversationLimit { .. }));
    }

    #[test]
    fn test_turn_cap_enforced() {
        let conversation = Conversation::human_ai("u", "m");
        for i in 0..50 {
            conversation.add_exchange(&format!("p{i}"), "r").unwrap();
        }
        let err = conversation.add_exchange("one too many", "r").unwrap_err();
        assert!(matches!(err, Error::ConversationLimit { .. }));
    }

    #[test]
    fn test_rate_limit_minute_window() {
        let conversation = Conversation::human_ai("u", "m").with_rate_limit(TurnRateLimit {
            turns_per_minute: Some(2),
            turns_per_hour: None,
        });

        conversation.add_exchange("a", "b").unwrap();
        assert!(!conversation.check_rate_limit(RateLimitAction::Log));
        conversation.add_exchange("c", "d").unwrap();
        assert!(conversation.check_rate_limit(RateLimitAction::Block));

        conversation.reset_rate_limit();
        assert!(!conversation.check_rate_limit(RateLimitAction::Log));
    }

    #[test]
    fn test_no_rate_limit_configured() {
        let conversation = Conversation::human_ai("u", "m");
        for i in 0..10 {
            conversation.add_exchange(&format!("p{i}"), "r").unwrap();
        }
        assert!(!conversation.check_rate_limit(RateLimitAction::Block));
    }

    #[test]
    fn test_json_round_trip() {
        let conversation = Conversation::human_ai("user_9", "gpt-4o").with_id("conv-42");
        conversation.add_exchange("hello", "hi").unwrap();
        conversation.add_prompt("still waiting").unwrap();

        let value = conversation.to_json();
        let restored = Conversation::from_json(&value).unwrap();

        assert_eq!(restored.id(), "conv-42");
        assert_eq!(restored.participants().initiator, "user_9");
        assert_eq!(restored.turn_count(), 2);
        assert_eq!(restored.incomplete_turns().len(), 1);
        assert_eq!(restored.history(None)[0].prompt, "hello");
    }

    #[test]
    fn test_annotate_last_turn() {
        let conversation = Conversation::human_ai("u", "m");
        conversation.add_exchange("p", "r").unwrap();
        conversation.annotate_last_turn(
            "guardrail_results",
            serde_json::json!({"blocked": true, "reasons": ["keyword"]}),
        );
        let turn = conversation.history(None).pop().unwrap();
        assert!(turn.metadata["guardrail_results"]["blocked"].as_bool().unwrap());
    }

    #[test]
    fn test_memory_estimate_grows() {
        let conversation = Conversation::human_ai("u", "m");
        let before = conversation.estimated_memory_mb();
        conversation
            .add_exchange(&"x".repeat(10_000), &"y".repeat(10_000))
            .unwrap();
        assert!(conversation.estimated_memory_mb() > before);
    }
}
