//! In-memory conversation history for the admin assistant chat.

use bridge_llm::{ChatMessage, Role};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MAX_HISTORY_MESSAGES: usize = 40;
pub const MAX_CONVERSATIONS: usize = 512;
pub const CONVERSATION_IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

struct Conversation {
    messages: Vec<ChatMessage>,
    touched: Instant,
}

/// Conversations idle past the TTL are dropped, and the least recently used ones go first once
/// the map is full.
#[derive(Clone)]
pub struct ChatSessions {
    sessions: Arc<DashMap<String, Conversation>>,
    max_conversations: usize,
    idle_ttl: Duration,
}

impl Default for ChatSessions {
    fn default() -> Self {
        Self::with_limits(MAX_CONVERSATIONS, CONVERSATION_IDLE_TTL)
    }
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_conversations: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            max_conversations: max_conversations.max(1),
            idle_ttl,
        }
    }

    pub fn history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .get(conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    /// Tool calls of the last assistant message that have no result yet.
    pub fn pending_tool_call_ids(&self, conversation_id: &str) -> Vec<String> {
        let Some(entry) = self.sessions.get(conversation_id) else {
            return Vec::new();
        };
        let messages = &entry.messages;
        let Some(call_at) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return Vec::new();
        };
        let answered: Vec<&str> = messages[call_at + 1..]
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        messages[call_at]
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(&call.id.as_str()))
            .map(|call| call.id.clone())
            .collect()
    }

    /// Appends a turn and drops the oldest messages beyond [`MAX_HISTORY_MESSAGES`].
    pub fn append(&self, conversation_id: &str, messages: impl IntoIterator<Item = ChatMessage>) {
        {
            let mut entry = self
                .sessions
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation {
                    messages: Vec::new(),
                    touched: Instant::now(),
                });
            entry.touched = Instant::now();
            let history = &mut entry.messages;
            history.extend(messages);
            if history.len() > MAX_HISTORY_MESSAGES {
                let excess = history.len() - MAX_HISTORY_MESSAGES;
                history.drain(..excess);
            }
            // A tool result without its assistant call is rejected upstream.
            while history.first().is_some_and(|m| m.role == Role::Tool) {
                history.remove(0);
            }
        }
        self.evict(conversation_id);
    }

    fn evict(&self, keep: &str) {
        let now = Instant::now();
        self.sessions
            .retain(|id, c| id == keep || now.duration_since(c.touched) < self.idle_ttl);
        while self.sessions.len() > self.max_conversations {
            let oldest = self
                .sessions
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.touched)
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else { break };
            self.sessions.remove(&oldest);
            tracing::debug!(conversation_id = %oldest, "assistant conversation evicted");
        }
    }

    pub fn reset(&self, conversation_id: &str) -> bool {
        self.sessions.remove(conversation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_llm::ToolCall;

    #[test]
    fn history_is_capped_oldest_first() {
        let sessions = ChatSessions::new();
        for i in 0..30 {
            sessions.append(
                "c1",
                [ChatMessage::user(format!("q{i}")), ChatMessage::assistant(format!("a{i}"))],
            );
        }
        let history = sessions.history("c1");
        assert_eq!(history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(history[0].content, "q10");
        assert_eq!(history[MAX_HISTORY_MESSAGES - 1].content, "a29");
        assert!(sessions.history("other").is_empty());
    }

    #[test]
    fn reset_forgets_conversation() {
        let sessions = ChatSessions::new();
        sessions.append("c1", [ChatMessage::user("hi")]);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.reset("c1"));
        assert!(!sessions.reset("c1"));
        assert!(sessions.history("c1").is_empty());
    }

    #[test]
    fn least_recently_used_conversation_is_evicted() {
        let sessions = ChatSessions::with_limits(2, CONVERSATION_IDLE_TTL);
        sessions.append("c1", [ChatMessage::user("one")]);
        sessions.append("c2", [ChatMessage::user("two")]);
        sessions.append("c1", [ChatMessage::user("one again")]);
        sessions.append("c3", [ChatMessage::user("three")]);
        assert_eq!(sessions.len(), 2);
        assert!(sessions.history("c2").is_empty());
        assert_eq!(sessions.history("c1").len(), 2);
    }

    #[test]
    fn idle_conversations_expire() {
        let sessions = ChatSessions::with_limits(10, Duration::from_millis(20));
        sessions.append("old", [ChatMessage::user("hi")]);
        std::thread::sleep(Duration::from_millis(40));
        sessions.append("new", [ChatMessage::user("hello")]);
        assert!(sessions.history("old").is_empty());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn pending_tool_calls_clear_once_answered() {
        let sessions = ChatSessions::new();
        let mut call = ChatMessage::assistant("");
        call.tool_calls = vec![
            ToolCall {
                id: "call_1".to_string(),
                name: "lookup_leave".to_string(),
                arguments: "{}".to_string(),
            },
            ToolCall {
                id: "call_2".to_string(),
                name: "lookup_payslip".to_string(),
                arguments: "{}".to_string(),
            },
        ];
        sessions.append("c1", [ChatMessage::user("balances?"), call]);
        assert_eq!(sessions.pending_tool_call_ids("c1"), vec!["call_1", "call_2"]);

        sessions.append("c1", [ChatMessage::tool_result("call_1", "12 days")]);
        assert_eq!(sessions.pending_tool_call_ids("c1"), vec!["call_2"]);
        assert!(sessions.pending_tool_call_ids("missing").is_empty());
    }
}
