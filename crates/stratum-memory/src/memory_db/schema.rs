//! Database schema definitions for the conversation-memory system

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// A chat conversation. Created by the surrounding application; the memory
/// engine reads it for the title and recency ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable unit of a conversation. Owned by the surrounding application;
/// the memory engine only reads messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A contiguous, summarized run of messages.
///
/// Invariant: chunks for a conversation are time-ordered and non-overlapping;
/// the union of all chunk ranges plus the unchunked tail covers the
/// conversation exactly once. Rows are only ever mutated to attach a vector
/// id after embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationChunk {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub message_count: i32,
    pub summary: String,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    /// 0.0 - 1.0, assigned by the summarization provider.
    pub importance: f32,
    /// 0.0 - 1.0, how well the window hangs together as one unit.
    pub coherence: f32,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub vector_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Conversation-level digest; exactly one live row per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationIndex {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
    pub digest: String,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub message_count: i64,
    pub chunk_count: i64,
    pub first_activity_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub vector_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Section a long-term user memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySection {
    Preference,
    WorkContext,
    PersonalFact,
    Goal,
    CommunicationStyle,
    Relationship,
}

impl MemorySection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySection::Preference => "preference",
            MemorySection::WorkContext => "work_context",
            MemorySection::PersonalFact => "personal_fact",
            MemorySection::Goal => "goal",
            MemorySection::CommunicationStyle => "communication_style",
            MemorySection::Relationship => "relationship",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preference" => Some(MemorySection::Preference),
            "work_context" => Some(MemorySection::WorkContext),
            "personal_fact" => Some(MemorySection::PersonalFact),
            "goal" => Some(MemorySection::Goal),
            "communication_style" => Some(MemorySection::CommunicationStyle),
            "relationship" => Some(MemorySection::Relationship),
            _ => None,
        }
    }
}

/// Long-term user fact, written by a fact-extraction collaborator and
/// read-mostly here. Access counters are bumped every time a memory is
/// returned in an assembled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: i64,
    pub user_id: String,
    pub section: MemorySection,
    pub content: String,
    /// 1 - 10, assigned at extraction time.
    pub importance: i32,
    pub access_count: i32,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Observational record of the last assembled context for a conversation.
/// Safe to drop and rebuild at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextState {
    pub conversation_id: String,
    pub recent_message_ids: Vec<i64>,
    pub chunk_ids: Vec<String>,
    pub memory_ids: Vec<i64>,
    pub recent_tokens: i64,
    pub historical_tokens: i64,
    pub memory_tokens: i64,
    pub total_tokens: i64,
    pub content_bytes: i64,
    pub last_query: String,
    pub compression_level: Option<i32>,
    pub compression_ratio: Option<f32>,
    pub updated_at: DateTime<Utc>,
}

/// Row counts plus file size, for operational visibility.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_chunks: i64,
    pub total_indices: i64,
    pub total_memories: i64,
    pub total_context_states: i64,
    pub database_size_bytes: i64,
}

pub const SCHEMA_SQL: &str = "
-- Conversations table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Messages table
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
-- Conversation chunks table
CREATE TABLE IF NOT EXISTS conversation_chunks (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    start_message_id INTEGER NOT NULL,
    end_message_id INTEGER NOT NULL,
    message_count INTEGER NOT NULL,
    summary TEXT NOT NULL,
    topics TEXT NOT NULL,
    entities TEXT NOT NULL,
    keywords TEXT NOT NULL,
    importance REAL NOT NULL,
    coherence REAL NOT NULL,
    first_message_at TIMESTAMP NOT NULL,
    last_message_at TIMESTAMP NOT NULL,
    vector_id TEXT,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    UNIQUE(conversation_id, start_message_id)
);
-- Conversation index table (one digest row per conversation)
CREATE TABLE IF NOT EXISTS conversation_indices (
    conversation_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    digest TEXT NOT NULL,
    topics TEXT NOT NULL,
    entities TEXT NOT NULL,
    keywords TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    first_activity_at TIMESTAMP NOT NULL,
    last_activity_at TIMESTAMP NOT NULL,
    vector_id TEXT,
    updated_at TIMESTAMP NOT NULL
);
-- Long-term user memories table
CREATE TABLE IF NOT EXISTS user_memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    section TEXT NOT NULL,
    content TEXT NOT NULL,
    importance INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL
);
-- Context states table (observational, one row per conversation)
CREATE TABLE IF NOT EXISTS context_states (
    conversation_id TEXT PRIMARY KEY,
    recent_message_ids TEXT NOT NULL,
    chunk_ids TEXT NOT NULL,
    memory_ids TEXT NOT NULL,
    recent_tokens INTEGER NOT NULL,
    historical_tokens INTEGER NOT NULL,
    memory_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    content_bytes INTEGER NOT NULL,
    last_query TEXT NOT NULL,
    compression_level INTEGER,
    compression_ratio REAL,
    updated_at TIMESTAMP NOT NULL
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations (user_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_chunks_conversation ON conversation_chunks (conversation_id, start_message_id);
CREATE INDEX IF NOT EXISTS idx_chunks_user ON conversation_chunks (user_id);
CREATE INDEX IF NOT EXISTS idx_memories_user ON user_memories (user_id, importance);
";
