//! 对话消息：推理后端的输入单元
//!
//! 会话中的每一轮 user/assistant 消息都会以 `conversation` 标签写入 MemoryStore，
//! 需要历史时按标签查询并还原为 Message。

use serde::{Deserialize, Serialize};

use crate::memory::MemoryRecord;

/// 对话轮次在 MemoryStore 中使用的标签
pub const CONVERSATION_TAG: &str = "conversation";
const ROLE_TAG_USER: &str = "role:user";
const ROLE_TAG_ASSISTANT: &str = "role:assistant";

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// 转为可写入 MemoryStore 的对话记录
    pub fn to_record(&self, session_id: &str) -> MemoryRecord {
        let role_tag = match self.role {
            Role::User => ROLE_TAG_USER,
            _ => ROLE_TAG_ASSISTANT,
        };
        MemoryRecord::new(session_id, self.content.clone())
            .with_tags([CONVERSATION_TAG, role_tag])
            .with_importance(0.3)
    }

    /// 从对话记录还原；非对话记录返回 None
    pub fn from_record(record: &MemoryRecord) -> Option<Self> {
        if !record.has_tag(CONVERSATION_TAG) {
            return None;
        }
        if record.has_tag(ROLE_TAG_USER) {
            Some(Message::user(record.content.clone()))
        } else {
            Some(Message::assistant(record.content.clone()))
        }
    }
}

/// 取最近 max_turns 轮（每轮 user + assistant，约 max_turns*2 条），按时间正序返回
pub fn recent_history(records: &[MemoryRecord], max_turns: usize) -> Vec<Message> {
    let messages: Vec<Message> = records.iter().filter_map(Message::from_record).collect();
    let keep = max_turns * 2;
    let skip = messages.len().saturating_sub(keep);
    messages.into_iter().skip(skip).collect()
}
