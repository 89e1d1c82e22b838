use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_core::types::{AgentId, ChannelId, DataMap, MessageId};

/// Message type given to synthesized replies.
pub const REPLY_TYPE: &str = "reply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Processed,
}

/// A message carried over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub source: AgentId,
    pub target: AgentId,
    pub message_type: String,
    /// Handed to the target agent as its inputs.
    pub content: DataMap,
    #[serde(default)]
    pub metadata: DataMap,
    pub requires_reply: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    pub status: MessageStatus,
    /// Handler failure recorded during dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub(crate) fn from_outgoing(out: OutgoingMessage) -> Self {
        Self {
            id: MessageId::new(),
            channel_id: out.channel_id,
            source: out.source,
            target: out.target,
            message_type: out.message_type,
            content: out.content,
            metadata: out.metadata,
            requires_reply: out.requires_reply,
            reply_to_id: out.reply_to_id,
            status: MessageStatus::Sent,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// The reply `original`'s target sends back with its handler outputs.
    pub(crate) fn reply_to(original: &Message, outputs: DataMap) -> Self {
        Self::from_outgoing(OutgoingMessage {
            channel_id: original.channel_id.clone(),
            source: original.target.clone(),
            target: original.source.clone(),
            message_type: REPLY_TYPE.to_string(),
            content: outputs,
            metadata: DataMap::new(),
            requires_reply: false,
            reply_to_id: Some(original.id.clone()),
        })
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }

    pub fn is_processed(&self) -> bool {
        self.status == MessageStatus::Processed
    }
}

/// A message to be sent, before the manager assigns it an id.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub channel_id: ChannelId,
    pub source: AgentId,
    pub target: AgentId,
    pub message_type: String,
    pub content: DataMap,
    pub metadata: DataMap,
    pub requires_reply: bool,
    pub reply_to_id: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn new(
        channel_id: &ChannelId,
        source: &AgentId,
        target: &AgentId,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.clone(),
            source: source.clone(),
            target: target.clone(),
            message_type: message_type.into(),
            content: DataMap::new(),
            metadata: DataMap::new(),
            requires_reply: false,
            reply_to_id: None,
        }
    }

    pub fn with_content(mut self, content: DataMap) -> Self {
        self.content = content;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn requiring_reply(mut self) -> Self {
        self.requires_reply = true;
        self
    }

    pub fn in_reply_to(mut self, id: &MessageId) -> Self {
        self.reply_to_id = Some(id.clone());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_swaps_endpoints() {
        let out = OutgoingMessage::new(
            &ChannelId::from("ch"),
            &AgentId::from("boss"),
            &AgentId::from("worker"),
            "task",
        )
        .with_metadata("trace", json!("t-1"))
        .requiring_reply();
        let original = Message::from_outgoing(out);
        assert_eq!(original.status, MessageStatus::Sent);
        assert!(!original.is_reply());

        let mut outputs = DataMap::new();
        outputs.insert("done".into(), json!(true));
        let reply = Message::reply_to(&original, outputs);

        assert_eq!(reply.source.as_str(), "worker");
        assert_eq!(reply.target.as_str(), "boss");
        assert_eq!(reply.message_type, REPLY_TYPE);
        assert!(!reply.requires_reply);
        assert_eq!(reply.reply_to_id.as_ref(), Some(&original.id));
        assert_eq!(reply.content["done"], json!(true));
        assert_ne!(reply.id, original.id);
    }
}
