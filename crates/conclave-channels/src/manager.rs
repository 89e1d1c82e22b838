use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conclave_agent::Agent;
use conclave_core::config::CommunicationConfig;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::emit;
use conclave_core::traits::EventSink;
use conclave_core::types::{AgentId, ChannelId, DataMap, Event, EventKind, MessageId};

use crate::channel::{Channel, ChannelState};
use crate::message::{Message, MessageStatus, OutgoingMessage};

/// State key under which a delivered message is stored on its target agent.
pub const LAST_MESSAGE_KEY: &str = "last_message";

type ReplySender = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct MessageLog {
    by_id: HashMap<MessageId, Message>,
    /// Message ids per channel, in send order.
    by_channel: HashMap<ChannelId, Vec<MessageId>>,
}

/// Routes messages between registered agents over explicit channels.
///
/// Sending validates and stores the message, then dispatches it to the
/// target agent on a background task. Replies are synthesized from the
/// target's outputs and travel back through the same path.
///
/// The message log is kept until `prune_processed` drops old entries.
pub struct CommunicationManager {
    config: CommunicationConfig,
    agents: RwLock<HashMap<AgentId, Arc<Agent>>>,
    channels: RwLock<HashMap<ChannelId, Channel>>,
    messages: RwLock<MessageLog>,
    /// Callers of `send_and_wait` parked on a reply, keyed by request id.
    waiters: Mutex<HashMap<MessageId, ReplySender>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    events: Option<Arc<dyn EventSink>>,
}

impl CommunicationManager {
    pub fn new(config: CommunicationConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            messages: RwLock::new(MessageLog::default()),
            waiters: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    // ── Agents ─────────────────────────────────────────────────

    /// Make `agent` a valid channel endpoint.
    pub fn register_agent(&self, agent: Arc<Agent>) {
        debug!(agent = %agent.name(), agent_id = %agent.id(), "Registering agent for messaging");
        self.agents.write().insert(agent.id().clone(), agent);
    }

    /// Remove an agent. Its channels stay; deliveries to it fail.
    pub fn unregister_agent(&self, id: &AgentId) -> Result<Arc<Agent>> {
        self.agents
            .write()
            .remove(id)
            .ok_or_else(|| ConclaveError::not_found("agent", id))
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.read().get(id).cloned()
    }

    pub fn is_registered(&self, id: &AgentId) -> bool {
        self.agents.read().contains_key(id)
    }

    // ── Channels ───────────────────────────────────────────────

    /// Open a channel between two registered agents.
    pub fn create_channel(
        &self,
        source: &AgentId,
        target: &AgentId,
        pattern: impl Into<String>,
    ) -> Result<Channel> {
        {
            let agents = self.agents.read();
            for endpoint in [source, target] {
                if !agents.contains_key(endpoint) {
                    return Err(ConclaveError::not_found("agent", endpoint));
                }
            }
        }
        if source == target {
            return Err(ConclaveError::Precondition(format!(
                "channel endpoints must differ, got {} twice",
                source
            )));
        }

        let channel = Channel::new(source.clone(), target.clone(), pattern);
        self.channels
            .write()
            .insert(channel.id.clone(), channel.clone());

        info!(
            channel_id = %channel.id,
            source = %source,
            target = %target,
            pattern = %channel.pattern,
            "Channel created"
        );
        emit(
            &self.events,
            Event::new(EventKind::ChannelCreated)
                .with_channel(&channel.id)
                .with_agent(source)
                .with_data(serde_json::json!({
                    "source_agent_id": source,
                    "target_agent_id": target,
                    "pattern": channel.pattern,
                })),
        );
        Ok(channel)
    }

    pub fn get_channel(&self, id: &ChannelId) -> Result<Channel> {
        self.channels
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("channel", id))
    }

    /// Channels joining `a` and `b` in either direction, oldest first.
    pub fn get_channels_between_agents(&self, a: &AgentId, b: &AgentId) -> Vec<Channel> {
        let mut found: Vec<Channel> = self
            .channels
            .read()
            .values()
            .filter(|c| c.connects(a, b))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }

    /// Move a channel to `state`. Setting the current state changes nothing.
    pub fn update_channel_state(&self, id: &ChannelId, state: ChannelState) -> Result<Channel> {
        let (channel, previous) = {
            let mut channels = self.channels.write();
            let channel = channels
                .get_mut(id)
                .ok_or_else(|| ConclaveError::not_found("channel", id))?;
            if channel.state == state {
                return Ok(channel.clone());
            }
            let previous = channel.transition(state)?;
            (channel.clone(), previous)
        };

        info!(channel_id = %id, from = %previous, to = %state, "Channel state changed");
        let kind = if state == ChannelState::Closed {
            EventKind::ChannelClosed
        } else {
            EventKind::ChannelStateChanged
        };
        emit(
            &self.events,
            Event::new(kind)
                .with_channel(id)
                .with_data(serde_json::json!({ "from": previous, "to": state })),
        );
        Ok(channel)
    }

    /// Close a channel for good. Closing a closed channel is an error.
    pub fn close_channel(&self, id: &ChannelId) -> Result<Channel> {
        let current = self.get_channel(id)?;
        if current.state == ChannelState::Closed {
            return Err(ConclaveError::InvalidTransition {
                entity: "channel",
                from: current.state.to_string(),
                to: ChannelState::Closed.to_string(),
            });
        }
        self.update_channel_state(id, ChannelState::Closed)
    }

    // ── Messages ───────────────────────────────────────────────

    /// Validate, store and asynchronously dispatch a message.
    ///
    /// The sender must be an endpoint of an open channel and the target
    /// its peer. A rejected message is never stored.
    pub fn send_message(self: &Arc<Self>, request: OutgoingMessage) -> Result<Message> {
        let message = self.admit(Message::from_outgoing(request))?;
        self.dispatch(message.clone());
        Ok(message)
    }

    /// Send a message requiring a reply and wait up to `wait` for it.
    ///
    /// `wait` defaults to the configured reply timeout. If the target's
    /// handler fails, its error is returned instead.
    pub async fn send_and_wait(
        self: &Arc<Self>,
        request: OutgoingMessage,
        wait: Option<Duration>,
    ) -> Result<Message> {
        let wait = wait.unwrap_or_else(|| self.config.reply_timeout());
        let message = Message::from_outgoing(request.requiring_reply());
        let id = message.id.clone();

        // Park before dispatch so a fast reply cannot slip past.
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.clone(), tx);

        let message = match self.admit(message) {
            Ok(m) => m,
            Err(e) => {
                self.waiters.lock().remove(&id);
                return Err(e);
            }
        };
        self.dispatch(message);

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConclaveError::Cancelled),
            Err(_) => {
                self.waiters.lock().remove(&id);
                warn!(
                    message_id = %id,
                    wait_ms = wait.as_millis() as u64,
                    "No reply within wait window"
                );
                Err(ConclaveError::ReplyTimeout {
                    message_id: id.to_string(),
                    wait_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.messages
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("message", id))
    }

    /// Messages on a channel, in send order.
    pub fn get_messages_by_channel(&self, id: &ChannelId) -> Vec<Message> {
        let log = self.messages.read();
        log.by_channel
            .get(id)
            .map(|ids| ids.iter().filter_map(|m| log.by_id.get(m).cloned()).collect())
            .unwrap_or_default()
    }

    /// The reply to `id`, once one has been sent.
    pub fn find_reply(&self, id: &MessageId) -> Option<Message> {
        self.messages
            .read()
            .by_id
            .values()
            .find(|m| m.reply_to_id.as_ref() == Some(id))
            .cloned()
    }

    /// Drop processed messages handled at least `older_than` ago.
    ///
    /// Messages still awaited by `send_and_wait` are kept. Returns the
    /// number removed.
    pub fn prune_processed(&self, older_than: Duration) -> usize {
        let now = Utc::now();
        let awaited: Vec<MessageId> = self.waiters.lock().keys().cloned().collect();
        let mut log = self.messages.write();
        let expired: Vec<MessageId> = log
            .by_id
            .values()
            .filter(|m| !awaited.contains(&m.id))
            .filter(|m| {
                m.processed_at
                    .and_then(|at| (now - at).to_std().ok())
                    .map_or(false, |age| age >= older_than)
            })
            .map(|m| m.id.clone())
            .collect();
        for id in &expired {
            log.by_id.remove(id);
        }
        log.by_channel.retain(|_, ids| {
            ids.retain(|id| !expired.contains(id));
            !ids.is_empty()
        });
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Pruned processed messages");
        }
        expired.len()
    }

    /// Deliveries still in flight.
    pub fn pending_deliveries(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel in-flight deliveries and wait for them to finish.
    pub async fn shutdown(&self) {
        info!(in_flight = self.tracker.len(), "Communication manager shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.waiters.lock().clear();
    }

    /// Check authorization and channel state, then record the message.
    fn admit(&self, message: Message) -> Result<Message> {
        let channel = self.get_channel(&message.channel_id)?;
        if !channel.is_endpoint(&message.source) {
            return Err(ConclaveError::Precondition(format!(
                "agent {} is not an endpoint of channel {}",
                message.source, channel.id
            )));
        }
        if channel.peer_of(&message.source) != Some(&message.target) {
            return Err(ConclaveError::Precondition(format!(
                "agent {} is not the peer of {} on channel {}",
                message.target, message.source, channel.id
            )));
        }
        if channel.state != ChannelState::Open {
            return Err(ConclaveError::Precondition(format!(
                "channel {} is {}",
                channel.id, channel.state
            )));
        }

        {
            let mut log = self.messages.write();
            log.by_channel
                .entry(message.channel_id.clone())
                .or_default()
                .push(message.id.clone());
            log.by_id.insert(message.id.clone(), message.clone());
        }

        debug!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            message_type = %message.message_type,
            requires_reply = message.requires_reply,
            "Message sent"
        );
        emit(
            &self.events,
            Event::new(EventKind::MessageSent)
                .with_channel(&message.channel_id)
                .with_agent(&message.source)
                .with_data(serde_json::json!({
                    "message_id": message.id,
                    "target": message.target,
                    "message_type": message.message_type,
                    "requires_reply": message.requires_reply,
                    "reply_to_id": message.reply_to_id,
                })),
        );
        Ok(message)
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        let manager = self.clone();
        self.tracker.spawn(async move { manager.deliver(message).await });
    }

    async fn deliver(self: Arc<Self>, message: Message) {
        let outcome = self.invoke_target(&message).await;
        let error = outcome.as_ref().err().map(|e| e.to_string());
        self.mark_processed(&message.id, error.clone());

        match outcome {
            Ok(outputs) => {
                emit(
                    &self.events,
                    Event::new(EventKind::MessageProcessed)
                        .with_channel(&message.channel_id)
                        .with_agent(&message.target)
                        .with_data(serde_json::json!({ "message_id": message.id })),
                );
                if message.requires_reply {
                    self.reply(&message, outputs);
                }
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    target = %message.target,
                    error = %e,
                    "Message handling failed"
                );
                emit(
                    &self.events,
                    Event::new(EventKind::MessageFailed)
                        .with_channel(&message.channel_id)
                        .with_agent(&message.target)
                        .with_data(serde_json::json!({
                            "message_id": message.id,
                            "error": error,
                        })),
                );
                self.resolve_waiter(&message.id, Err(e));
            }
        }
    }

    async fn invoke_target(&self, message: &Message) -> Result<DataMap> {
        let agent = self
            .get_agent(&message.target)
            .ok_or_else(|| ConclaveError::not_found("agent", &message.target))?;

        agent.set_state(
            LAST_MESSAGE_KEY,
            serde_json::to_value(message).unwrap_or_default(),
        );

        let timeout = self.config.delivery_timeout();
        let cancel = self.shutdown.child_token();
        match tokio::time::timeout(timeout, agent.process(cancel, message.content.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ConclaveError::Timeout {
                target: format!("agent {}", agent.name()),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn mark_processed(&self, id: &MessageId, error: Option<String>) {
        if let Some(message) = self.messages.write().by_id.get_mut(id) {
            message.status = MessageStatus::Processed;
            message.error = error;
            message.processed_at = Some(Utc::now());
        }
    }

    fn reply(self: &Arc<Self>, original: &Message, outputs: DataMap) {
        match self.admit(Message::reply_to(original, outputs)) {
            Ok(reply) => {
                debug!(message_id = %reply.id, reply_to = %original.id, "Reply sent");
                emit(
                    &self.events,
                    Event::new(EventKind::ReplySent)
                        .with_channel(&reply.channel_id)
                        .with_agent(&reply.source)
                        .with_data(serde_json::json!({
                            "message_id": reply.id,
                            "reply_to_id": original.id,
                        })),
                );
                self.resolve_waiter(&original.id, Ok(reply.clone()));
                self.dispatch(reply);
            }
            Err(e) => {
                warn!(message_id = %original.id, error = %e, "Could not send reply");
                if let Some(message) = self.messages.write().by_id.get_mut(&original.id) {
                    message.error = Some(format!("reply not sent: {}", e));
                }
                self.resolve_waiter(&original.id, Err(e));
            }
        }
    }

    fn resolve_waiter(&self, id: &MessageId, outcome: Result<Message>) {
        if let Some(tx) = self.waiters.lock().remove(id) {
            // The waiter may have timed out already.
            let _ = tx.send(outcome);
        }
    }
}
