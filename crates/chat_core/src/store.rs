use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{ConversationId, CorrelationId, MessageId, UserId},
    protocol::MessagePayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

/// One entry of the conversation log. `id` is `None` until the server has
/// assigned one to a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    fn from_payload(payload: MessagePayload) -> Self {
        Self {
            id: Some(payload.id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_display_name: payload.sender_display_name,
            body: payload.body,
            created_at: payload.created_at,
            delivery_state: DeliveryState::Acknowledged,
            correlation_id: payload.correlation_id,
        }
    }

    fn order_key(&self) -> (DateTime<Utc>, Option<MessageId>) {
        (self.created_at, self.id)
    }

    fn is_awaiting_echo(&self) -> bool {
        matches!(
            self.delivery_state,
            DeliveryState::Pending | DeliveryState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The id was already present and nothing changed.
    Duplicate,
    /// The id was already present; a `Sent` entry became `Acknowledged`.
    Upgraded,
    /// A local pending entry was replaced by its server echo.
    Reconciled,
    Inserted,
    /// The payload belongs to a different conversation.
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Upgraded | Self::Reconciled | Self::Inserted)
    }
}

/// Ordered, deduplicated message log for one conversation.
#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    local_user: UserId,
    entries: Vec<Message>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation_id,
            local_user,
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        self.entries
            .iter()
            .find(|entry| entry.correlation_id.as_ref() == Some(correlation_id))
    }

    /// Merges a server-originated message from any source (history, channel
    /// push, fallback response).
    pub fn merge(&mut self, payload: MessagePayload) -> MergeOutcome {
        if payload.conversation_id != self.conversation_id {
            return MergeOutcome::Ignored;
        }

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == Some(payload.id))
        {
            if existing.delivery_state == DeliveryState::Sent {
                existing.delivery_state = DeliveryState::Acknowledged;
                return MergeOutcome::Upgraded;
            }
            return MergeOutcome::Duplicate;
        }

        if let Some(index) = self.echo_target(&payload) {
            let correlation_id = self.entries[index].correlation_id.clone();
            let mut replacement = Message::from_payload(payload);
            replacement.correlation_id = correlation_id;
            self.entries[index] = replacement;
            self.restore_order();
            return MergeOutcome::Reconciled;
        }

        self.entries.push(Message::from_payload(payload));
        self.restore_order();
        MergeOutcome::Inserted
    }

    pub fn merge_all(&mut self, payloads: impl IntoIterator<Item = MessagePayload>) -> usize {
        payloads
            .into_iter()
            .map(|payload| self.merge(payload))
            .filter(|outcome| outcome.changed())
            .count()
    }

    fn echo_target(&self, payload: &MessagePayload) -> Option<usize> {
        match &payload.correlation_id {
            Some(correlation_id) => self.entries.iter().position(|entry| {
                entry.is_awaiting_echo() && entry.correlation_id.as_ref() == Some(correlation_id)
            }),
            // Servers that drop the correlation id still echo our own sends;
            // the oldest pending entry with the same body is the match.
            None if payload.sender_id == self.local_user => self.entries.iter().position(|entry| {
                entry.delivery_state == DeliveryState::Pending
                    && entry.id.is_none()
                    && entry.body == payload.body
            }),
            None => None,
        }
    }

    /// Inserts an optimistic local entry and returns its correlation id.
    pub fn push_pending(
        &mut self,
        sender_display_name: &str,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> CorrelationId {
        let correlation_id = CorrelationId::generate();
        self.entries.push(Message {
            id: None,
            conversation_id: self.conversation_id,
            sender_id: self.local_user,
            sender_display_name: sender_display_name.to_string(),
            body: body.to_string(),
            created_at,
            delivery_state: DeliveryState::Pending,
            correlation_id: Some(correlation_id.clone()),
        });
        self.restore_order();
        correlation_id
    }

    /// Applies a successful fallback response for a local send.
    pub fn confirm_sent(
        &mut self,
        correlation_id: &CorrelationId,
        payload: MessagePayload,
    ) -> MergeOutcome {
        if payload.conversation_id != self.conversation_id {
            return MergeOutcome::Ignored;
        }

        let local = self.entries.iter().position(|entry| {
            entry.correlation_id.as_ref() == Some(correlation_id) && entry.is_awaiting_echo()
        });
        let echoed = self
            .entries
            .iter()
            .position(|entry| entry.id == Some(payload.id));

        match (local, echoed) {
            // The echo beat the response and was stored as a separate entry.
            (Some(index), Some(_)) => {
                self.entries.remove(index);
                MergeOutcome::Reconciled
            }
            (None, Some(_)) => MergeOutcome::Duplicate,
            (Some(index), None) => {
                let entry = &mut self.entries[index];
                entry.id = Some(payload.id);
                entry.created_at = payload.created_at;
                entry.sender_display_name = payload.sender_display_name;
                entry.delivery_state = DeliveryState::Sent;
                self.restore_order();
                MergeOutcome::Reconciled
            }
            (None, None) => {
                let mut entry = Message::from_payload(payload);
                entry.correlation_id = Some(correlation_id.clone());
                entry.delivery_state = DeliveryState::Sent;
                self.entries.push(entry);
                self.restore_order();
                MergeOutcome::Inserted
            }
        }
    }

    pub fn mark_failed(&mut self, correlation_id: &CorrelationId) -> bool {
        self.set_local_state(correlation_id, DeliveryState::Pending, DeliveryState::Failed)
    }

    /// Moves a failed entry back to pending and returns its body for re-delivery.
    pub fn mark_retrying(&mut self, correlation_id: &CorrelationId) -> Option<String> {
        self.set_local_state(correlation_id, DeliveryState::Failed, DeliveryState::Pending)
            .then(|| self.get(correlation_id).map(|entry| entry.body.clone()))
            .flatten()
    }

    fn set_local_state(
        &mut self,
        correlation_id: &CorrelationId,
        from: DeliveryState,
        to: DeliveryState,
    ) -> bool {
        match self.entries.iter_mut().find(|entry| {
            entry.correlation_id.as_ref() == Some(correlation_id)
                && entry.id.is_none()
                && entry.delivery_state == from
        }) {
            Some(entry) => {
                entry.delivery_state = to;
                true
            }
            None => false,
        }
    }

    // Stable, so replaced entries keep their slot unless timestamps disagree.
    fn restore_order(&mut self) {
        self.entries.sort_by_key(Message::order_key);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
