//! In-process realtime event bus.
//!
//! Generalizes the teacher's `EventBus { sender: broadcast::Sender<ChatEvent> }`
//! (one global room-agnostic channel, filtered by `room_id` at the consumer)
//! to the same shape: one broadcast channel shared across workspaces, with
//! every event carrying its own `workspace_id` so subscribers filter the way
//! the teacher's SSE route filters by `room_id`.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    MessageReceived {
        workspace_id: String,
        message_id: String,
        conversation_id: String,
        contact_id: String,
    },
    MessageStatus {
        workspace_id: String,
        message_id: String,
        status: String,
    },
    ConversationNew {
        workspace_id: String,
        conversation_id: String,
        contact_id: String,
    },
    TemplateStatus {
        workspace_id: String,
        template_id: String,
        status: String,
    },
}

impl GatewayEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            GatewayEvent::MessageReceived { workspace_id, .. } => workspace_id,
            GatewayEvent::MessageStatus { workspace_id, .. } => workspace_id,
            GatewayEvent::ConversationNew { workspace_id, .. } => workspace_id,
            GatewayEvent::TemplateStatus { workspace_id, .. } => workspace_id,
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: GatewayEvent) {
        // No subscribers is not an error; it just means nobody's watching.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
