use serde::Serialize;
use tokio::sync::broadcast;

/// Events emitted to observers of a user. Emission is best-effort and never
/// blocks or rolls back the underlying state change; a future WebSocket layer
/// subscribes here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    MessageReceived {
        recipient_user_id: String,
        message_id: String,
        sender_user_id: String,
        recipient_connection_id: Option<String>,
    },
    DeliveryStatus {
        sender_user_id: String,
        message_id: String,
        delivery_id: Option<String>,
        status: String,
    },
    FriendRequest {
        addressee_user_id: String,
        friendship_id: String,
        requester: String,
    },
    GroupInvite {
        invitee_user_id: String,
        group_id: String,
        group_name: String,
        invited_by: String,
    },
}

pub struct EventBus {
    pub sender: broadcast::Sender<RegistryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: RegistryEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

/// Publish through a bare sender handle (background tasks hold a clone of the
/// sender rather than the bus).
pub fn publish_via(sender: &broadcast::Sender<RegistryEvent>, event: RegistryEvent) {
    let _ = sender.send(event);
}
