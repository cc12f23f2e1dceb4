use serde::{Deserialize, Serialize};

// --- Users & auth ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitter_handle: Option<String>,
    pub verified: bool,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUser {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyUser {
    pub twitter_handle: String,
    #[serde(default)]
    pub tweet_url: Option<String>,
}

// --- Agent connections ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnection {
    pub id: String,
    pub user_id: String,
    pub framework: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub public_key: String,
    pub public_key_alg: String,
    pub routing_priority: i64,
    pub callback_url: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgent {
    pub framework: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub routing_priority: Option<i64>,
    pub callback_url: String,
    #[serde(default)]
    pub callback_secret: Option<String>,
    pub public_key: String,
    pub public_key_alg: String,
    #[serde(default)]
    pub rotate_secret: Option<bool>,
}

/// A friend's connection as seen by a prospective sender. Callback URL and
/// secret stay private to the owner.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContactConnection {
    pub id: String,
    pub framework: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub routing_priority: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

// --- Friendships & roles ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipView {
    pub friendship_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: String,
    /// Which side of the row the caller is on: "requester" or "addressee".
    pub direction: String,
    pub roles: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct FriendRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRole {
    pub role: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_system: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateRole {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// --- Groups ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner_user_id: String,
    pub invite_only: bool,
    pub member_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_status: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub invite_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct InviteToGroup {
    pub username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferGroup {
    pub new_owner_user_id: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberView {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invited_by_user_id: Option<String>,
    pub joined_at: String,
}

// --- Policies ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub id: String,
    pub user_id: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub policy_type: String,
    pub policy_content: String,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePolicy {
    pub scope: String,
    #[serde(default)]
    pub target_id: Option<String>,
    pub policy_type: String,
    pub policy_content: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    #[serde(default)]
    pub policy_content: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

// --- Messages ---

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHints {
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    pub alg: String,
    pub key_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SenderSignature {
    pub alg: String,
    pub key_id: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub recipient: String,
    #[serde(default)]
    pub recipient_type: Option<String>,
    #[serde(default)]
    pub recipient_connection_id: Option<String>,
    #[serde(default)]
    pub routing_hints: Option<RoutingHints>,
    pub message: String,
    #[serde(default)]
    pub sender_agent: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionInfo>,
    #[serde(default)]
    pub sender_signature: Option<SenderSignature>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub message_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_connection_id: Option<String>,
}

/// One message as returned by the history endpoint. Received messages carry
/// `reply_policies` so an agent can preview reply constraints without a
/// second round-trip.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub direction: String,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_agent: Option<String>,
    pub recipient_type: String,
    pub recipient: String,
    pub message: String,
    pub payload_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_policies: Option<ReplyPolicies>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPolicies {
    /// Roles the caller has assigned to this sender.
    pub sender_roles: Vec<String>,
    /// The caller's own policies that would gate a reply, in priority order.
    pub policies: Vec<PolicyView>,
    pub summary: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
    pub count: usize,
}

// --- Context API ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecipient {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub relationship: String,
    pub friendship_id: String,
    pub roles: Vec<String>,
    pub connected_since: String,
    pub interaction_count: i64,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RecentInteraction {
    pub message_id: String,
    pub direction: String,
    pub preview: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub recipient: ContextRecipient,
    pub applicable_policies: Vec<PolicyView>,
    pub summary: String,
    pub recent_interactions: Vec<RecentInteraction>,
}

// --- Preferences ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub message_notifications: bool,
    pub delivery_notifications: bool,
    pub friend_notifications: bool,
    pub group_notifications: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_llm: Option<String>,
    pub settings: serde_json::Value,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferences {
    #[serde(default)]
    pub message_notifications: Option<bool>,
    #[serde(default)]
    pub delivery_notifications: Option<bool>,
    #[serde(default)]
    pub friend_notifications: Option<bool>,
    #[serde(default)]
    pub group_notifications: Option<bool>,
    #[serde(default)]
    pub default_llm: Option<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}
