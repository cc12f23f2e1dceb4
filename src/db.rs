use rusqlite::{Connection, params};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared database handle. Cloneable so background tasks (delivery retry
/// processor) can hold the same connection as the request handlers.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

/// Roles seeded at boot. These exist for every user and cannot be shadowed.
pub const SYSTEM_ROLES: [(&str, &str); 5] = [
    ("close_friends", "Inner circle contacts"),
    ("friends", "General friends"),
    ("acquaintances", "People you know casually"),
    ("work_contacts", "Professional contacts"),
    ("family", "Family members"),
];

/// Generate a per-connection callback secret: `whsec_<32 hex chars>`
pub fn generate_callback_secret() -> String {
    format!("whsec_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Generate a Twitter verification code: `mahilo-verify-<8 hex chars>`
pub fn generate_verification_code() -> String {
    let hex = format!("{:032x}", uuid::Uuid::new_v4().as_u128());
    format!("mahilo-verify-{}", &hex[..8])
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate();
        db
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                display_name TEXT,
                api_key_hash TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                twitter_handle TEXT,
                twitter_verified INTEGER NOT NULL DEFAULT 0,
                verification_code TEXT,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_api_key_id ON users(api_key_id);

            CREATE TABLE IF NOT EXISTS agent_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                framework TEXT NOT NULL,
                label TEXT NOT NULL,
                description TEXT,
                capabilities TEXT NOT NULL DEFAULT '[]',
                public_key TEXT NOT NULL,
                public_key_alg TEXT NOT NULL,
                routing_priority INTEGER NOT NULL DEFAULT 0,
                callback_url TEXT NOT NULL,
                callback_secret TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_seen TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, framework, label)
            );
            CREATE INDEX IF NOT EXISTS idx_connections_user ON agent_connections(user_id, status);

            CREATE TABLE IF NOT EXISTS friendships (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                addressee_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                UNIQUE(requester_id, addressee_id)
            );
            CREATE INDEX IF NOT EXISTS idx_friendships_addressee ON friendships(addressee_id, status);

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                description TEXT,
                owner_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                invite_only INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_memberships (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role TEXT NOT NULL DEFAULT 'member',
                status TEXT NOT NULL DEFAULT 'active',
                invited_by_user_id TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_user ON group_memberships(user_id, status);

            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
                description TEXT,
                is_system INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(name, user_id)
            );

            CREATE TABLE IF NOT EXISTS friend_roles (
                friendship_id TEXT NOT NULL REFERENCES friendships(id) ON DELETE CASCADE,
                role_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (friendship_id, role_name)
            );

            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                target_id TEXT,
                policy_type TEXT NOT NULL,
                policy_content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policies_owner ON policies(user_id, enabled, scope);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                correlation_id TEXT,
                sender_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                sender_agent TEXT,
                recipient_type TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                recipient_connection_id TEXT,
                payload TEXT NOT NULL,
                payload_type TEXT NOT NULL DEFAULT 'text/plain',
                encryption TEXT,
                sender_signature TEXT,
                context TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                rejection_reason TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                idempotency_key TEXT,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                UNIQUE(sender_user_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_type, recipient_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_retry ON messages(status, next_retry_at);

            CREATE TABLE IF NOT EXISTS message_deliveries (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                recipient_user_id TEXT NOT NULL,
                recipient_connection_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                error_message TEXT,
                delivered_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(message_id, recipient_connection_id)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_message ON message_deliveries(message_id);
            CREATE INDEX IF NOT EXISTS idx_deliveries_retry ON message_deliveries(status, next_retry_at);

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                message_notifications INTEGER NOT NULL DEFAULT 1,
                delivery_notifications INTEGER NOT NULL DEFAULT 1,
                friend_notifications INTEGER NOT NULL DEFAULT 1,
                group_notifications INTEGER NOT NULL DEFAULT 1,
                default_llm TEXT,
                settings TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );",
        )
        .expect("Failed to run migrations");

        // Seed system roles (idempotent — UNIQUE(name, user_id) treats NULLs as
        // distinct, so guard with an existence check instead)
        let now = chrono::Utc::now().to_rfc3339();
        for (name, description) in SYSTEM_ROLES {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM roles WHERE name = ?1 AND user_id IS NULL",
                    params![name],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            if exists == 0 {
                conn.execute(
                    "INSERT INTO roles (id, name, user_id, description, is_system, created_at) VALUES (?1, ?2, NULL, ?3, 1, ?4)",
                    params![uuid::Uuid::new_v4().to_string(), name, description, &now],
                )
                .ok();
            }
        }
    }
}

/// Check whether a rusqlite error is a UNIQUE constraint violation. Unique
/// constraints are the authoritative locks against racing duplicates; callers
/// treat this as the "already exists" branch, never as an internal error.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
