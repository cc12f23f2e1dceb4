use crate::models::PolicyView;
use regex::Regex;
use rusqlite::{Connection, params};
use serde::Deserialize;

/// Payload type the registry routes opaquely: policy evaluation never inspects
/// ciphertext.
pub const CIPHERTEXT_PAYLOAD_TYPE: &str = "application/mahilo+ciphertext";

pub const SCOPES: [&str; 4] = ["global", "user", "group", "role"];
pub const POLICY_TYPES: [&str; 2] = ["heuristic", "llm"];

/// Deterministic rule set for heuristic policies. The policy content is this
/// struct as a JSON object; every pattern must compile at create/update time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeuristicRules {
    #[serde(default)]
    pub max_length: Option<u64>,
    #[serde(default)]
    pub min_length: Option<u64>,
    #[serde(default)]
    pub blocked_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub required_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub require_context: Option<bool>,
    #[serde(default)]
    pub blocked_recipients: Option<Vec<String>>,
    #[serde(default)]
    pub trusted_recipients: Option<Vec<String>>,
}

/// The closed set of policy variants.
#[derive(Debug, Clone)]
pub enum PolicyKind {
    Heuristic(HeuristicRules),
    Llm(String),
}

/// Parse and validate policy content for the given type. Returns the typed
/// variant or a human-readable validation error.
pub fn parse_policy_content(policy_type: &str, content: &str) -> Result<PolicyKind, String> {
    match policy_type {
        "heuristic" => {
            let rules: HeuristicRules = serde_json::from_str(content)
                .map_err(|e| format!("Heuristic policy content must be a JSON object: {e}"))?;
            for pattern in rules
                .blocked_patterns
                .iter()
                .flatten()
                .chain(rules.required_patterns.iter().flatten())
            {
                Regex::new(pattern).map_err(|e| format!("Invalid regex '{pattern}': {e}"))?;
            }
            Ok(PolicyKind::Heuristic(rules))
        }
        "llm" => {
            let prompt = content.trim();
            if prompt.is_empty() {
                return Err("LLM policy content must be a non-empty prompt".to_string());
            }
            Ok(PolicyKind::Llm(prompt.to_string()))
        }
        other => Err(format!(
            "Unknown policy type '{other}'. Valid types: heuristic, llm"
        )),
    }
}

/// Everything a heuristic policy can see about the message under evaluation.
pub struct EvalInput<'a> {
    pub payload: &'a str,
    pub recipient_username: &'a str,
    pub has_context: bool,
}

/// First-FAIL-wins outcome of the evaluation funnel.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub policy_id: String,
    pub reason: String,
}

fn matches_any(needle: &str, list: &[String]) -> bool {
    list.iter().any(|n| n.eq_ignore_ascii_case(needle))
}

fn evaluate_heuristic(rules: &HeuristicRules, input: &EvalInput) -> Result<(), String> {
    let len = input.payload.len() as u64;
    if let Some(max) = rules.max_length
        && len > max
    {
        return Err(format!("payload length {len} exceeds maximum {max}"));
    }
    if let Some(min) = rules.min_length
        && len < min
    {
        return Err(format!("payload length {len} below minimum {min}"));
    }
    for pattern in rules.blocked_patterns.iter().flatten() {
        // Patterns were validated at create time; an uncompilable one here is
        // a recovered inconsistency, not a rejection.
        let Ok(re) = Regex::new(pattern) else {
            eprintln!("⚠️ Skipping uncompilable blocked pattern '{pattern}'");
            continue;
        };
        if re.is_match(input.payload) {
            return Err(format!("payload matches blocked pattern '{pattern}'"));
        }
    }
    for pattern in rules.required_patterns.iter().flatten() {
        let Ok(re) = Regex::new(pattern) else {
            eprintln!("⚠️ Skipping uncompilable required pattern '{pattern}'");
            continue;
        };
        if !re.is_match(input.payload) {
            return Err(format!("payload missing required pattern '{pattern}'"));
        }
    }
    if rules.require_context == Some(true) && !input.has_context {
        return Err("message context is required".to_string());
    }
    if let Some(blocked) = &rules.blocked_recipients
        && matches_any(input.recipient_username, blocked)
    {
        return Err(format!(
            "recipient '{}' is blocked",
            input.recipient_username
        ));
    }
    if let Some(trusted) = &rules.trusted_recipients
        && !trusted.is_empty()
        && !matches_any(input.recipient_username, trusted)
    {
        return Err(format!(
            "recipient '{}' is not in the trusted list",
            input.recipient_username
        ));
    }
    Ok(())
}

/// Evaluate policies in priority order. The first FAIL aborts; LLM policies
/// pass with a logged warning in the default build.
pub fn evaluate(policies: &[PolicyView], input: &EvalInput) -> Result<(), Rejection> {
    for policy in policies {
        match parse_policy_content(&policy.policy_type, &policy.policy_content) {
            Ok(PolicyKind::Heuristic(rules)) => {
                if let Err(reason) = evaluate_heuristic(&rules, input) {
                    return Err(Rejection {
                        policy_id: policy.id.clone(),
                        reason,
                    });
                }
            }
            Ok(PolicyKind::Llm(_)) => {
                eprintln!(
                    "⚠️ LLM policy {} skipped (no evaluator configured), passing",
                    policy.id
                );
            }
            Err(e) => {
                eprintln!("⚠️ Policy {} has invalid content ({e}), passing", policy.id);
            }
        }
    }
    Ok(())
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyView> {
    Ok(PolicyView {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scope: row.get(2)?,
        target_id: row.get(3)?,
        policy_type: row.get(4)?,
        policy_content: row.get(5)?,
        priority: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const POLICY_COLUMNS: &str = "id, user_id, scope, target_id, policy_type, policy_content, \
                              priority, enabled, created_at, updated_at";

/// Scope filter for a user-targeted send: the sender's enabled policies that
/// are global, target the recipient, or target a role the recipient holds.
/// One indexed query, priority DESC.
pub fn applicable_for_user_send(
    conn: &Connection,
    owner_id: &str,
    recipient_id: &str,
    recipient_roles: &[String],
) -> Vec<PolicyView> {
    let mut sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies
         WHERE user_id = ?1 AND enabled = 1
           AND (scope = 'global' OR (scope = 'user' AND target_id = ?2)"
    );
    let mut values: Vec<String> = vec![owner_id.to_string(), recipient_id.to_string()];
    if !recipient_roles.is_empty() {
        let placeholders: Vec<String> = (0..recipient_roles.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        sql.push_str(&format!(
            " OR (scope = 'role' AND target_id IN ({}))",
            placeholders.join(",")
        ));
        values.extend(recipient_roles.iter().cloned());
    }
    sql.push_str(") ORDER BY priority DESC, created_at ASC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let refs: Vec<&dyn rusqlite::types::ToSql> = values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    stmt.query_map(refs.as_slice(), |row| policy_from_row(row))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Scope filter for a group send: the sender's global policies plus policies
/// scoped to this group (any admin's — group policies are shared). Role
/// policies are not consulted for group sends.
pub fn applicable_for_group_send(
    conn: &Connection,
    sender_id: &str,
    group_id: &str,
) -> Vec<PolicyView> {
    let mut stmt = match conn.prepare(&format!(
        "SELECT {POLICY_COLUMNS} FROM policies
         WHERE enabled = 1
           AND ((user_id = ?1 AND scope = 'global')
             OR (scope = 'group' AND target_id = ?2))
         ORDER BY priority DESC, created_at ASC"
    )) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    stmt.query_map(params![sender_id, group_id], |row| policy_from_row(row))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Short natural-language digest of a policy list, used by the context API
/// and the history reply-policy enrichment.
pub fn summarize(policies: &[PolicyView]) -> String {
    if policies.is_empty() {
        return "No policies apply.".to_string();
    }
    let mut phrases: Vec<String> = Vec::new();
    for policy in policies {
        match parse_policy_content(&policy.policy_type, &policy.policy_content) {
            Ok(PolicyKind::Heuristic(rules)) => {
                if let Some(max) = rules.max_length {
                    phrases.push(format!("max length {max}"));
                }
                if let Some(min) = rules.min_length {
                    phrases.push(format!("min length {min}"));
                }
                if let Some(blocked) = &rules.blocked_patterns
                    && !blocked.is_empty()
                {
                    phrases.push(format!("{} blocked pattern(s)", blocked.len()));
                }
                if let Some(required) = &rules.required_patterns
                    && !required.is_empty()
                {
                    phrases.push(format!("{} required pattern(s)", required.len()));
                }
                if rules.require_context == Some(true) {
                    phrases.push("context required".to_string());
                }
                if rules.trusted_recipients.as_deref().is_some_and(|t| !t.is_empty()) {
                    phrases.push("trusted-recipient allowlist".to_string());
                }
            }
            Ok(PolicyKind::Llm(prompt)) => {
                let head: String = prompt.chars().take(60).collect();
                phrases.push(format!("LLM review: {head}"));
            }
            Err(_) => {}
        }
    }
    if phrases.is_empty() {
        format!("{} policy(ies) apply with no active constraints.", policies.len())
    } else {
        format!(
            "{} policy(ies) apply: {}.",
            policies.len(),
            phrases.join("; ")
        )
    }
}
