//! Workspace identity helpers.

use sha2::{Digest, Sha256};

/// Prefix shared by every container the pool creates.
pub const CONTAINER_PREFIX: &str = "proginator-jdtls-";

/// Root of the per-workspace data directories inside a container.
pub const WORKSPACE_ROOT: &str = "/tmp/workspaces";

/// Build the workspace key `{principal}:{session-or-connection-id}`.
///
/// A blank principal becomes `anonymous`; a blank session id falls back to
/// the connection id, which makes the workspace single-connection.
pub fn workspace_key(principal: Option<&str>, session_id: Option<&str>, connection_id: &str) -> String {
    let principal = non_blank(principal).unwrap_or("anonymous");
    match non_blank(session_id) {
        Some(session_id) => format!("{}:{}", principal, session_id),
        None => format!("{}:{}", principal, connection_id),
    }
}

/// Replace everything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_for_path(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory inside the container that holds the workspace's data.
pub fn workspace_dir(workspace_key: &str) -> String {
    format!("{}/{}", WORKSPACE_ROOT, sanitize_for_path(workspace_key))
}

/// URI of the project folder the editor should open for this workspace.
pub fn workspace_uri(workspace_key: &str) -> String {
    format!("file://{}/project", workspace_dir(workspace_key))
}

/// Deterministic container name for a workspace key.
///
/// Uses 128 bits of SHA-256 so distinct keys never share a name in practice,
/// while repeated acquisitions of the same key still find orphans left over
/// from a previous gateway process.
pub fn container_name(workspace_key: &str) -> String {
    let digest = Sha256::digest(workspace_key.as_bytes());
    format!("{}{}", CONTAINER_PREFIX, hex::encode(&digest[..16]))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
