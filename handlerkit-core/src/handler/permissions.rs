//! Permission records and the guard that checks them
//!
//! A missing flag or allow-list means "not restricted". An explicit `false`
//! flag denies the capability outright; an allow-list narrows a capability
//! that is otherwise granted. The guard functions are pure so backends can
//! call them before touching the filesystem or network.

use super::result::HandlerError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Filesystem and network permissions for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Filesystem capability flag (`None` = not restricted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_file_system: Option<bool>,

    /// Network capability flag (`None` = not restricted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_network: Option<bool>,

    /// Paths (and everything below them) that may be touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<PathBuf>>,

    /// Domains that may be contacted; `*.example.com` matches subdomains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
}

impl Permissions {
    /// Permissions with no restrictions at all
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Permissions denying both filesystem and network access
    pub fn deny_all() -> Self {
        Self {
            allow_file_system: Some(false),
            allow_network: Some(false),
            allowed_paths: None,
            allowed_domains: None,
        }
    }

    /// Set the filesystem flag
    pub fn with_file_system(mut self, allow: bool) -> Self {
        self.allow_file_system = Some(allow);
        self
    }

    /// Set the network flag
    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = Some(allow);
        self
    }

    /// Add a path to the filesystem allow-list
    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths
            .get_or_insert_with(Vec::new)
            .push(path.into());
        self
    }

    /// Add a domain to the network allow-list
    pub fn allow_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains
            .get_or_insert_with(Vec::new)
            .push(domain.into());
        self
    }
}

/// Outcome of a guard check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The operation may proceed
    Allow,
    /// The operation must not be attempted
    Deny(String),
}

impl AccessDecision {
    /// Check if access is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }

    /// Convert a deny into a `PermissionDenied` error
    pub fn into_result(self) -> Result<(), HandlerError> {
        match self {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny(reason) => Err(HandlerError::permission_denied(reason)),
        }
    }
}

/// Check whether `path` may be accessed under `permissions`
pub fn check_file_access(path: &Path, permissions: &Permissions) -> AccessDecision {
    if permissions.allow_file_system == Some(false) {
        return AccessDecision::Deny(format!(
            "Filesystem access is disabled (requested '{}')",
            path.display()
        ));
    }

    if let Some(ref allowed) = permissions.allowed_paths {
        let target = normalize_path(path);
        let permitted = allowed
            .iter()
            .any(|root| target.starts_with(normalize_path(root)));
        if !permitted {
            return AccessDecision::Deny(format!(
                "Path '{}' is outside the allowed paths",
                path.display()
            ));
        }
    }

    AccessDecision::Allow
}

/// Like [`check_file_access`], but also follows symlinks
///
/// The lexical check runs first. When an allow-list is present, the target
/// and every allowed root are then resolved on disk, and the resolved target
/// must sit under a resolved root. Reads the filesystem metadata, so call it
/// right before the operation it guards.
pub fn check_resolved_file_access(path: &Path, permissions: &Permissions) -> AccessDecision {
    let lexical = check_file_access(path, permissions);
    if !lexical.is_allowed() {
        return lexical;
    }

    let Some(ref allowed) = permissions.allowed_paths else {
        return AccessDecision::Allow;
    };

    let target = resolve_path(path);
    if allowed.iter().any(|root| target.starts_with(resolve_path(root))) {
        AccessDecision::Allow
    } else {
        AccessDecision::Deny(format!(
            "Path '{}' resolves to '{}', outside the allowed paths",
            path.display(),
            target.display()
        ))
    }
}

/// Resolve symlinks in `path`
///
/// Trailing components that do not exist yet are appended to the resolved
/// parent. Falls back to the lexical form when no ancestor exists.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let normalized = normalize_path(path);
    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    loop {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |resolved, name| resolved.join(name));
        }
    }
}

/// Check whether `domain` may be contacted under `permissions`
pub fn check_network_access(domain: &str, permissions: &Permissions) -> AccessDecision {
    if permissions.allow_network == Some(false) {
        return AccessDecision::Deny(format!(
            "Network access is disabled (requested '{}')",
            domain
        ));
    }

    if let Some(ref allowed) = permissions.allowed_domains {
        let target = normalize_domain(domain);
        if !allowed.iter().any(|entry| domain_matches(&target, entry)) {
            return AccessDecision::Deny(format!(
                "Domain '{}' is not in the allowed domains",
                domain
            ));
        }
    }

    AccessDecision::Allow
}

/// Lexically normalize a path: drop `.` and fold `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn domain_matches(target: &str, entry: &str) -> bool {
    let entry = normalize_domain(entry);
    match entry.strip_prefix("*.") {
        Some(suffix) => target
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.')),
        None => target == entry,
    }
}
