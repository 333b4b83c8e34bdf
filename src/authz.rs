//! Authorization Policy (§4.A): decides whether an inbound message from a
//! given client pubkey is allowed through, independent of transport or
//! payments concerns.

use crate::jsonrpc::{capability_identifier, JsonRpcMessage};
use std::collections::HashSet;

/// A `(method, name?)` pair exempted from the allow-list even when the
/// caller isn't on it. `name: None` matches any name for that method.
#[derive(Debug, Clone)]
pub struct Exclusion {
    pub method: String,
    pub name: Option<String>,
}

impl Exclusion {
    pub fn new(method: impl Into<String>, name: Option<String>) -> Self {
        Self {
            method: method.into(),
            name,
        }
    }

    fn matches(&self, method: &str, identifier: Option<&str>) -> bool {
        if self.method != method {
            return false;
        }
        match (&self.name, identifier) {
            (None, _) => true,
            (Some(n), Some(id)) => id.ends_with(n.as_str()),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDecision {
    Allow,
    DenySilently,
    DenyWithUnauthorized,
}

pub struct AuthorizationPolicy {
    allowed_pubkeys: Option<HashSet<String>>,
    exclusions: Vec<Exclusion>,
    is_public_server: bool,
}

impl AuthorizationPolicy {
    pub fn new(allowed_pubkeys: Option<HashSet<String>>, exclusions: Vec<Exclusion>, is_public_server: bool) -> Self {
        Self {
            allowed_pubkeys,
            exclusions,
            is_public_server,
        }
    }

    pub fn decide(&self, client_pubkey: &str, message: &JsonRpcMessage) -> AuthzDecision {
        let method = message.method();
        if matches!(method, Some("initialize") | Some("notifications/initialized")) {
            return AuthzDecision::Allow;
        }

        let Some(allowed) = &self.allowed_pubkeys else {
            return AuthzDecision::Allow;
        };
        if allowed.contains(client_pubkey) {
            return AuthzDecision::Allow;
        }

        if let Some(method) = method {
            let identifier = capability_identifier(method, message.params());
            if self
                .exclusions
                .iter()
                .any(|e| e.matches(method, identifier.as_deref()))
            {
                return AuthzDecision::Allow;
            }
        }

        if message.is_request() && self.is_public_server {
            AuthzDecision::DenyWithUnauthorized
        } else {
            AuthzDecision::DenySilently
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(method: &str, params: Option<serde_json::Value>) -> JsonRpcMessage {
        let mut v = json!({"jsonrpc": "2.0", "id": 1, "method": method});
        if let Some(p) = params {
            v["params"] = p;
        }
        JsonRpcMessage::parse(&v.to_string()).unwrap()
    }

    #[test]
    fn no_allow_list_permits_everything() {
        let policy = AuthorizationPolicy::new(None, vec![], true);
        assert_eq!(policy.decide("anyone", &request("tools/call", None)), AuthzDecision::Allow);
    }

    #[test]
    fn handshake_methods_always_allowed() {
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let policy = AuthorizationPolicy::new(Some(allowed), vec![], true);
        assert_eq!(policy.decide("stranger", &request("initialize", None)), AuthzDecision::Allow);
    }

    #[test]
    fn allow_listed_pubkey_passes() {
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let policy = AuthorizationPolicy::new(Some(allowed), vec![], true);
        assert_eq!(policy.decide("friend", &request("tools/call", None)), AuthzDecision::Allow);
    }

    #[test]
    fn exclusion_permits_named_capability_for_anyone() {
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let policy = AuthorizationPolicy::new(
            Some(allowed),
            vec![Exclusion::new("tools/call", Some("free_tool".into()))],
            true,
        );
        let decision = policy.decide(
            "stranger",
            &request("tools/call", Some(json!({"name": "free_tool"}))),
        );
        assert_eq!(decision, AuthzDecision::Allow);
    }

    #[test]
    fn public_server_request_denial_asks_for_unauthorized_error() {
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let policy = AuthorizationPolicy::new(Some(allowed), vec![], true);
        assert_eq!(
            policy.decide("stranger", &request("tools/call", None)),
            AuthzDecision::DenyWithUnauthorized
        );
    }

    #[test]
    fn private_server_denial_is_silent() {
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let policy = AuthorizationPolicy::new(Some(allowed), vec![], false);
        assert_eq!(
            policy.decide("stranger", &request("tools/call", None)),
            AuthzDecision::DenySilently
        );
    }
}
