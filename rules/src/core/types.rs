//! Shared deterministic types for the rule pipeline.
//!
//! These types define the contract between the locator, the registry, the
//! runner and the caller of the runner. They carry no interpreter state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open-ended JSON object used for claims and extension fields.
pub type Claims = Map<String, Value>;

/// A rule script as read from disk. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    /// Path relative to the rules directory, `/`-separated.
    pub identifier: String,
    pub source_text: String,
}

impl RuleSource {
    pub fn new(identifier: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            source_text: source_text.into(),
        }
    }
}

/// The subject threaded through every rule of an invocation.
///
/// Field names follow the OIDC standard claims so that rule code reads the
/// same as it would against a real identity provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoneinfo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub app_metadata: Claims,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_metadata: Claims,
    /// Any attribute not covered above.
    #[serde(flatten)]
    pub extra: Claims,
}

/// Where a rule asked the flow to go instead of completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub url: String,
}

/// Authentication/authorization context accumulated along the rule chain.
///
/// `A` accumulates access-token claims, `I` holds the intermediate id-token
/// claims. Both default to a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext<A = Claims, I = Claims> {
    #[serde(rename = "clientID", default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Space-separated requested scopes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub access_token: A,
    #[serde(default)]
    pub id_token: I,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
    #[serde(flatten)]
    pub extra: Claims,
}

impl<A: Default, I: Default> RuleContext<A, I> {
    /// Context for a client requesting `scope`, everything else defaulted.
    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }
}

/// Signal raised by a rule that ends the chain early.
///
/// The runner only records it; acting on it is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSignal {
    /// The rule called back with an error.
    Denied { rule: String, message: String },
    /// The rule set `context.redirect` and called back.
    Redirect { rule: String, url: String },
}

impl RuleSignal {
    pub fn rule(&self) -> &str {
        match self {
            Self::Denied { rule, .. } | Self::Redirect { rule, .. } => rule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The rule raised an error while loading, running, or in a timer.
    Threw,
    /// The rule returned without calling back and left nothing scheduled.
    Stalled,
    /// The rule did not call back within its time budget.
    TimedOut,
}

/// A contained rule failure. Never part of the resolved user/context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDiagnostic {
    pub rule: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// What the runner does when a rule fails at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Record a diagnostic and move on to the next rule.
    #[default]
    Continue,
    /// Fail the whole invocation.
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_uses_identity_provider_field_names() {
        let context: RuleContext = serde_json::from_value(json!({
            "clientID": "client-1",
            "scope": "openid profile",
            "accessToken": { "scope": "read:users" },
            "custom": true
        }))
        .expect("deserialize");

        assert_eq!(context.client_id, "client-1");
        assert_eq!(context.scope, "openid profile");
        assert_eq!(context.access_token["scope"], json!("read:users"));
        assert_eq!(context.extra["custom"], json!(true));
        assert!(context.id_token.is_empty());
    }

    #[test]
    fn user_omits_absent_claims() {
        let user = RuleUser {
            name: Some("x".to_string()),
            ..RuleUser::default()
        };
        let value = serde_json::to_value(&user).expect("serialize");
        assert_eq!(value, json!({ "name": "x" }));
    }

    #[test]
    fn user_keeps_unknown_attributes() {
        let user: RuleUser = serde_json::from_value(json!({
            "email": "a@example.com",
            "tenant": "acme"
        }))
        .expect("deserialize");
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert_eq!(user.extra["tenant"], json!("acme"));
    }

    #[test]
    fn signal_serializes_with_kind_tag() {
        let signal = RuleSignal::Redirect {
            rule: "mfa.lua".to_string(),
            url: "https://example.com/mfa".to_string(),
        };
        let value = serde_json::to_value(&signal).expect("serialize");
        assert_eq!(value["kind"], json!("redirect"));
        assert_eq!(signal.rule(), "mfa.lua");
    }

    #[test]
    fn error_policy_defaults_to_continue() {
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Continue);
    }
}
