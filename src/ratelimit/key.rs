//! Rate keys and admission requests.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// The kind of identity a policy counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Ip,
    User,
    Endpoint,
    Resource,
}

impl Scope {
    /// Specificity rank used to break priority ties; narrower scopes rank higher.
    pub fn specificity(&self) -> u8 {
        match self {
            Scope::Ip => 0,
            Scope::User => 1,
            Scope::Endpoint => 2,
            Scope::Resource => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Endpoint => "endpoint",
            Scope::Resource => "resource",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that identifies one counted identity.
///
/// Keys are namespaced by scope, so a user called `10.0.0.1` never shares a
/// counter with the IP address `10.0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateKey {
    pub scope: Scope,
    pub value: String,
}

impl RateKey {
    pub fn new(scope: Scope, value: impl Into<String>) -> Self {
        Self {
            scope,
            value: value.into(),
        }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.value)
    }
}

/// Address of one counter state in a store: `(policy id, rate key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    pub policy_id: String,
    pub rate_key: RateKey,
}

impl StoreKey {
    pub fn new(policy_id: impl Into<String>, rate_key: RateKey) -> Self {
        Self {
            policy_id: policy_id.into(),
            rate_key,
        }
    }

    /// Flat string form, suitable as a key in external stores.
    /// Format: "{policy_id}|{scope}:{value}"
    pub fn to_string_key(&self) -> String {
        format!("{}|{}", self.policy_id, self.rate_key)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_key())
    }
}

/// Who is making a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
}

/// One inbound request to be admitted or rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

impl AdmissionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.identity.user_id = Some(user_id.into());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.identity.ip = Some(ip);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// The request's value for a scope, if the request carries one.
    pub fn value_for(&self, scope: Scope) -> Option<String> {
        match scope {
            Scope::Ip => self.identity.ip.map(|ip| ip.to_string()),
            Scope::User => self.identity.user_id.clone(),
            Scope::Endpoint => self.endpoint.clone(),
            Scope::Resource => self.resource.clone(),
        }
    }

    /// The rate key this request counts against under a given scope.
    pub fn rate_key(&self, scope: Scope) -> Option<RateKey> {
        self.value_for(scope).map(|value| RateKey::new(scope, value))
    }
}
