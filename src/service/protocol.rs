//! Wire format of the JSON-lines surface.

use serde::{Deserialize, Serialize};

use crate::ratelimit::{
    AdmissionRequest, LimitsView, MetricsSnapshot, StatusView, Timestamp, UsageView, Verdict,
};

/// One request line, tagged by `op`.
///
/// ```json
/// {"op":"check","request":{"user_id":"alice","endpoint":"/orders"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Admit or deny a request
    Check {
        request: AdmissionRequest,
        /// Check time, defaults to now
        #[serde(default)]
        at: Option<Timestamp>,
    },
    /// Policy, usage and counter state for a request's key
    Status {
        request: AdmissionRequest,
        #[serde(default)]
        at: Option<Timestamp>,
    },
    /// Current consumption for a request's key
    Usage {
        request: AdmissionRequest,
        #[serde(default)]
        at: Option<Timestamp>,
    },
    /// The policy that would govern a request
    Limits {
        request: AdmissionRequest,
        #[serde(default)]
        at: Option<Timestamp>,
    },
    Metrics,
    /// Report a load factor for adaptive policies
    Load { load: f64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Check { .. } => "check",
            Command::Status { .. } => "status",
            Command::Usage { .. } => "usage",
            Command::Limits { .. } => "limits",
            Command::Metrics => "metrics",
            Command::Load { .. } => "load",
        }
    }
}

/// One reply line. Read-only projections are `null` when no policy applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Verdict(Verdict),
    Status(Option<StatusView>),
    Usage(Option<UsageView>),
    Limits(Option<LimitsView>),
    Metrics(MetricsSnapshot),
    Load { load_factor: f64 },
    Error { message: String },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }
}
