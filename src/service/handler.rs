//! Command dispatch onto the decision coordinator.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::protocol::{Command, Reply};
use crate::ratelimit::{CounterStore, DecisionCoordinator, LoadFeedback, LoadSignal};

/// Serves [`Command`]s against one coordinator.
pub struct WardenService<S: CounterStore> {
    coordinator: Arc<DecisionCoordinator<S>>,
    /// Target of `load` reports, if pushed load is enabled
    feedback: Option<Arc<LoadFeedback>>,
}

impl<S: CounterStore> WardenService<S> {
    pub fn new(coordinator: Arc<DecisionCoordinator<S>>) -> Self {
        Self {
            coordinator,
            feedback: None,
        }
    }

    /// Accept `load` commands and push them into `feedback`.
    pub fn with_load_feedback(mut self, feedback: Arc<LoadFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn coordinator(&self) -> &Arc<DecisionCoordinator<S>> {
        &self.coordinator
    }

    /// Parse and handle one input line.
    pub async fn handle_line(&self, line: &str) -> Reply {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!(error = %e, "Received malformed command");
                Reply::error(format!("malformed command: {e}"))
            }
        }
    }

    #[instrument(skip(self, command), fields(op = command.name()))]
    pub async fn handle(&self, command: Command) -> Reply {
        debug!(command = ?command, "Processing command");

        match command {
            Command::Check { request, at } => Reply::Verdict(self.coordinator.admit(&request, at).await),
            Command::Limits { request, at } => Reply::Limits(self.coordinator.limits(&request, at).await),
            Command::Usage { request, at } => match self.coordinator.usage(&request, at).await {
                Ok(usage) => Reply::Usage(usage),
                Err(e) => Reply::error(e.to_string()),
            },
            Command::Status { request, at } => match self.coordinator.status(&request, at).await {
                Ok(status) => Reply::Status(status),
                Err(e) => Reply::error(e.to_string()),
            },
            Command::Metrics => Reply::Metrics(self.coordinator.metrics()),
            Command::Load { load } => match &self.feedback {
                Some(feedback) => {
                    feedback.report(load);
                    Reply::Load {
                        load_factor: feedback.load_factor(),
                    }
                }
                None => Reply::error("load reporting is not enabled"),
            },
        }
    }
}
