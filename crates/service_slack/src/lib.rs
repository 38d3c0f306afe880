//! Slack service runtime: chat connection, user directory, listens and
//! callback storage for one service instance.

use std::sync::Arc;

pub mod connector;
pub mod directory;
pub mod service;
pub mod slack;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use service::{RuntimeSettings, SlackService};

/// A service wired to the real Slack API and Personium storage.
pub fn slack_service(settings: RuntimeSettings) -> SlackService {
    let connector = slack::SlackConnector::new(slack::SLACK_API, settings.reconnect_backoff);
    SlackService::new(Arc::new(connector), Arc::new(storage::PersoniumClient::new()), settings)
}
