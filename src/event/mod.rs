pub mod browser;
pub mod referrer;

use std::collections::HashMap;

/// Inbound request attributes consumed by the recorder and queue writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEvent {
    /// Request host name.
    pub host: String,
    /// Request path without the query string.
    pub path: String,
    /// Raw `Referer` header value.
    pub referrer: Option<String>,
    /// Decoded query parameters.
    pub query: Option<HashMap<String, String>>,
    /// Raw `User-Agent` header value.
    pub user_agent: Option<String>,
}

impl RequestEvent {
    /// Creates an event for a host and path with no optional attributes.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
