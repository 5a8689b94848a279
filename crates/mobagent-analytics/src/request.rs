//! Description of a completed HTTP transaction.

use url::Url;

use crate::error::Result;
use crate::event::AnalyticEvent;

pub const ATTR_REQUEST_URL: &str = "requestUrl";
pub const ATTR_REQUEST_DOMAIN: &str = "requestDomain";
pub const ATTR_REQUEST_PATH: &str = "requestPath";
pub const ATTR_REQUEST_METHOD: &str = "requestMethod";
pub const ATTR_CONNECTION_TYPE: &str = "connectionType";
pub const ATTR_STATUS_CODE: &str = "statusCode";
pub const ATTR_BYTES_SENT: &str = "bytesSent";
pub const ATTR_BYTES_RECEIVED: &str = "bytesReceived";
pub const ATTR_RESPONSE_TIME: &str = "responseTime";
pub const ATTR_NETWORK_ERROR_CODE: &str = "networkErrorCode";
pub const ATTR_CONTENT_TYPE: &str = "contentType";

/// One request as seen by the instrumentation layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
    pub connection_type: Option<String>,
    pub status_code: Option<i64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub response_time_secs: f64,
    /// Transport-level failure code, set when no response arrived.
    pub network_error_code: Option<i64>,
    pub content_type: Option<String>,
}

impl NetworkRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_status_code(mut self, status_code: i64) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_network_error_code(mut self, code: i64) -> Self {
        self.network_error_code = Some(code);
        self
    }

    pub fn with_transfer(mut self, bytes_sent: u64, bytes_received: u64) -> Self {
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
        self
    }

    pub fn with_response_time(mut self, secs: f64) -> Self {
        self.response_time_secs = secs;
        self
    }

    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = Some(connection_type.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The url without query string or fragment, its host and its path.
    /// An unparseable url is reported as-is with no domain or path.
    pub fn split_url(&self) -> (String, Option<String>, Option<String>) {
        match Url::parse(&self.url) {
            Ok(mut parsed) => {
                parsed.set_query(None);
                parsed.set_fragment(None);
                let domain = parsed.host_str().map(str::to_string);
                let path = Some(parsed.path().to_string()).filter(|p| !p.is_empty());
                (parsed.to_string(), domain, path)
            }
            Err(e) => {
                tracing::debug!(error = %e, url = %self.url, "request url not parseable");
                (self.url.clone(), None, None)
            }
        }
    }

    /// Add the request attributes to `event`. Attributes the validator
    /// rejects are skipped.
    pub fn apply_to(&self, event: &mut AnalyticEvent) -> Result<()> {
        let (url, domain, path) = self.split_url();
        event.add_attribute(ATTR_REQUEST_URL, url)?;
        if let Some(domain) = domain {
            event.add_attribute(ATTR_REQUEST_DOMAIN, domain)?;
        }
        if let Some(path) = path {
            event.add_attribute(ATTR_REQUEST_PATH, path)?;
        }
        event.add_attribute(ATTR_REQUEST_METHOD, self.method.as_str())?;
        if let Some(connection_type) = &self.connection_type {
            event.add_attribute(ATTR_CONNECTION_TYPE, connection_type.as_str())?;
        }
        if let Some(status_code) = self.status_code {
            event.add_attribute(ATTR_STATUS_CODE, status_code)?;
        }
        event.add_attribute(ATTR_BYTES_SENT, self.bytes_sent)?;
        event.add_attribute(ATTR_BYTES_RECEIVED, self.bytes_received)?;
        event.add_attribute(ATTR_RESPONSE_TIME, self.response_time_secs)?;
        if let Some(code) = self.network_error_code {
            event.add_attribute(ATTR_NETWORK_ERROR_CODE, code)?;
        }
        if let Some(content_type) = &self.content_type {
            event.add_attribute(ATTR_CONTENT_TYPE, content_type.as_str())?;
        }
        Ok(())
    }
}
