//! Request identity and client key derivation.

use std::fmt;

use crate::clock::{Clock, MonotonicClock};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";
/// Header carrying the caller's correlation id.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Identity and context of one evaluation request.
///
/// Built fresh for every call. The timestamp is a monotonic millisecond
/// reading; local algorithms use it as "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Unique per call. Fallback client key and shared-store member token.
    pub request_id: String,
    /// Monotonic milliseconds at call time.
    pub timestamp_ms: u64,
    pub path: Option<String>,
    pub method: Option<String>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub correlation_id: Option<String>,
    pub client_id: Option<String>,
}

impl RequestInfo {
    /// Create a request with a random id stamped with the process monotonic clock.
    pub fn new() -> Self {
        Self::at(uuid::Uuid::new_v4().simple().to_string(), MonotonicClock.now_ms())
    }

    /// Create a request with an explicit id and timestamp.
    pub fn at(request_id: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp_ms,
            path: None,
            method: None,
            user_id: None,
            api_key: None,
            correlation_id: None,
            client_id: None,
        }
    }

    /// Build a request from transport headers.
    ///
    /// Header names are matched case-insensitively. `client_id_header` is the
    /// configured [`GlobalConfig::client_id_header`](super::GlobalConfig).
    pub fn from_headers<'a, I>(headers: I, client_id_header: &str) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut request = Self::new();
        for (name, value) in headers {
            let slot = if name.eq_ignore_ascii_case(API_KEY_HEADER) {
                &mut request.api_key
            } else if name.eq_ignore_ascii_case(CORRELATION_ID_HEADER) {
                &mut request.correlation_id
            } else if name.eq_ignore_ascii_case(client_id_header) {
                &mut request.client_id
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        request
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the client id only when none was supplied, e.g. from the peer address.
    ///
    /// Without any identity the request gets a per-request anonymous key and is
    /// never effectively limited.
    pub fn or_client_id(mut self, fallback: impl Into<String>) -> Self {
        if present(&self.client_id).is_none() {
            self.client_id = Some(fallback.into());
        }
        self
    }

    /// Derive the client key for this request.
    pub fn client_key(&self) -> ClientKey {
        ClientKey::derive(self)
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Who a request belongs to for per-identity limiting.
///
/// Precedence: API key, then user id, then client id, then a per-request
/// anonymous key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    ApiKey(String),
    User(String),
    Client(String),
    Anonymous(String),
}

impl ClientKey {
    /// Derive the key for a request. Blank attributes count as absent.
    pub fn derive(request: &RequestInfo) -> Self {
        if let Some(api_key) = present(&request.api_key) {
            return ClientKey::ApiKey(api_key.to_string());
        }
        if let Some(user_id) = present(&request.user_id) {
            return ClientKey::User(user_id.to_string());
        }
        if let Some(client_id) = present(&request.client_id) {
            return ClientKey::Client(client_id.to_string());
        }
        ClientKey::Anonymous(request.request_id.clone())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, ClientKey::Anonymous(_))
    }

    /// The prefixed string form used as cache and store key.
    pub fn to_string_key(&self) -> String {
        let (prefix, value) = match self {
            ClientKey::ApiKey(v) => ("api", v),
            ClientKey::User(v) => ("user", v),
            ClientKey::Client(v) => ("client", v),
            ClientKey::Anonymous(v) => ("anon", v),
        };
        format!("{}:{}", prefix, value)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
