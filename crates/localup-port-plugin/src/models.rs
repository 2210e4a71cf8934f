//! frp server-plugin protocol types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Operation sent by frps before a proxy is registered
pub const OP_NEW_PROXY: &str = "NewProxy";

/// Envelope posted by the proxy core for every plugin operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Protocol version
    #[serde(default)]
    pub version: String,
    /// Operation name (`Login`, `NewProxy`, ...)
    #[serde(default)]
    pub op: String,
    /// Operation specific payload, echoed back when the plugin accepts it
    #[serde(default)]
    pub content: Option<Map<String, Value>>,
}

/// Plugin answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Abort the operation
    pub reject: bool,
    /// Human readable reason, set when `reject` is true
    #[serde(default)]
    pub reject_reason: String,
    /// Accept the operation without touching its content
    #[serde(default)]
    pub unchange: bool,
    /// Content the proxy core should continue with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Map<String, Value>>,
}

impl PluginResponse {
    /// Accept as-is, without echoing content
    pub fn pass() -> Self {
        Self {
            reject: false,
            reject_reason: String::new(),
            unchange: true,
            content: None,
        }
    }

    /// Accept as-is, echoing the original content
    pub fn unchanged(content: Map<String, Value>) -> Self {
        Self {
            content: Some(content),
            ..Self::pass()
        }
    }

    /// Accept with rewritten content
    pub fn modified(content: Map<String, Value>) -> Self {
        Self {
            reject: false,
            reject_reason: String::new(),
            unchange: false,
            content: Some(content),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reject: true,
            reject_reason: reason.into(),
            unchange: false,
            content: None,
        }
    }
}

/// Fields of a `NewProxy` payload this plugin reads.
///
/// Absent and `null` fields fall back to their defaults; everything else in
/// the payload is ignored here and passed through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProxyContent {
    pub proxy_name: Option<String>,
    pub proxy_type: Option<String>,
    pub remote_port: Option<i64>,
    /// Proxy level metadata
    #[serde(default, deserialize_with = "lenient")]
    pub metas: Option<HashMap<String, String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub user: Option<UserInfo>,
}

/// Identity of the frpc client that owns the proxy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    pub user: Option<String>,
    pub run_id: Option<String>,
    /// User level metadata
    pub metas: Option<HashMap<String, String>>,
}

/// Informational fields never fail a request: a value of the wrong shape
/// reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// `proxy_type` of a raw payload, empty when absent or not a string
pub fn proxy_type_of(content: &Map<String, Value>) -> &str {
    content
        .get("proxy_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Only TCP and UDP proxies get a port from the allocator
pub fn needs_port(proxy_type: &str) -> bool {
    matches!(proxy_type, "tcp" | "udp")
}

impl NewProxyContent {
    /// Read the typed view out of a raw payload
    pub fn from_content(content: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(content.clone()))
    }

    pub fn proxy_name(&self) -> &str {
        self.proxy_name.as_deref().unwrap_or_default()
    }

    pub fn proxy_type(&self) -> &str {
        self.proxy_type.as_deref().unwrap_or_default()
    }

    /// Requested public port, 0 when the client leaves the choice to us
    pub fn remote_port(&self) -> i64 {
        self.remote_port.unwrap_or(0)
    }

    /// Metadata attached to the proxy, falling back to the user's metadata
    pub fn metas(&self) -> Option<&HashMap<String, String>> {
        self.metas
            .as_ref()
            .or_else(|| self.user.as_ref().and_then(|user| user.metas.as_ref()))
    }

    /// Proxy name that can be stored as one token of a port map record
    pub fn has_valid_name(&self) -> bool {
        !self.proxy_name().chars().any(char::is_whitespace)
    }
}
