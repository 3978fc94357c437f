//! Host-side request description.
//!
//! [`HostRequest`] is what a host knows about an incoming request. It builds
//! the two blobs the bridge consumes: every header in arrival order, and the
//! server variables a script sees.

use crate::codec::BlobBuilder;
use crate::config::BridgeConfig;
use crate::context::{RequestDescriptor, WorkerId};

/// Request headers copied into server variables, keyed by header name
const HEADER_VARIABLES: &[(&str, &str)] = &[
    ("host", "HTTP_HOST"),
    ("user-agent", "HTTP_USER_AGENT"),
    ("accept", "HTTP_ACCEPT"),
    ("cookie", "HTTP_COOKIE"),
    ("content-length", "CONTENT_LENGTH"),
    ("content-type", "CONTENT_TYPE"),
];

/// An incoming request as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    /// Request method
    pub method: String,
    /// Raw request URI including the query
    pub request_uri: String,
    /// Raw query string
    pub query: String,
    /// Protocol major version
    pub proto_major: u16,
    /// Protocol minor version
    pub proto_minor: u16,
    /// URL scheme
    pub scheme: String,
    /// Peer address as `addr:port`
    pub remote_addr: String,
    /// Headers in arrival order; names may repeat
    pub headers: Vec<(String, String)>,
}

impl HostRequest {
    /// Create an HTTP/1.1 request. The query is taken from the URI.
    pub fn new(method: impl Into<String>, request_uri: impl Into<String>) -> Self {
        let request_uri = request_uri.into();
        let query = request_uri
            .split_once('?')
            .map(|(_, query)| query.to_string())
            .unwrap_or_default();

        Self {
            method: method.into(),
            request_uri,
            query,
            proto_major: 1,
            proto_minor: 1,
            scheme: "http".to_string(),
            remote_addr: String::new(),
            headers: Vec::new(),
        }
    }

    /// Set the protocol version
    pub fn with_proto(mut self, major: u16, minor: u16) -> Self {
        self.proto_major = major;
        self.proto_minor = minor;
        self
    }

    /// Set the URL scheme
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Set the peer address
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Protocol as `HTTP/major.minor`
    pub fn protocol(&self) -> String {
        format!("HTTP/{}.{}", self.proto_major, self.proto_minor)
    }

    /// Protocol as `major * 1000 + minor`
    pub fn proto_num(&self) -> i32 {
        i32::from(self.proto_major) * 1000 + i32::from(self.proto_minor)
    }

    fn last_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Encode every header, in order
    pub fn header_blob(&self) -> Vec<u8> {
        let mut builder = BlobBuilder::new();
        for (name, value) in &self.headers {
            builder.push(name, value);
        }
        builder.finish()
    }

    /// Encode the server variables for this request
    pub fn variable_blob(&self, script_name: &str, server_software: &str) -> Vec<u8> {
        let mut builder = BlobBuilder::new();

        for (header, variable) in HEADER_VARIABLES {
            if let Some(value) = self.last_header(header) {
                builder.push(variable, value);
            }
        }

        builder.push("SERVER_SOFTWARE", server_software);
        let (addr, port) = split_remote_addr(&self.remote_addr);
        builder.push("REMOTE_ADDR", addr);
        if let Some(port) = port {
            builder.push("REMOTE_PORT", port);
        }
        builder
            .push("REQUEST_SCHEME", &self.scheme)
            .push("SERVER_PROTOCOL", self.protocol())
            .push("REQUEST_METHOD", &self.method)
            .push("QUERY_STRING", &self.query)
            .push("REQUEST_URI", &self.request_uri)
            .push("SCRIPT_NAME", script_name);

        builder.finish()
    }

    /// Turn this request into a descriptor for `worker_id`
    pub fn into_descriptor(self, worker_id: WorkerId, config: &BridgeConfig) -> RequestDescriptor {
        let header_blob = self.header_blob();
        let script_name = config.script_path.to_string_lossy();
        let variable_blob = self.variable_blob(&script_name, &config.server_software);

        RequestDescriptor::new(
            worker_id,
            self.proto_num(),
            self.method,
            self.request_uri,
            self.query,
            header_blob,
            variable_blob,
        )
    }
}

/// Split `addr:port`, `[v6]:port` or a bare address. IPv6 brackets are removed.
fn split_remote_addr(remote: &str) -> (&str, Option<&str>) {
    if let Some(rest) = remote.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':')),
            None => (remote, None),
        };
    }
    match remote.rsplit_once(':') {
        Some((addr, port)) if !addr.contains(':') => (addr, Some(port)),
        _ => (remote, None),
    }
}
