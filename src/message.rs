//! Request and response messages.

use crate::body::Body;
use crate::channel::Completion;
use crate::stream::StreamChannel;
use ahash::AHashMap;
use std::sync::Arc;

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
    /// Any other token, stored upper-cased.
    Other(String),
}

impl Method {
    /// The wire form (upper-case token).
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
            Method::Other(s) => s,
        }
    }

    /// Parse a method token, case-insensitively.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            other => Method::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header multimap.
///
/// Keys are normalized to lowercase ASCII. A key may carry several values;
/// `get` answers the first, `get_all` the whole list.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: AHashMap<String, Vec<String>>,
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing values.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.entries.insert(name, vec![value.into()]);
    }

    /// Add a value for a header, keeping existing values.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.entries.entry(name).or_default().push(value.into());
    }

    /// Get the first value for a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Get all values for a header.
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
    }

    /// Check if a header is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Remove all values for a header.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    /// Iterate over all name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Number of name/value pairs (counting duplicates).
    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// A request, outbound from a client or assembled inbound on a server.
#[derive(Debug)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// `http` or `https`.
    pub scheme: String,
    /// Host, with port when not the scheme default.
    pub authority: String,
    /// Raw path, without the query string.
    pub uri: String,
    /// Query string, without the leading `?`.
    pub query_string: Option<String>,
    /// Regular headers.
    pub headers: Headers,
    /// Body.
    pub body: Body,
    /// Per-request chunk size override for file and chunked bodies.
    pub chunk_size: Option<usize>,
    /// Inbound only: the stream this request arrived on, exposing the
    /// writable flag and the last-exception slot.
    pub stream: Option<Arc<StreamChannel>>,
    /// Reserved for trailer headers; never populated.
    pub trailers: Option<Headers>,
}

impl Request {
    /// Start building a request.
    pub fn builder(method: Method, uri: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            request: Request {
                method,
                scheme: "https".to_string(),
                authority: String::new(),
                uri: uri.into(),
                query_string: None,
                headers: Headers::new(),
                body: Body::Empty,
                chunk_size: None,
                stream: None,
                trailers: None,
            },
        }
    }

    /// Full path: uri plus `?query` when a query string is present.
    pub fn path(&self) -> String {
        match &self.query_string {
            Some(q) => format!("{}?{}", self.uri, q),
            None => self.uri.clone(),
        }
    }

    /// Whether the request can still be answered (inbound requests only).
    pub fn is_writable(&self) -> bool {
        self.stream.as_ref().is_none_or(|s| s.is_writable())
    }
}

/// Builder for outbound requests.
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Set the scheme.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.request.scheme = scheme.into();
        self
    }

    /// Set the authority.
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.request.authority = authority.into();
        self
    }

    /// Set the query string.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.request.query_string = Some(query.into());
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.append(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Override the chunk size for this request.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.request.chunk_size = Some(chunk_size);
        self
    }

    /// Finish the request.
    pub fn build(self) -> Request {
        self.request
    }
}

/// A response, outbound from a server handler or assembled inbound on a
/// client.
#[derive(Debug)]
pub struct Response {
    /// Status code. Absent defaults to 200 at encode time.
    pub status: Option<u16>,
    /// Regular headers.
    pub headers: Headers,
    /// Body.
    pub body: Body,
    /// Inbound only: resolves true when the connection must shut down,
    /// false when the stream closed cleanly.
    pub complete: Option<Completion<bool>>,
}

impl Response {
    /// Create a response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status: Some(status),
            headers: Headers::new(),
            body: Body::Empty,
            complete: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code, applying the compatibility default.
    pub fn status_or_default(&self) -> u16 {
        self.status.unwrap_or(200)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: Body::Empty,
            complete: None,
        }
    }
}
