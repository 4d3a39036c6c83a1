//! Header block construction and parsing.
//!
//! Maps between [`Request`]/[`Response`] messages and the decoded
//! [`HeaderField`] lists the codec exchanges. Pseudo-headers are written
//! first, in the order `:method`, `:scheme`, `:authority`, `:path`
//! (`:status` for responses); regular names pass through a process-wide
//! lowercasing cache.

use crate::codec::{ErrorCode, HeaderField};
use crate::error::{Error, StreamException};
use crate::message::{Headers, Method, Request, Response};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Connection-specific headers that must not appear in HTTP/2.
const FORBIDDEN_NAMES: [&str; 4] = ["connection", "proxy-connection", "keep-alive", "upgrade"];

/// Cache size bound; past this, names are lowercased without caching.
const NAME_CACHE_CAP: usize = 512;

static NAME_CACHE: OnceLock<RwLock<AHashMap<String, Arc<str>>>> = OnceLock::new();

/// Lowercase a header name through the process-wide cache.
///
/// The cache is insert-if-absent and bounded; correctness does not depend
/// on hits. Distinct incoming casings each get their own entry so repeat
/// senders never re-allocate.
fn lower_name(name: &str) -> Arc<str> {
    let cache = NAME_CACHE.get_or_init(|| RwLock::new(AHashMap::new()));
    if let Some(hit) = cache.read().get(name) {
        return hit.clone();
    }
    let lowered: Arc<str> = name.to_ascii_lowercase().into();
    let mut write = cache.write();
    if write.len() < NAME_CACHE_CAP {
        write.insert(name.to_string(), lowered.clone());
    }
    lowered
}

fn validate_name(name: &str, value: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidHeader("empty header name".to_string()));
    }
    if FORBIDDEN_NAMES.contains(&name) {
        return Err(Error::InvalidHeader(format!(
            "connection-specific header not allowed in HTTP/2: {}",
            name
        )));
    }
    if name == "transfer-encoding" && value != "trailers" {
        return Err(Error::InvalidHeader(format!(
            "transfer-encoding only permits \"trailers\", got: {}",
            value
        )));
    }
    Ok(())
}

fn push_regular_headers(fields: &mut Vec<HeaderField>, headers: &Headers) -> Result<(), Error> {
    for (name, value) in headers.iter() {
        let lowered = lower_name(name);
        validate_name(&lowered, value)?;
        fields.push(HeaderField::new(lowered.as_bytes(), value.as_bytes()));
    }
    Ok(())
}

/// Build the HEADERS block for an outbound request.
pub fn encode_request_headers(request: &Request) -> Result<Vec<HeaderField>, Error> {
    if request.scheme.is_empty() {
        return Err(StreamException::new(ErrorCode::ProtocolError, "missing :scheme").into());
    }
    if request.authority.is_empty() {
        return Err(StreamException::new(ErrorCode::ProtocolError, "missing :authority").into());
    }
    if request.uri.is_empty() {
        return Err(StreamException::new(ErrorCode::ProtocolError, "missing :path").into());
    }

    let mut fields = Vec::with_capacity(4 + request.headers.len());
    fields.push(HeaderField::new(":method", request.method.as_str()));
    fields.push(HeaderField::new(":scheme", request.scheme.as_str()));
    fields.push(HeaderField::new(":authority", request.authority.as_str()));
    fields.push(HeaderField::new(":path", request.path()));

    push_regular_headers(&mut fields, &request.headers)?;
    Ok(fields)
}

/// Build the HEADERS block for an outbound response.
pub fn encode_response_headers(response: &Response) -> Result<Vec<HeaderField>, Error> {
    if response.status.is_none() {
        debug!("response without :status, defaulting to 200");
    }
    let status = response.status_or_default();

    let mut fields = Vec::with_capacity(1 + response.headers.len());
    fields.push(HeaderField::new(":status", format!("{:03}", status)));

    push_regular_headers(&mut fields, &response.headers)?;
    Ok(fields)
}

/// The request line a decoded HEADERS block yields.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub scheme: String,
    /// Empty when the peer sent no `:authority`.
    pub authority: String,
    pub uri: String,
    pub query_string: Option<String>,
    pub headers: Headers,
}

/// Parse an inbound request HEADERS block.
pub fn decode_request_head(fields: &[HeaderField]) -> Result<RequestHead, Error> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = Headers::new();

    for field in fields {
        let name = field.name_str().ok_or_else(|| {
            StreamException::new(ErrorCode::ProtocolError, "non-utf8 header name")
        })?;
        let value = field.value_str().ok_or_else(|| {
            StreamException::new(ErrorCode::ProtocolError, "non-utf8 header value")
        })?;

        match name {
            ":method" => method = Some(Method::from_token(value)),
            ":scheme" => scheme = Some(value.to_string()),
            ":authority" => authority = Some(value.to_string()),
            ":path" => path = Some(value.to_string()),
            _ if name.starts_with(':') => {
                return Err(StreamException::new(
                    ErrorCode::ProtocolError,
                    format!("unknown pseudo-header: {}", name),
                )
                .into());
            }
            _ => headers.append(name, value),
        }
    }

    let method =
        method.ok_or_else(|| StreamException::new(ErrorCode::ProtocolError, "missing :method"))?;
    let scheme =
        scheme.ok_or_else(|| StreamException::new(ErrorCode::ProtocolError, "missing :scheme"))?;
    let path =
        path.ok_or_else(|| StreamException::new(ErrorCode::ProtocolError, "missing :path"))?;

    let (uri, query_string) = match path.split_once('?') {
        Some((uri, query)) if !query.is_empty() => (uri.to_string(), Some(query.to_string())),
        Some((uri, _)) => (uri.to_string(), None),
        None => (path, None),
    };

    Ok(RequestHead {
        method,
        scheme,
        authority: authority.unwrap_or_default(),
        uri,
        query_string,
        headers,
    })
}

/// Parse an inbound response HEADERS block into status and headers.
pub fn decode_response_head(fields: &[HeaderField]) -> Result<(u16, Headers), Error> {
    let mut status = None;
    let mut headers = Headers::new();

    for field in fields {
        let name = field.name_str().ok_or_else(|| {
            StreamException::new(ErrorCode::ProtocolError, "non-utf8 header name")
        })?;
        let value = field.value_str().ok_or_else(|| {
            StreamException::new(ErrorCode::ProtocolError, "non-utf8 header value")
        })?;

        if name == ":status" {
            let parsed = value.parse::<u16>().map_err(|_| {
                StreamException::new(
                    ErrorCode::ProtocolError,
                    format!("unparsable :status: {}", value),
                )
            })?;
            status = Some(parsed);
        } else if !name.starts_with(':') {
            headers.append(name, value);
        }
    }

    let status =
        status.ok_or_else(|| StreamException::new(ErrorCode::ProtocolError, "missing :status"))?;
    Ok((status, headers))
}
