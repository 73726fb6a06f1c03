//! Request forwarding to upstreams with streaming support.
//!
//! Forwards a buffered request body to the upstream, preserving headers
//! apart from the hop-by-hop set, and streams the response back. SSE
//! responses get `x-accel-buffering: no` so intermediate proxies do not
//! buffer the stream.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::TryStreamExt;
use llamaswap_runtime::upstream::UpstreamAddr;
use tracing::{debug, error};

use crate::error::ProxyError;

/// Iterate the headers that cross the proxy in either direction.
///
/// Connection-level fields (RFC 9112) stay on their own hop. `host` and
/// `content-length` are recomputed for the upstream connection, and
/// `authorization` carries the gateway API key, which the upstream must
/// never see. `HeaderName` is already lowercase, so a plain match works.
fn forwardable(headers: &HeaderMap) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
    headers.iter().filter(|(name, _)| {
        !matches!(
            name.as_str(),
            "connection"
                | "keep-alive"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "host"
                | "content-length"
                | "authorization"
        )
    })
}

/// Rewrite a JSON request body for a model's forwarding rules: strip the
/// listed top-level keys, apply `set_params` (the `model` key is
/// protected), and replace `model` with `use_model_name` when configured.
///
/// A body that does not parse as a JSON object passes through untouched.
pub fn rewrite_body(
    body: Bytes,
    use_model_name: &str,
    strip_params: &[String],
    set_params: &BTreeMap<String, serde_json::Value>,
) -> Bytes {
    if use_model_name.is_empty() && strip_params.is_empty() && set_params.is_empty() {
        return body;
    }
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(map) = value.as_object_mut() else {
        return body;
    };

    for key in strip_params {
        map.remove(key);
    }
    for (key, param) in set_params {
        if key == "model" {
            continue;
        }
        map.insert(key.clone(), param.clone());
    }
    if !use_model_name.is_empty() {
        map.insert(
            "model".to_string(),
            serde_json::Value::String(use_model_name.to_string()),
        );
    }

    serde_json::to_vec(&value).map_or(body, Bytes::from)
}

/// Forward a request to the upstream and stream the response back.
pub async fn forward(
    client: &reqwest::Client,
    addr: &UpstreamAddr,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    match addr {
        UpstreamAddr::Tcp { .. } => {
            forward_tcp(client, addr, method, path_and_query, headers, body).await
        }
        UpstreamAddr::Unix { socket } => {
            forward_unix(socket, method, path_and_query, headers, body).await
        }
    }
}

async fn forward_tcp(
    client: &reqwest::Client,
    addr: &UpstreamAddr,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let url = addr.url_for(path_and_query);
    debug!(url = %url, method = %method, "Forwarding to upstream");

    let mut builder = client.request(
        reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ProxyError::Invariant(e.to_string()))?,
        &url,
    );
    for (name, value) in forwardable(headers) {
        builder = builder.header(name, value);
    }

    let response = builder.body(body).send().await.map_err(|e| {
        error!(url = %url, error = %e, "Failed to reach upstream");
        ProxyError::Upstream(e.to_string())
    })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    let mut streaming = false;
    for (name, value) in forwardable(response.headers()) {
        if name == &header::CONTENT_TYPE
            && value
                .to_str()
                .is_ok_and(|v| v.starts_with("text/event-stream"))
        {
            streaming = true;
        }
        builder = builder.header(name, value);
    }
    if streaming {
        builder = builder.header("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let stream = response.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Invariant(e.to_string()))
}

#[cfg(unix)]
async fn forward_unix(
    socket: &std::path::Path,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    use http_body_util::{BodyExt, Full};
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    debug!(socket = %socket.display(), path = %path_and_query, "Forwarding to unix upstream");

    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    tokio::spawn(conn);

    // Origin-form request line; the synthetic localhost authority only
    // lives in the Host header.
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(path_and_query);
    builder = builder.header(header::HOST, "localhost");
    for (name, value) in forwardable(headers) {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::Invariant(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    let (parts, incoming) = response.into_parts();
    let mut builder = Response::builder().status(parts.status);
    let mut streaming = false;
    for (name, value) in forwardable(&parts.headers) {
        if name == &header::CONTENT_TYPE
            && value
                .to_str()
                .is_ok_and(|v| v.starts_with("text/event-stream"))
        {
            streaming = true;
        }
        builder = builder.header(name, value);
    }
    if streaming {
        builder = builder.header("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let stream = incoming.into_data_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ProxyError::Invariant(e.to_string()))
}

#[cfg(not(unix))]
async fn forward_unix(
    _socket: &std::path::Path,
    _method: Method,
    _path_and_query: &str,
    _headers: &HeaderMap,
    _body: Bytes,
) -> Result<Response, ProxyError> {
    Err(ProxyError::Upstream(
        "unix sockets are not supported on this platform".to_string(),
    ))
}
