use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderName, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, warn};

use crate::metrics;

/// Upstream target for everything the relay does not intercept.
#[derive(Clone)]
pub struct ProxyState {
    client: Client<HttpConnector, Body>,
    upstream_host: String,
    upstream_port: u16,
}

impl ProxyState {
    pub fn new(upstream_host: String, upstream_port: u16) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            upstream_host,
            upstream_port,
        }
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

/// Fallback for every non-relay path: HTTP requests are forwarded verbatim
/// to the inner application; WebSocket upgrades are tunneled to it with the
/// original path and headers replayed.
pub async fn proxy_handler(
    State(proxy): State<ProxyState>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let path_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    if let Some(ws) = ws {
        let target = format!("ws://{}{}", proxy.authority(), path_query);
        let headers = req.headers().clone();
        return ws.on_upgrade(move |socket| async move {
            if let Err(err) = tunnel_upgrade(socket, target, headers).await {
                metrics::PROXY_ERRORS.with_label_values(&["tunnel"]).inc();
                debug!(error = %err, "websocket tunnel closed with error");
            }
        });
    }

    forward_http(proxy, req, path_query).await
}

async fn forward_http(proxy: ProxyState, mut req: Request<Body>, path_query: String) -> Response {
    let target = format!("http://{}{}", proxy.authority(), path_query);
    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(err) => {
            warn!(%target, error = %err, "unparseable proxy target");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    *req.uri_mut() = uri;
    if let Ok(value) = header::HeaderValue::from_str(&proxy.authority()) {
        req.headers_mut().insert(header::HOST, value);
    }

    // The request body streams through; nothing is written to the client
    // until the upstream answers, so a failure here is always a clean 502.
    match proxy.client.request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(err) => {
            metrics::PROXY_ERRORS.with_label_values(&["http"]).inc();
            warn!(error = %err, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Headers the tunnel must not replay: the client handshake headers are
/// regenerated by the outbound handshake, and hop-by-hop headers do not
/// cross the proxy.
fn is_handshake_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "upgrade"
            | "sec-websocket-key"
            | "sec-websocket-version"
            | "sec-websocket-extensions"
    )
}

async fn tunnel_upgrade(
    client_socket: WebSocket,
    target: String,
    headers: HeaderMap,
) -> anyhow::Result<()> {
    let mut request = target.clone().into_client_request()?;
    for (name, value) in headers.iter() {
        if is_handshake_header(name) {
            continue;
        }
        request.headers_mut().insert(name.clone(), value.clone());
    }

    debug!(%target, "tunneling websocket upgrade to upstream");
    let (upstream, _) = connect_async(request).await?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let forward = match message? {
                Message::Text(text) => UpstreamMessage::Text(text.into()),
                Message::Binary(data) => UpstreamMessage::Binary(data.into()),
                Message::Ping(data) => UpstreamMessage::Ping(data.into()),
                Message::Pong(data) => UpstreamMessage::Pong(data.into()),
                Message::Close(_) => UpstreamMessage::Close(None),
            };
            upstream_tx.send(forward).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let forward = match message? {
                UpstreamMessage::Text(text) => Message::Text(text.as_str().to_owned()),
                UpstreamMessage::Binary(data) => Message::Binary(data.to_vec()),
                UpstreamMessage::Ping(data) => Message::Ping(data.to_vec()),
                UpstreamMessage::Pong(data) => Message::Pong(data.to_vec()),
                UpstreamMessage::Close(_) => Message::Close(None),
                UpstreamMessage::Frame(_) => continue,
            };
            client_tx.send(forward).await.map_err(|err| anyhow::anyhow!("client send: {err}"))?;
        }
        Ok::<(), anyhow::Error>(())
    };

    // Either side closing tears the tunnel down.
    tokio::select! {
        result = client_to_upstream => result?,
        result = upstream_to_client => result?,
    }

    Ok(())
}
