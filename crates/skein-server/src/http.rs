//! HTTP front: WebSocket admission and the roster endpoint.
//!
//! `GET /client` and `GET /server` upgrade to WebSocket after the
//! digest check; `GET /q/servers` serves the mesh roster as JSON for
//! bootstrap. Admission is a shared-secret digest:
//! `md5_hex(addr || nonce || token)` with the client or server token.

use std::net::SocketAddr;

use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use md5::{Digest, Md5};
use serde::Deserialize;
use tracing::{info, warn};

use skein_wire::{Addr, AddrKind, Body, Message, ServerEntry};

use crate::hub::{HubHandle, HubListener, PacketBody, PeerRole};
use crate::peer::{Peer, PeerConfig};
use crate::transport::split_inbound;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub peer_cfg: PeerConfig,
    pub origins: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/client", get(client_ws))
        .route("/server", get(server_ws))
        .route("/q/servers", get(query_servers))
        .with_state(state)
}

/// Serve the router until the process exits.
pub async fn serve(listen_host: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_host).await?;
    info!(addr = %listen_host, "http: listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[derive(Debug, Deserialize)]
struct AdmitQuery {
    addr: String,
    nonce: String,
    digest: String,
    /// Client-only: notify conversation partners on disconnect.
    #[serde(default)]
    notice: u8,
    /// Server-only: the dialing hub's advertised URLs.
    #[serde(default)]
    client_url: String,
    #[serde(default)]
    server_url: String,
}

fn digest_ok(query: &AdmitQuery, token: &str) -> bool {
    let mut hasher = Md5::new();
    hasher.update(query.addr.as_bytes());
    hasher.update(query.nonce.as_bytes());
    hasher.update(token.as_bytes());
    let expected = hex::encode(hasher.finalize());
    expected.eq_ignore_ascii_case(&query.digest)
}

fn origin_allowed(headers: &HeaderMap, origins: &str) -> bool {
    if origins == "*" {
        return true;
    }
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    origins.contains(origin)
}

/// Shared admission path for both upgrade endpoints.
fn admit(
    query: &AdmitQuery,
    headers: &HeaderMap,
    state: &AppState,
    kind: AddrKind,
    token: &str,
) -> Result<Addr, Response> {
    if !origin_allowed(headers, &state.origins) {
        warn!(addr = %query.addr, "http: origin refused");
        return Err(StatusCode::FORBIDDEN.into_response());
    }
    if !digest_ok(query, token) {
        warn!(addr = %query.addr, "http: digest mismatch");
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    let addr: Addr = match query.addr.parse() {
        Ok(addr) => addr,
        Err(_) => return Err(StatusCode::BAD_REQUEST.into_response()),
    };
    if addr.kind() != kind {
        return Err(StatusCode::BAD_REQUEST.into_response());
    }
    Ok(addr)
}

async fn client_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<AdmitQuery>,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = state.hub.server().client_token.clone();
    let addr = match admit(&query, &headers, &state, AddrKind::Client, &token) {
        Ok(addr) => addr,
        Err(resp) => return resp,
    };
    let notice = query.notice == 1;
    ws.on_upgrade(move |socket| async move {
        attach_client(socket, addr, remote, notice, state).await;
    })
}

async fn attach_client(
    socket: WebSocket,
    addr: Addr,
    remote: SocketAddr,
    offline_notice: bool,
    state: AppState,
) {
    let peer = Peer::new(addr, &remote.to_string(), state.peer_cfg.clone());
    let handle = peer.handle();
    let listener = HubListener::new(PeerRole::Client, state.hub.clone(), handle.clone());
    let (sink, source) = split_inbound(socket);
    peer.start(sink, source, listener);

    let registered = state
        .hub
        .request(
            addr,
            PacketBody::AddClientPeer {
                handle: handle.clone(),
                offline_notice,
            },
        )
        .await;
    match registered {
        Ok(_) => info!(client = %addr, %remote, "http: client attached"),
        Err(e) => {
            warn!(client = %addr, error = %e, "http: registration failed");
            handle.close();
        }
    }
}

async fn server_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<AdmitQuery>,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = state.hub.server().server_token.clone();
    let addr = match admit(&query, &headers, &state, AddrKind::Server, &token) {
        Ok(addr) => addr,
        Err(resp) => return resp,
    };
    let entry = ServerEntry {
        addr: query.addr.clone(),
        client_url: query.client_url.clone(),
        server_url: query.server_url.clone(),
    };
    ws.on_upgrade(move |socket| async move {
        attach_server(socket, addr, remote, entry, state).await;
    })
}

async fn attach_server(
    socket: WebSocket,
    addr: Addr,
    remote: SocketAddr,
    entry: ServerEntry,
    state: AppState,
) {
    let peer = Peer::new(addr, &remote.to_string(), state.peer_cfg.clone());
    let handle = peer.handle();
    let listener = HubListener::new(PeerRole::Server, state.hub.clone(), handle.clone());
    let (sink, source) = split_inbound(socket);
    peer.start(sink, source, listener);

    let registered = state
        .hub
        .request(
            addr,
            PacketBody::AddServerPeer {
                handle: handle.clone(),
                entry,
            },
        )
        .await;
    match registered {
        Ok(_) => info!(server = %addr, %remote, "http: mesh peer attached"),
        Err(e) => {
            warn!(server = %addr, error = %e, "http: registration failed");
            handle.close();
        }
    }
}

/// Mesh roster, self included. The bootstrap seed endpoint.
async fn query_servers(State(state): State<AppState>) -> Response {
    let self_addr = state.hub.server().addr;
    let query = Message::new(self_addr, self_addr, Body::QueryServers);
    match state.hub.request(self_addr, PacketBody::Relay(query)).await {
        Ok(resp) => match resp.body {
            Some(Body::QueryServersResp(m)) => Json(m.servers).into_response(),
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_md5_of_addr_nonce_token() {
        let query = AdmitQuery {
            addr: "c1.0/alice".into(),
            nonce: "1700000000".into(),
            // md5("c1.0/alice" + "1700000000" + "secret")
            digest: {
                let mut hasher = Md5::new();
                hasher.update(b"c1.0/alice1700000000secret");
                hex::encode(hasher.finalize())
            },
            notice: 0,
            client_url: String::new(),
            server_url: String::new(),
        };
        assert!(digest_ok(&query, "secret"));
        assert!(!digest_ok(&query, "wrong"));
    }

    #[test]
    fn origin_rules() {
        let mut headers = HeaderMap::new();
        assert!(origin_allowed(&headers, "*"));
        // No Origin header: non-browser client, allowed.
        assert!(origin_allowed(&headers, "https://app.example.com"));

        headers.insert(header::ORIGIN, "https://app.example.com".parse().unwrap());
        assert!(origin_allowed(&headers, "https://app.example.com"));

        headers.insert(header::ORIGIN, "https://evil.example.com".parse().unwrap());
        assert!(!origin_allowed(&headers, "https://app.example.com"));
    }
}
