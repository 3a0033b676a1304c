//! Cluster bootstrap: fetch the mesh roster from a seed hub and dial
//! every peer on it.
//!
//! Bootstrap is best-effort. A peer that cannot be reached is logged
//! and skipped; the hub serves its local clients either way and the
//! missed peer will dial us instead when it bootstraps.

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use tracing::{info, warn};

use skein_wire::{Addr, ServerEntry};

use crate::config::Config;
use crate::error::HubError;
use crate::hub::{HubHandle, HubListener, PacketBody, PeerRole};
use crate::peer::{Peer, PeerConfig};
use crate::transport::split_outbound;

/// Fetch the roster from the configured seed and connect to every hub
/// on it that is not us. Never fails the caller.
pub async fn bootstrap(hub: &HubHandle, config: &Config) {
    let Some(seed) = &config.cluster_seed_url else {
        return;
    };

    let servers = match fetch_servers(seed).await {
        Ok(servers) => servers,
        Err(e) => {
            warn!(seed = %seed, error = %e, "cluster: roster fetch failed");
            return;
        }
    };
    info!(seed = %seed, count = servers.len(), "cluster: roster fetched");

    let self_addr = hub.server().addr.to_string();
    for server in servers {
        if server.addr == self_addr {
            continue;
        }
        match connect_server_peer(hub, &config.peer, &server).await {
            Ok(()) => info!(server = %server.addr, "cluster: connected"),
            Err(e) => warn!(server = %server.addr, error = %e, "cluster: dial failed"),
        }
    }
}

async fn fetch_servers(seed: &str) -> Result<Vec<ServerEntry>, HubError> {
    let url = format!("{}/q/servers", seed.trim_end_matches('/'));
    let servers = reqwest::get(&url)
        .await?
        .error_for_status()?
        .json::<Vec<ServerEntry>>()
        .await?;
    Ok(servers)
}

/// Dial one mesh peer's advertised server URL, authenticate, and
/// register the connection with the dispatcher.
pub async fn connect_server_peer(
    hub: &HubHandle,
    peer_cfg: &PeerConfig,
    server: &ServerEntry,
) -> Result<(), HubError> {
    let info = hub.server();
    let addr: Addr = server.addr.parse()?;

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(info.addr.to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(info.server_token.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let url = format!(
        "{}/server?addr={}&nonce={}&digest={}&client_url={}&server_url={}",
        server.server_url.trim_end_matches('/'),
        info.addr,
        nonce,
        digest,
        info.client_url,
        info.server_url,
    );
    let (socket, _response) = tokio_tungstenite::connect_async(&url).await?;

    let peer = Peer::new(addr, &server.server_url, peer_cfg.clone());
    let handle = peer.handle();
    let listener = HubListener::new(PeerRole::Server, hub.clone(), handle.clone());
    let (sink, source) = split_outbound(socket);
    peer.start(sink, source, listener);

    hub.request(
        addr,
        PacketBody::AddServerPeer {
            handle,
            entry: server.clone(),
        },
    )
    .await?;
    Ok(())
}
