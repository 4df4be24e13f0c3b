//! WebSocket accept loop
//!
//! Accepts TCP connections, performs the WebSocket upgrade, and hands
//! each upgraded socket to a connection adapter. Authentication itself
//! is an external concern; the upstream proxy is expected to have
//! authenticated the request and stamped the user's id into the
//! `x-user-id` header, which is all this layer reads.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::run_connection;
use crate::hub::Hub;
use crate::store::{MembershipChecker, MessageStore};

/// Header carrying the authenticated user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Accept connections until the listener fails.
pub async fn run(
    listener: TcpListener,
    hub: Hub,
    store: Arc<dyn MessageStore>,
    checker: Arc<dyn MembershipChecker>,
    config: Config,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "accepting connections");

    loop {
        let (stream, addr) = listener.accept().await?;
        let hub = hub.clone();
        let store = store.clone();
        let checker = checker.clone();
        let config = config.clone();

        tokio::spawn(async move {
            handle_socket(stream, addr, hub, store, checker, config).await;
        });
    }
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Hub,
    store: Arc<dyn MessageStore>,
    checker: Arc<dyn MembershipChecker>,
    config: Config,
) {
    let mut user_id = None;
    let callback = |request: &Request, response: Response| {
        match identity_from(request) {
            Some(id) => {
                user_id = Some(id);
                Ok(response)
            }
            None => {
                let mut rejection =
                    ErrorResponse::new(Some("missing or invalid x-user-id header".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    // Bound frame buffering at the transport so an oversized frame
    // fails the read instead of being fully buffered first. This also
    // covers binary frames, which never reach the envelope layer.
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_frame_size))
        .max_frame_size(Some(config.max_frame_size));

    let socket = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    let Some(user_id) = user_id else {
        return;
    };

    debug!(%addr, %user_id, "connection upgraded");
    run_connection(socket, user_id, hub, store, checker, config).await;
}

fn identity_from(request: &Request) -> Option<Uuid> {
    request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
}
