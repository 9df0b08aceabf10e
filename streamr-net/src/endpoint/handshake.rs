// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symmetric WebSocket upgrade handshake.
//!
//! Both directions carry the same identity material: the dialer appends its
//! advertised URL as an `address` query parameter and sends its peer id and
//! type as headers; the acceptor echoes its own id and type back on the
//! upgrade response.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use http::header::HeaderValue;
use http::HeaderMap;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::peer::{PeerInfo, PeerType};

use super::EndpointError;

pub const PEER_ID_HEADER: &str = "streamr-peer-id";
pub const PEER_TYPE_HEADER: &str = "streamr-peer-type";
pub const ADDRESS_QUERY_PARAM: &str = "address";

/// Identity material read from an incoming upgrade request.
///
/// Fields stay `None` when the dialer omitted them; the caller decides how
/// to reject.
#[derive(Debug, Default)]
pub(crate) struct IncomingHandshake {
    pub address: Option<String>,
    pub peer: Option<PeerInfo>,
}

pub(crate) type HandshakeSlot = Arc<Mutex<Option<IncomingHandshake>>>;

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, EndpointError> {
    HeaderValue::from_str(value)
        .map_err(|_| EndpointError::Transport(format!("value is not header-safe: {value}")))
}

/// Build the upgrade request for an outbound connection.
pub(crate) fn client_request(
    peer_url: &str,
    own_url: &str,
    own: &PeerInfo,
) -> Result<ClientRequest, EndpointError> {
    let separator = if peer_url.contains('?') { '&' } else { '?' };
    let url = format!("{peer_url}{separator}{ADDRESS_QUERY_PARAM}={own_url}");
    let mut request = url
        .into_client_request()
        .map_err(|err| EndpointError::Transport(err.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(PEER_ID_HEADER, header_value(&own.peer_id)?);
    headers.insert(PEER_TYPE_HEADER, header_value(own.peer_type.as_str())?);
    Ok(request)
}

/// Read the remote identity from a set of upgrade headers.
pub(crate) fn remote_peer(headers: &HeaderMap) -> Option<PeerInfo> {
    let peer_id = headers.get(PEER_ID_HEADER)?.to_str().ok()?;
    let peer_type = headers.get(PEER_TYPE_HEADER)?.to_str().ok()?;
    let peer_type = PeerType::from_str(peer_type).ok()?;
    Some(PeerInfo::new(peer_id, peer_type))
}

/// Upgrade callback for incoming connections.
///
/// Always completes the upgrade with our identity headers attached; missing
/// dialer parameters are recorded in the slot and rejected afterwards with a
/// proper close code, since an HTTP-level rejection carries none.
pub(crate) fn server_callback(
    own: PeerInfo,
    slot: HandshakeSlot,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> {
    move |request, mut response| {
        let address = request
            .uri()
            .query()
            .and_then(|query| query_param(query, ADDRESS_QUERY_PARAM));
        let peer = remote_peer(request.headers());
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(IncomingHandshake { address, peer });
        }

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&own.peer_id) {
            headers.insert(PEER_ID_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(own.peer_type.as_str()) {
            headers.insert(PEER_TYPE_HEADER, value);
        }
        Ok(response)
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use crate::peer::{PeerInfo, PeerType};

    use super::{client_request, query_param, remote_peer, PEER_ID_HEADER, PEER_TYPE_HEADER};

    #[test]
    fn client_request_carries_identity() {
        let own = PeerInfo::node("node-1");
        let request =
            client_request("ws://127.0.0.1:36000", "ws://127.0.0.1:36001", &own).unwrap();
        assert_eq!(
            request.uri().query(),
            Some("address=ws://127.0.0.1:36001")
        );
        assert_eq!(request.headers()[PEER_ID_HEADER], "node-1");
        assert_eq!(request.headers()[PEER_TYPE_HEADER], "node");
    }

    #[test]
    fn remote_peer_requires_both_headers() {
        let own = PeerInfo::tracker("tracker-1");
        let request = client_request("ws://127.0.0.1:36000", "ws://127.0.0.1:36001", &own).unwrap();
        let peer = remote_peer(request.headers()).unwrap();
        assert_eq!(peer.peer_id, "tracker-1");
        assert_eq!(peer.peer_type, PeerType::Tracker);

        let mut headers = request.headers().clone();
        headers.remove(PEER_TYPE_HEADER);
        assert!(remote_peer(&headers).is_none());
    }

    #[test]
    fn query_param_ignores_other_pairs() {
        assert_eq!(
            query_param("x=1&address=ws://a:1&y=2", "address"),
            Some("ws://a:1".to_string())
        );
        assert_eq!(query_param("x=1&address=", "address"), None);
        assert_eq!(query_param("x=1", "address"), None);
    }
}
