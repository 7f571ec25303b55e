use crate::adapter::AdapterError;

use bytes::Bytes;
use fastwebsockets::FragmentCollector;
use http_body_util::Empty;
use hyper::{
    Request,
    header::{CONNECTION, UPGRADE},
    upgrade::Upgraded,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
};
use url::Url;

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected trade stream after TLS and websocket upgrade.
pub type WsStream = FragmentCollector<TokioIo<Upgraded>>;

static TLS: LazyLock<TlsConnector> = LazyLock::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
});

/// Dials `url` and upgrades it to a websocket. `expected_domain` pins the
/// host the caller intends to reach; a URL naming any other host is refused
/// before a socket is opened.
pub async fn connect_ws(expected_domain: &str, url: &str) -> Result<WsStream, AdapterError> {
    let endpoint = Endpoint::parse(url, expected_domain)?;

    let tcp = timed("TCP connect", TCP_CONNECT_TIMEOUT, dial_tcp(&endpoint)).await?;
    let tls = timed("TLS handshake", TLS_HANDSHAKE_TIMEOUT, shake_tls(&endpoint, tcp)).await?;
    timed("websocket upgrade", WS_UPGRADE_TIMEOUT, upgrade(&endpoint, tls)).await
}

/// Validated pieces of a stream URL. Both endpoint families are TLS-only,
/// so anything but `wss` is rejected up front.
struct Endpoint {
    host: String,
    port: u16,
    path_and_query: String,
}

impl Endpoint {
    fn parse(url: &str, expected_domain: &str) -> Result<Self, AdapterError> {
        let parsed = Url::parse(url)
            .map_err(|e| AdapterError::InvalidRequest(format!("bad websocket url '{url}': {e}")))?;

        if parsed.scheme() != "wss" {
            return Err(AdapterError::InvalidRequest(format!(
                "websocket url '{url}' must use wss"
            )));
        }

        let host = parsed.host_str().ok_or_else(|| {
            AdapterError::InvalidRequest(format!("websocket url '{url}' has no host"))
        })?;
        if !host.eq_ignore_ascii_case(expected_domain) {
            return Err(AdapterError::InvalidRequest(format!(
                "websocket url host '{host}' does not match endpoint domain '{expected_domain}'"
            )));
        }

        let mut path_and_query = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }

        Ok(Self {
            host: host.to_string(),
            port: parsed.port().unwrap_or(443),
            path_and_query,
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn host_header(&self) -> String {
        // The spot stream sits on 9443; the header must carry it.
        if self.port == 443 {
            self.host.clone()
        } else {
            self.addr()
        }
    }
}

async fn timed<T, F>(phase: &str, limit: Duration, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AdapterError::WebsocketError(format!("{phase} timed out after {limit:?}")))?
}

async fn dial_tcp(endpoint: &Endpoint) -> Result<TcpStream, AdapterError> {
    let addr = endpoint.addr();
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| AdapterError::WebsocketError(format!("TCP connect to {addr} failed: {e}")))?;

    // Trade frames are tiny; Nagle only adds latency here.
    tcp.set_nodelay(true)
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    Ok(tcp)
}

async fn shake_tls(
    endpoint: &Endpoint,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, AdapterError> {
    let server_name = ServerName::try_from(endpoint.host.as_str()).map_err(|_| {
        AdapterError::InvalidRequest(format!(
            "'{}' is not a valid TLS server name",
            endpoint.host
        ))
    })?;

    TLS.connect(server_name, tcp).await.map_err(|e| {
        AdapterError::WebsocketError(format!("TLS handshake with {} failed: {e}", endpoint.host))
    })
}

async fn upgrade<S>(endpoint: &Endpoint, stream: S) -> Result<WsStream, AdapterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let request: Request<Empty<Bytes>> = Request::builder()
        .method("GET")
        .uri(&endpoint.path_and_query)
        .header("Host", endpoint.host_header())
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(
            "Sec-WebSocket-Key",
            fastwebsockets::handshake::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .body(Empty::<Bytes>::new())
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    let (ws, _) = fastwebsockets::handshake::client(&TokioExecutor::new(), request, stream)
        .await
        .map_err(|e| AdapterError::WebsocketError(format!("websocket upgrade failed: {e}")))?;

    Ok(FragmentCollector::new(ws))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_pins_the_expected_host() {
        let endpoint = Endpoint::parse(
            "wss://stream.binance.com:9443/ws/btcusdt@aggTrade",
            "stream.binance.com",
        )
        .expect("endpoint parses");
        assert_eq!(endpoint.port, 9443);
        assert_eq!(endpoint.addr(), "stream.binance.com:9443");
        assert_eq!(endpoint.host_header(), "stream.binance.com:9443");
        assert_eq!(endpoint.path_and_query, "/ws/btcusdt@aggTrade");

        let mismatch = Endpoint::parse(
            "wss://stream.binance.com/ws/btcusdt@aggTrade",
            "fstream.binance.com",
        );
        assert!(matches!(mismatch, Err(AdapterError::InvalidRequest(_))));
    }

    #[test]
    fn endpoint_parse_requires_wss() {
        let plain = Endpoint::parse(
            "ws://stream.binance.com/ws/btcusdt@aggTrade",
            "stream.binance.com",
        );
        assert!(matches!(plain, Err(AdapterError::InvalidRequest(_))));

        let https = Endpoint::parse(
            "https://stream.binance.com/ws/btcusdt@aggTrade",
            "stream.binance.com",
        );
        assert!(matches!(https, Err(AdapterError::InvalidRequest(_))));
    }

    #[test]
    fn default_port_is_elided_from_host_header() {
        let endpoint = Endpoint::parse(
            "wss://fstream.binance.com/ws/btcusdt@aggTrade",
            "fstream.binance.com",
        )
        .expect("endpoint parses");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.host_header(), "fstream.binance.com");
    }
}
