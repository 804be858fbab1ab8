//! Dialing glue around `tokio-tungstenite`. TLS comes from the native-tls
//! feature; certificates, proxies and auth headers beyond plain `key:value`
//! pairs are out of scope here.

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct Connector {
    url: String,
    headers: Vec<(String, String)>,
}

impl Connector {
    pub fn new(url: String, headers: Vec<(String, String)>) -> Self {
        Self { url, headers }
    }

    pub async fn connect(&self) -> Result<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("invalid connect url")?;

        for (key, value) in &self.headers {
            let name = HeaderName::try_from(key.as_str())
                .with_context(|| format!("invalid header name: {key}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {key}"))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await.context("dial error")?;
        Ok(stream)
    }
}
