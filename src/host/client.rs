use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::net::TcpStream;

use super::report::NO_RESULT;
use crate::protocol::{PacketType, REQUEST_DATA, REQUEST_SETTINGS, Session};

pub const CONNECT_ATTEMPTS: u32 = 50;
pub const CONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Everything the client side of one exchange sends
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub version: String,
    pub settings: Value,
    pub request: Value,
    pub timeout: Duration,
}

/// Final `{res, data}` plus any debug packets received on the way
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub code: i64,
    pub data: Value,
    pub debug: Vec<String>,
}

/// Client half of the wire protocol
pub trait ExchangeClient: Send + Sync {
    fn exchange(
        &self,
        host: &str,
        port: u16,
        exchange: &Exchange,
    ) -> impl Future<Output = Result<Outcome>> + Send;
}

#[derive(Debug, Clone)]
pub struct SctClient {
    attempts: u32,
    interval: Duration,
}

impl Default for SctClient {
    fn default() -> Self {
        Self {
            attempts: CONNECT_ATTEMPTS,
            interval: CONNECT_INTERVAL,
        }
    }
}

impl SctClient {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// A freshly started container needs a moment before it listens
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect((host, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.attempts => {
                    log::debug!("Connecting to {host}:{port} failed ({attempt}): {e}");
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to connect to {host}:{port} after {attempt} attempts")
                    });
                }
            }
        }
    }
}

impl ExchangeClient for SctClient {
    async fn exchange(&self, host: &str, port: u16, exchange: &Exchange) -> Result<Outcome> {
        let stream = self.connect(host, port).await?;
        let session = Session::new(stream, exchange.timeout);
        session
            .send_init(exchange.version.as_str())
            .await
            .context("Failed to send settings version")?;

        let mut debug = Vec::new();
        let outcome = loop {
            let packet = session.receive().await;
            match packet.packet_type {
                PacketType::Init => match packet.payload.as_text() {
                    Some(REQUEST_SETTINGS) => session.send_data(exchange.settings.clone()).await?,
                    Some(REQUEST_DATA) => session.send_data(exchange.request.clone()).await?,
                    other => bail!("Unexpected INIT request: {other:?}"),
                },
                PacketType::Debug => debug.push(packet.payload.to_text_lossy()),
                PacketType::Data => {
                    let data = packet.payload.into_json()?;
                    break Outcome {
                        code: data.get("res").and_then(Value::as_i64).unwrap_or(NO_RESULT),
                        data: data.get("data").cloned().unwrap_or(Value::Null),
                        debug,
                    };
                }
                PacketType::None => {
                    log::warn!("Container closed the connection without a result");
                    break Outcome {
                        code: NO_RESULT,
                        data: Value::Null,
                        debug,
                    };
                }
            }
        };

        session.close().await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_IO_TIMEOUT;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn exchange() -> Exchange {
        Exchange {
            version: "v1".to_string(),
            settings: json!({"exec": {"run": true}}),
            request: json!({"code": "print('hi')"}),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_client_answers_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let session = Session::new(stream, DEFAULT_IO_TIMEOUT);
            let version = session.expect(PacketType::Init).await.unwrap();
            assert_eq!(version.as_text(), Some("v1"));

            session.send_init(REQUEST_SETTINGS).await.unwrap();
            let settings = session.expect(PacketType::Data).await.unwrap();
            session.send_debug("settings v1 loaded").await.unwrap();
            session.send_init(REQUEST_DATA).await.unwrap();
            let request = session.expect(PacketType::Data).await.unwrap();
            session
                .finish(&crate::protocol::Packet::new(
                    PacketType::Data,
                    json!({"res": 0, "data": {"echo": [settings.into_json().unwrap(), request.into_json().unwrap()]}}),
                ))
                .await
                .unwrap();
        });

        let outcome = SctClient::default()
            .exchange("127.0.0.1", port, &exchange())
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(outcome.code, 0);
        assert_eq!(outcome.debug, vec!["settings v1 loaded".to_string()]);
        assert_eq!(
            outcome.data,
            json!({"echo": [{"exec": {"run": true}}, {"code": "print('hi')"}]})
        );
    }

    #[tokio::test]
    async fn test_closed_without_result() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let session = Session::new(stream, DEFAULT_IO_TIMEOUT);
            session.expect(PacketType::Init).await.unwrap();
        });

        let outcome = SctClient::default()
            .exchange("127.0.0.1", port, &exchange())
            .await
            .unwrap();
        assert_eq!(outcome.code, NO_RESULT);
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SctClient::new(3, Duration::from_millis(10));
        assert!(client.exchange("127.0.0.1", port, &exchange()).await.is_err());
    }
}
