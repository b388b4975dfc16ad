use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::chain::provider::{LogEvent, LogFilter, SubscriptionTransport};
use crate::error::ReadError;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const LOG_BUFFER: usize = 256;

/// `eth_subscribe("logs")` over a WebSocket. Each subscription owns its own
/// connection, so one dropping never takes the others down.
pub struct WsTransport {
    url: String,
    chain_name: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, chain_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            chain_name: chain_name.into(),
        }
    }
}

#[async_trait]
impl SubscriptionTransport for WsTransport {
    async fn subscribe(&self, filter: &LogFilter) -> Result<BoxStream<'static, LogEvent>, ReadError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ReadError::Transient(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscribe",
            "params": ["logs", filter.to_value()],
            "id": 1
        });
        write
            .send(Message::Text(subscribe_msg.to_string().into()))
            .await
            .map_err(|e| ReadError::Transient(e.to_string()))?;

        let sub_id = read_subscription_id(&mut read)
            .await
            .map_err(|e| ReadError::Transient(e.to_string()))?;

        info!(
            chain = %self.chain_name,
            contract = %filter.address,
            event = %filter.event,
            sub_id = %sub_id,
            "log subscription active"
        );

        let (tx, mut rx) = mpsc::channel(LOG_BUFFER);
        let chain_name = self.chain_name.clone();
        tokio::spawn(async move {
            match forward_notifications(&sub_id, &mut read, &mut write, &tx).await {
                Ok(()) => debug!(chain = %chain_name, sub_id = %sub_id, "log subscription ended"),
                Err(e) => warn!(chain = %chain_name, sub_id = %sub_id, error = %e, "log subscription failed"),
            }
        });

        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(stream.boxed())
    }
}

/// Wait for the eth_subscribe response and extract the subscription ID.
pub(crate) async fn read_subscription_id<S>(read: &mut S) -> anyhow::Result<String>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let parsed: Value = serde_json::from_str(&text)?;
                if parsed.get("id") == Some(&Value::Number(1.into())) {
                    if let Some(result) = parsed.get("result") {
                        let sub_id = result.as_str().unwrap_or("").to_string();
                        if sub_id.is_empty() {
                            anyhow::bail!("empty subscription ID in response");
                        }
                        return Ok(sub_id);
                    } else if let Some(error) = parsed.get("error") {
                        anyhow::bail!("eth_subscribe failed: {}", error);
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                anyhow::bail!("node closed before subscription confirmed");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => anyhow::bail!("stream ended before subscription confirmed"),
            Err(_) => anyhow::bail!("timeout waiting for subscription confirmation"),
        }
    }
}

/// Forward `eth_subscription` log notifications into `tx` until the socket
/// closes or the receiving side goes away.
pub(crate) async fn forward_notifications<S, W>(
    sub_id: &str,
    read: &mut S,
    write: &mut W,
    tx: &mpsc::Sender<LogEvent>,
) -> anyhow::Result<()>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    W: SinkExt<Message> + Unpin,
{
    loop {
        let next = tokio::select! {
            next = read.next() => next,
            _ = tx.closed() => return Ok(()),
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to parse WS message");
                        continue;
                    }
                };

                if parsed.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                    continue;
                }
                let Some(params) = parsed.get("params") else {
                    continue;
                };
                if params.get("subscription").and_then(|s| s.as_str()) != Some(sub_id) {
                    continue;
                }
                let Some(log) = params.get("result").and_then(LogEvent::from_value) else {
                    warn!(sub_id, "log notification without a usable log");
                    continue;
                };

                trace!(sub_id, address = %log.address, block = ?log.block_number, "log received");
                if tx.send(log).await.is_err() {
                    return Ok(());
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                info!(sub_id, "WebSocket closed by node");
                return Ok(());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}
