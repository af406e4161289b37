//! Streaming Price Subscription
//!
//! Maintains a websocket ticker subscription for one market and publishes
//! the latest trade price on a watch channel. The connection is re-dialed
//! forever with a 5 s backoff; the task exits once every receiver is gone.

use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WS_URL: &str = "wss://api.upbit.com/websocket/v1";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TickerFrame {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    trade_price: Option<Decimal>,
}

pub(crate) fn spawn_price_stream(market: String) -> watch::Receiver<Option<Decimal>> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        while !tx.is_closed() {
            match connect_async(WS_URL).await {
                Ok((mut stream, _)) => {
                    let subscribe = serde_json::json!([
                        { "ticket": Uuid::new_v4().to_string() },
                        { "type": "ticker", "codes": [market.as_str()], "isOnlyRealtime": true },
                    ]);

                    if let Err(e) = stream.send(Message::Text(subscribe.to_string())).await {
                        warn!("price stream subscribe failed for {}: {}", market, e);
                    } else {
                        info!("price stream connected for {}", market);

                        while let Some(frame) = stream.next().await {
                            if tx.is_closed() {
                                return;
                            }
                            let payload = match frame {
                                Ok(Message::Text(text)) => text.into_bytes(),
                                Ok(Message::Binary(bytes)) => bytes,
                                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                                Ok(Message::Close(_)) => break,
                                Ok(_) => continue,
                                Err(e) => {
                                    warn!("price stream error for {}: {}", market, e);
                                    break;
                                }
                            };

                            match serde_json::from_slice::<TickerFrame>(&payload) {
                                Ok(TickerFrame {
                                    trade_price: Some(price),
                                }) => {
                                    let _ = tx.send(Some(price));
                                }
                                Ok(_) => {}
                                Err(e) => debug!("unparsable ticker frame: {}", e),
                            }
                        }

                        warn!("price stream for {} disconnected, reconnecting", market);
                    }
                }
                Err(e) => warn!("price stream connect failed for {}: {}", market, e),
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });

    rx
}
