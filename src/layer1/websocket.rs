// WebSocket Socket Task - one raw Binance stream per task
// Forwards text frames, answers server pings, pings on command and reports
// every lifecycle transition back to the owning product worker.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::core::types::SocketKind;
use crate::layer1::connection::{SocketCommand, SocketEvent, SocketHandle, SocketMessage, StreamConnector};

/// Raw stream URL, e.g. `wss://stream.binance.com:9443/ws/btcusdt@depth`
pub fn stream_url(ws_base_url: &str, symbol: &str, kind: SocketKind) -> String {
    format!(
        "{}/{}@{}",
        ws_base_url.trim_end_matches('/'),
        symbol.to_lowercase(),
        kind.stream_suffix()
    )
}

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl StreamConnector for TungsteniteConnector {
    fn open(
        &self,
        url: &str,
        kind: SocketKind,
        generation: u64,
        events: mpsc::UnboundedSender<SocketMessage>,
    ) -> SocketHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let url = url.to_string();

        tokio::spawn(async move {
            run_socket(url, kind, generation, events, cmd_rx).await;
        });

        SocketHandle::new(kind, generation, cmd_tx)
    }
}

/// Connect once and pump the socket until it closes or is told to close.
/// There is no reconnect here; the product worker decides what to do.
async fn run_socket(
    url: String,
    kind: SocketKind,
    generation: u64,
    events: mpsc::UnboundedSender<SocketMessage>,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(SocketMessage { generation, kind, event });
    };

    debug!(url = %url, socket = %kind, generation = generation, "Connecting to WebSocket");

    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    warn!(url = %url, socket = %kind, error = %e, "WebSocket connect failed");
                    emit(SocketEvent::Error(e.to_string()));
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                // nothing to ping yet
                Some(SocketCommand::Ping) => continue,
                Some(SocketCommand::Close) | None => {
                    debug!(socket = %kind, generation = generation, "Superseded before connect");
                    return;
                }
            }
        }
    };

    info!(url = %url, socket = %kind, generation = generation, "WebSocket connected");
    emit(SocketEvent::Opened);

    let (mut write, mut read) = ws_stream.split();
    let mut message_count: u64 = 0;

    loop {
        tokio::select! {
            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        message_count += 1;
                        emit(SocketEvent::Frame(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(socket = %kind, bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(socket = %kind, error = %e, "Pong reply failed");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        emit(SocketEvent::Pong);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                        info!(socket = %kind, generation = generation, reason = ?reason, "WebSocket closed by server");
                        emit(SocketEvent::Closed(reason));
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!(socket = %kind, generation = generation, error = %e, "WebSocket error");
                        emit(SocketEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        info!(socket = %kind, generation = generation, "WebSocket stream ended");
                        emit(SocketEvent::Closed(None));
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Ping) => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(socket = %kind, error = %e, "Ping failed");
                            emit(SocketEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(SocketCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        emit(SocketEvent::Closed(Some("closed by client".to_string())));
                        break;
                    }
                }
            }
        }
    }

    debug!(socket = %kind, generation = generation, messages = message_count, "WebSocket task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        assert_eq!(
            stream_url("wss://stream.binance.com:9443/ws", "BTCUSDT", SocketKind::Depth),
            "wss://stream.binance.com:9443/ws/btcusdt@depth"
        );
        assert_eq!(
            stream_url("wss://stream.binance.com:9443/ws/", "ETHBTC", SocketKind::Trade),
            "wss://stream.binance.com:9443/ws/ethbtc@trade"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TungsteniteConnector.open("ws://127.0.0.1:1/ws/btcusdt@depth", SocketKind::Depth, 7, tx);
        assert_eq!(handle.generation, 7);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.generation, 7);
        assert_eq!(msg.kind, SocketKind::Depth);
        assert!(matches!(msg.event, SocketEvent::Error(_)));
    }
}
