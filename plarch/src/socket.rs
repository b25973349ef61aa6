//! # The signaling transport
//!
//! A thin WebSocket client behind an [`EventLoop<SocketIn, SocketOut>`].
//! The transport never reconnects on its own: when the connection is lost
//! it reports [`SocketOut::Closed`] with the server's close reason (if any)
//! and waits for the next [`SocketIn::Connect`]. Reconnect policy lives in
//! the layer above.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::{
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use crate::event_loop::{EventHandler, EventLoop};

pub type SocketLoop = EventLoop<SocketIn, SocketOut>;

/// Creates a fresh, not-yet-connected transport for the given URL.
pub type SocketSpawner =
    Box<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<SocketLoop>> + Send + Sync>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Commands for the transport.
pub enum SocketIn {
    /// Open (or re-open) the connection.
    Connect,
    /// Send a text frame. Dropped with a warning if the socket is closed.
    Send(String),
    /// Close the connection; no further frames are sent afterwards.
    Disconnect,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Events reported by the transport.
pub enum SocketOut {
    /// The connection is open.
    Connected,
    /// A text frame arrived.
    Message(String),
    /// The connection is gone, with the server's close reason if it sent one.
    Closed(Option<String>),
    /// Something went wrong; usually followed by `Closed`.
    Error(String),
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The default transport, backed by tokio-tungstenite.
pub struct SocketClient {
    url: String,
    write: Option<WsSink>,
    event_loop: SocketLoop,
    // Bumped on every connect/disconnect so a stale reader task can tell
    // its events are no longer wanted.
    generation: Arc<AtomicU32>,
}

impl SocketClient {
    /// Builds the transport loop. The socket stays closed until a
    /// [`SocketIn::Connect`] arrives.
    pub fn start(url: String) -> anyhow::Result<SocketLoop> {
        let event_loop = EventLoop::new();
        let client = SocketClient {
            url,
            write: None,
            event_loop: event_loop.clone(),
            generation: Arc::new(AtomicU32::new(0)),
        };
        event_loop.add_handler(Box::new(client))?;
        Ok(event_loop)
    }

    /// A [`SocketSpawner`] producing [`SocketClient`] transports.
    pub fn spawner() -> SocketSpawner {
        Box::new(|url| Box::pin(async move { SocketClient::start(url) }))
    }

    fn listen(&mut self, mut read: WsSource) {
        let event_loop = self.event_loop.clone();
        let generation = Arc::clone(&self.generation);
        let current = generation.load(Ordering::Relaxed);
        let report = move |event_loop: &SocketLoop, msg: SocketOut| {
            if generation.load(Ordering::Relaxed) == current {
                event_loop
                    .post_out(msg)
                    .err()
                    .map(|e| log::warn!("Socket event queued but not processed: {e:?}"));
            }
        };
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(tungstenite::Message::Text(text)) => {
                        report(&event_loop, SocketOut::Message(text.to_string()));
                    }
                    Ok(tungstenite::Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        report(&event_loop, SocketOut::Closed(reason));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        report(&event_loop, SocketOut::Error(e.to_string()));
                        report(&event_loop, SocketOut::Closed(None));
                        return;
                    }
                }
            }
            report(&event_loop, SocketOut::Closed(None));
        });
    }

    async fn connect_ws(&mut self) -> Vec<SocketOut> {
        self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(mut write) = self.write.take() {
            write.close().await.err().map(|e| {
                log::warn!("While closing the previous connection: {e:?}");
            });
        }
        log::debug!("Connecting to websocket at {}", self.url);
        match connect_async(self.url.clone()).await {
            Ok((websocket, _)) => {
                let (write, read) = websocket.split();
                self.write = Some(write);
                self.listen(read);
                vec![SocketOut::Connected]
            }
            Err(e) => {
                log::debug!("Couldn't connect to {}: {e}", self.url);
                vec![
                    SocketOut::Error(e.to_string()),
                    SocketOut::Closed(None),
                ]
            }
        }
    }

    async fn send(&mut self, text: String) -> Vec<SocketOut> {
        let Some(write) = self.write.as_mut() else {
            log::warn!("Tried to write a message to a closed connection");
            return vec![];
        };
        if let Err(e) = write.send(tungstenite::Message::text(text)).await {
            self.write = None;
            self.generation.fetch_add(1, Ordering::Relaxed);
            return vec![
                SocketOut::Error(e.to_string()),
                SocketOut::Closed(None),
            ];
        }
        vec![]
    }

    async fn disconnect(&mut self) -> Vec<SocketOut> {
        self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(mut write) = self.write.take() {
            write
                .close()
                .await
                .err()
                .map(|e| log::debug!("While closing connection: {e:?}"));
        } else {
            log::debug!("Disconnect on an already closed connection");
        }
        vec![SocketOut::Closed(None)]
    }
}

#[async_trait]
impl EventHandler<SocketIn, SocketOut> for SocketClient {
    async fn events(&mut self, inputs: Vec<SocketIn>) -> Vec<SocketOut> {
        let mut out = vec![];
        for msg in inputs {
            out.extend(match msg {
                SocketIn::Connect => self.connect_ws().await,
                SocketIn::Send(text) => self.send(text).await,
                SocketIn::Disconnect => self.disconnect().await,
            });
        }
        out
    }
}
