//! In-process ticker gateway for integration tests.
//!
//! Accepts WebSocket connections on a random local port, records the
//! request URIs and text frames it receives, and pushes binary frames or
//! closes to every live connection on demand.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Instruction for live gateway connections.
#[derive(Debug, Clone)]
enum Push {
    Binary(Vec<u8>),
    Close,
}

/// Mock ticker gateway.
pub struct MockGateway {
    addr: SocketAddr,
    uris: Arc<Mutex<Vec<String>>>,
    texts: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    push: broadcast::Sender<Push>,
    task: JoinHandle<()>,
}

impl MockGateway {
    /// Bind to a random port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uris = Arc::new(Mutex::new(Vec::new()));
        let texts = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (push, _) = broadcast::channel(64);

        let task = tokio::spawn({
            let uris = Arc::clone(&uris);
            let texts = Arc::clone(&texts);
            let accepted = Arc::clone(&accepted);
            let push = push.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    // Subscribe before the handshake so nothing pushed after
                    // the client's connect resolves is missed.
                    let pushes = push.subscribe();
                    tokio::spawn(serve(
                        stream,
                        pushes,
                        Arc::clone(&uris),
                        Arc::clone(&texts),
                        Arc::clone(&accepted),
                    ));
                }
            }
        });

        Self {
            addr,
            uris,
            texts,
            accepted,
            push,
            task,
        }
    }

    /// Base URL for the client.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Number of completed handshakes.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Request URIs in handshake order.
    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }

    /// Text frames received from clients.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    /// Send a binary frame to every live connection.
    pub fn send_binary(&self, frame: Vec<u8>) {
        let _ = self.push.send(Push::Binary(frame));
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        let _ = self.push.send(Push::Close);
    }

    /// Wait until `n` handshakes have completed.
    pub async fn wait_accepted(&self, n: usize) {
        wait_until(|| self.accepted() >= n).await;
    }

    /// Wait until `n` text frames have arrived.
    pub async fn wait_texts(&self, n: usize) -> Vec<String> {
        wait_until(|| self.texts.lock().len() >= n).await;
        self.texts()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    mut pushes: broadcast::Receiver<Push>,
    uris: Arc<Mutex<Vec<String>>>,
    texts: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
) {
    let record_uri = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uris.lock().push(request.uri().to_string());
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record_uri).await else {
        return;
    };
    accepted.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(Push::Binary(frame)) => {
                    if write.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => texts.lock().push(text.to_string()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Poll a condition for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Single-packet ltp frame.
pub fn ltp_frame(token: u32, price: f32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(11);
    frame.extend_from_slice(&1_u16.to_be_bytes());
    frame.extend_from_slice(&token.to_be_bytes());
    frame.push(0);
    frame.extend_from_slice(&price.to_be_bytes());
    frame
}

/// An unused local port: bound, then released.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/")
}
