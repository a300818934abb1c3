// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Line-oriented TCP connections. One task accepts; each connection gets a task which feeds
//! lines to the session registry and writes whatever the scheduler sends back.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use stunt_kernel::tasks::sessions::{SessionId, SessionRegistry, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

/// Longest input line accepted before the connection is dropped.
const MAX_LINE_LENGTH: usize = 64 * 1024;

enum Outbound {
    Line(String),
    Close,
}

/// The scheduler's side of a connection. Sends never block; the connection task does the
/// actual writing.
pub struct TcpTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    peer: SocketAddr,
}

impl Transport for TcpTransport {
    fn send(&mut self, line: &str) -> Result<(), std::io::Error> {
        self.outbound
            .send(Outbound::Line(line.to_string()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection is gone"))
    }

    fn peer_name(&self) -> String {
        self.peer.to_string()
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(address: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until `terminate` changes, then wait for every connection task.
    pub async fn run(self, sessions: Arc<SessionRegistry>, terminate: watch::Receiver<bool>) {
        info!(address = ?self.listener.local_addr().ok(), "Listening for connections");
        let mut connections = JoinSet::new();
        let mut term_receive = terminate.clone();
        loop {
            select! {
                _ = term_receive.changed() => {
                    info!("Listener terminated, stopping...");
                    break;
                }
                Some(_) = connections.join_next() => {}
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(?peer, "Accepted connection");
                            connections.spawn(handle_accepted_connection(
                                stream,
                                peer,
                                sessions.clone(),
                                terminate.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(?e, "Accept failed");
                        }
                    }
                }
            }
        }
        while connections.join_next().await.is_some() {}
        info!("Listener stopped");
    }
}

async fn handle_accepted_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<SessionRegistry>,
    mut terminate: watch::Receiver<bool>,
) {
    let (outbound_send, outbound) = mpsc::unbounded_channel();
    let session_id = sessions
        .open(Box::new(TcpTransport {
            outbound: outbound_send,
            peer,
        }))
        .id();
    let framed_stream = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (write, read) = framed_stream.split();
    let mut connection = LineConnection {
        session_id,
        write,
        read,
        outbound,
    };
    if let Err(e) = connection.run(&sessions, &mut terminate).await {
        debug!(session = session_id, ?e, "Connection failed");
    }
    sessions.request_disconnect(session_id);
}

struct LineConnection {
    session_id: SessionId,
    write: SplitSink<Framed<TcpStream, LinesCodec>, String>,
    read: SplitStream<Framed<TcpStream, LinesCodec>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl LineConnection {
    async fn run(
        &mut self,
        sessions: &SessionRegistry,
        terminate: &mut watch::Receiver<bool>,
    ) -> Result<(), LinesCodecError> {
        loop {
            select! {
                // Output already queued goes out before anything else is looked at.
                biased;
                Some(outbound) = self.outbound.recv() => {
                    match outbound {
                        Outbound::Line(line) => self.write.send(line).await?,
                        Outbound::Close => {
                            self.write.close().await?;
                            return Ok(());
                        }
                    }
                }
                _ = terminate.changed() => {
                    return Ok(());
                }
                line = self.read.next() => {
                    let Some(line) = line else {
                        debug!(session = self.session_id, "Connection closed by peer");
                        return Ok(());
                    };
                    if !sessions.push_input(self.session_id, line?) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use stunt_kernel::config::NetworkConfig;
    use stunt_kernel::tasks::sessions::CloseReason;

    async fn wait_for(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out");
    }

    async fn start() -> (
        Arc<SessionRegistry>,
        Framed<TcpStream, LinesCodec>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let sessions = Arc::new(SessionRegistry::new(&NetworkConfig::default()));
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (terminate_send, terminate_receive) = watch::channel(false);
        let listen_loop = tokio::spawn(listener.run(sessions.clone(), terminate_receive));
        let client = Framed::new(TcpStream::connect(address).await.unwrap(), LinesCodec::new());
        (sessions, client, terminate_send, listen_loop)
    }

    #[tokio::test]
    async fn test_lines_reach_registry_and_eof_disconnects() {
        let (sessions, mut client, terminate, listen_loop) = start().await;
        client.send("string_hash(\"abc\")".to_string()).await.unwrap();

        let mut input = vec![];
        wait_for(|| {
            input.extend(sessions.take_input());
            !input.is_empty()
        })
        .await;
        let (session_id, line) = input.remove(0);
        assert_eq!(line, "string_hash(\"abc\")");

        let handle = sessions.get(session_id).unwrap();
        assert!(handle.send("=> 1").is_ok());
        assert_eq!(client.next().await.unwrap().unwrap(), "=> 1");

        drop(client);
        wait_for(|| handle.is_disconnect_requested()).await;

        terminate.send(true).unwrap();
        listen_loop.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_output_then_hangs_up() {
        let (sessions, mut client, terminate, listen_loop) = start().await;
        wait_for(|| !sessions.is_empty()).await;

        sessions.broadcast("*** Shutting down: bye ***");
        assert_eq!(sessions.close_all(CloseReason::Shutdown), 0);
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            "*** Shutting down: bye ***"
        );
        assert!(client.next().await.is_none());
        assert!(sessions.is_empty());

        terminate.send(true).unwrap();
        listen_loop.await.unwrap();
    }
}
