use crate::server::{
    session::{Flow, Session},
    telemetry::increment_connections,
};
use core::time::Duration;
use futures::StreamExt;
use pawnstorm_core::{Result, codec::MessageCodec, engine::SearchEngine};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Why [`Worker::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The shutdown token was cancelled from outside.
    Shutdown,
    /// The orchestrator sent `exit`.
    ExitRequested,
}

/// Accept loop around a single [`Session`].
///
/// Connections are served strictly one after another. The session, and with
/// it the engine and the mirrored game, is shared by all of them.
pub struct Worker<E> {
    session: Session<E>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
}

impl<E: SearchEngine> Worker<E> {
    pub fn new(engine: E, max_frame_bytes: usize, shutdown: CancellationToken) -> Self {
        Self {
            session: Session::new(engine),
            max_frame_bytes,
            shutdown,
        }
    }

    pub const fn session(&self) -> &Session<E> {
        &self.session
    }

    pub fn into_engine(self) -> E {
        self.session.into_engine()
    }

    /// Serves connections until the token is cancelled or a peer sends
    /// `exit`. On `exit` the token is cancelled too, so sibling tasks such as
    /// the heartbeat wind down with the server.
    pub async fn serve(&mut self, listener: &TcpListener) -> Result<ServeExit> {
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(ServeExit::Shutdown),
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            increment_connections();
            tracing::info!(%peer, "Orchestrator connected");

            match self.serve_connection(stream).await {
                Ok(Flow::Exit) => {
                    tracing::info!(%peer, "Exit requested");
                    self.shutdown.cancel();
                    return Ok(ServeExit::ExitRequested);
                }
                Ok(_) => tracing::info!(%peer, "Connection closed"),
                Err(e) => tracing::warn!(%peer, "Connection failed: {e}"),
            }
        }
    }

    async fn serve_connection(&mut self, stream: TcpStream) -> Result<Flow> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Unable to set TCP_NODELAY: {e}");
        }
        let mut framed = Framed::new(stream, MessageCodec::new(self.max_frame_bytes));

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(Flow::Close),
                next = framed.next() => next,
            };

            let flow = match next {
                // Peer hung up.
                None => Flow::Close,
                Some(Err(e)) => return Err(e),
                Some(Ok(Ok(msg))) => self.session.handle(msg, &mut framed).await?,
                Some(Ok(Err(e))) => {
                    self.session.reject(e, &mut framed).await?;
                    Flow::Continue
                }
            };

            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::FakeEngine;
    use futures::SinkExt;
    use pawnstorm_core::{
        game::GameState,
        messages::{Message, NewGame, NewPos, ReadyOk},
        types::DEFAULT_MAX_FRAME_BYTES,
    };
    use std::net::SocketAddr;
    use tokio::{io::AsyncWriteExt, task::JoinHandle};

    type Client = Framed<TcpStream, MessageCodec>;
    type Served = JoinHandle<(Result<ServeExit>, Worker<FakeEngine>)>;

    async fn start(engine: FakeEngine) -> (SocketAddr, CancellationToken, Served) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let mut worker = Worker::new(engine, DEFAULT_MAX_FRAME_BYTES, shutdown.clone());
        let handle = tokio::spawn(async move {
            let exit = worker.serve(&listener).await;
            (exit, worker)
        });
        (addr, shutdown, handle)
    }

    async fn connect(addr: SocketAddr) -> Client {
        Framed::new(
            TcpStream::connect(addr).await.unwrap(),
            MessageCodec::default(),
        )
    }

    async fn reply(client: &mut Client) -> Message {
        client.next().await.unwrap().unwrap().unwrap()
    }

    async fn exchange(client: &mut Client, msg: Message) -> Message {
        client.send(msg).await.unwrap();
        reply(client).await
    }

    fn new_game(pos_id: u64) -> Message {
        Message::NewGame(NewGame {
            options: vec!["Hash 16".to_owned()],
            position: GameState::new().fen(),
            pos_id,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_game_is_acknowledged() {
        let (addr, shutdown, handle) = start(FakeEngine::default()).await;
        let mut client = connect(addr).await;

        assert_eq!(
            exchange(&mut client, new_game(1)).await,
            Message::ReadyOk(ReadyOk { pos_id: 1 })
        );

        shutdown.cancel();
        let (exit, _) = handle.await.unwrap();
        assert_eq!(exit.unwrap(), ServeExit::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_frames_get_errors_and_keep_the_connection() {
        let (addr, shutdown, handle) = start(FakeEngine::default()).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"not json\n").await.unwrap();
        let Message::Error(err) = reply(&mut client).await else {
            panic!("expected an error reply");
        };
        assert!(err.reason.starts_with("Malformed message"));

        client
            .get_mut()
            .write_all(b"{\"type\":\"castle\"}\n")
            .await
            .unwrap();
        assert_eq!(
            reply(&mut client).await,
            Message::error("Unknown message type: castle")
        );

        assert_eq!(
            exchange(&mut client, new_game(0)).await,
            Message::ReadyOk(ReadyOk { pos_id: 0 })
        );

        shutdown.cancel();
        handle.await.unwrap().0.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_survives_reconnects() {
        let (addr, shutdown, handle) = start(FakeEngine::default()).await;

        let mut first = connect(addr).await;
        exchange(&mut first, new_game(3)).await;
        first.send(Message::Stop).await.unwrap();
        // The worker closes its side after `stop`.
        assert!(first.next().await.is_none());

        let mut second = connect(addr).await;
        let stale = Message::NewPos(NewPos {
            position: GameState::new().fen(),
            pos_id: 3,
        });
        let Message::Error(err) = exchange(&mut second, stale).await else {
            panic!("expected a stale rejection");
        };
        assert_eq!(err.reason, "Stale position: pos_id 3 (current 3)");

        shutdown.cancel();
        let (_, worker) = handle.await.unwrap();
        assert_eq!(worker.session().pos_id(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mirrored_fen_matches_the_sender() {
        let (addr, _shutdown, handle) = start(FakeEngine::default()).await;
        let mut client = connect(addr).await;

        let mut game = GameState::new();
        for uci in ["e2e4", "c7c5", "e4e5", "d7d5"] {
            game.play(uci).unwrap();
        }
        let fen = game.fen();

        exchange(&mut client, new_game(0)).await;
        let ack = exchange(
            &mut client,
            Message::NewPos(NewPos {
                position: fen.clone(),
                pos_id: 1,
            }),
        )
        .await;
        assert_eq!(ack, Message::ReadyOk(ReadyOk { pos_id: 1 }));

        client.send(Message::Exit).await.unwrap();
        let (_, worker) = handle.await.unwrap();
        assert_eq!(worker.session().game().fen(), fen);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_stops_the_server_and_cancels_the_token() {
        let engine = FakeEngine::default();
        let (addr, shutdown, handle) = start(engine.clone()).await;
        let mut client = connect(addr).await;

        client.send(Message::Exit).await.unwrap();
        let (exit, worker) = handle.await.unwrap();

        assert_eq!(exit.unwrap(), ServeExit::ExitRequested);
        assert!(shutdown.is_cancelled());

        let mut engine = worker.into_engine();
        engine.quit().await.unwrap();
        assert_eq!(engine.calls(), vec!["quit".to_owned()]);
    }
}
