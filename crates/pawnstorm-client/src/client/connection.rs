use crate::client::{config::OrchestratorConfig, directory::Directory};
use core::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use futures::{SinkExt, StreamExt};
use pawnstorm_core::{Error, Result, codec::MessageCodec, messages::Message, types::JobId};
use std::sync::Arc;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::{codec::Framed, sync::CancellationToken};

type Stream = Framed<TcpStream, MessageCodec>;

/// Client side of one worker.
///
/// Cheap to clone; clones share the same stream. Any transport failure tears
/// the stream down on the spot and starts a detached reconnect loop, so the
/// caller never waits on a dead worker. Until that loop succeeds
/// [`is_ready`](Self::is_ready) reports `false`.
#[derive(Clone)]
pub struct WorkerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    index: usize,
    name: String,
    ready: AtomicBool,
    reconnecting: AtomicBool,
    last_job_id: AtomicU64,
    // Held for the whole resolve-and-dial so only one caller dials at once.
    dial: Mutex<()>,
    stream: Mutex<Option<Stream>>,
    directory: Arc<dyn Directory>,
    backoff: Duration,
    max_backoff: Duration,
    max_frame_bytes: usize,
    closed: CancellationToken,
}

impl WorkerConnection {
    pub fn new(
        index: usize,
        name: impl Into<String>,
        directory: Arc<dyn Directory>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                name: name.into(),
                ready: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                last_job_id: AtomicU64::new(0),
                dial: Mutex::new(()),
                stream: Mutex::new(None),
                directory,
                backoff: config.connect_backoff,
                max_backoff: config.max_backoff.max(config.connect_backoff),
                max_frame_bytes: config.max_frame_bytes,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Job id of the most recent `parse_moves` sent on this connection.
    pub fn last_job_id(&self) -> JobId {
        self.inner.last_job_id.load(Ordering::Acquire)
    }

    pub fn set_last_job_id(&self, job_id: JobId) {
        self.inner.last_job_id.store(job_id, Ordering::Release);
    }

    /// Resolves the worker and opens a stream unless one is already up.
    ///
    /// Dialing is exclusive: a caller that arrives while a background
    /// reconnect is mid-dial waits for it and then reuses its stream. A live
    /// stream is never replaced, and nothing is installed once the
    /// connection has been closed.
    pub async fn connect(&self) -> Result<()> {
        let _dialing = self.inner.dial.lock().await;
        if self.inner.closed.is_cancelled() {
            return Err(self.not_connected());
        }
        if self.inner.stream.lock().await.is_some() {
            return Ok(());
        }

        let attempt = async {
            let addr = self.inner.directory.resolve(&self.inner.name).await?;
            let stream = TcpStream::connect(addr).await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(worker = self.name(), "Unable to set TCP_NODELAY: {e}");
            }
            Ok::<_, Error>((addr, stream))
        };
        let dialed = tokio::select! {
            biased;
            () = self.inner.closed.cancelled() => Err(self.not_connected()),
            dialed = attempt => dialed,
        };

        let (addr, stream) = match dialed {
            Ok(dialed) => dialed,
            Err(e) => {
                self.inner.ready.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut guard = self.inner.stream.lock().await;
        if self.inner.closed.is_cancelled() {
            return Err(self.not_connected());
        }
        *guard = Some(Framed::new(
            stream,
            MessageCodec::new(self.inner.max_frame_bytes),
        ));
        self.inner.ready.store(true, Ordering::Release);
        tracing::info!(worker = self.name(), %addr, "Connected");
        Ok(())
    }

    /// Writes one message. A transport failure tears the connection down and
    /// schedules a background reconnect before the error is returned.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(self.not_connected());
        };

        match stream.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                *guard = None;
                drop(guard);
                tracing::warn!(worker = self.name(), kind = msg.kind(), "Send failed: {e}");
                self.mark_down();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for the next message, for at most `limit` if given.
    ///
    /// Returns `Ok(None)` on timeout; the connection stays up and a late reply
    /// is simply read next time. An undecodable frame is returned as its
    /// decode error, also without touching the connection. End of stream and
    /// I/O failures tear the connection down like [`send`](Self::send).
    pub async fn recv(&self, limit: Option<Duration>) -> Result<Option<Message>> {
        let mut guard = self.inner.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(self.not_connected());
        };

        let next = match limit {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            },
            None => stream.next().await,
        };

        let failure = match next {
            Some(Ok(Ok(msg))) => return Ok(Some(msg)),
            Some(Ok(Err(e))) => return Err(e),
            Some(Err(e)) => e,
            None => self.not_connected(),
        };

        *guard = None;
        drop(guard);
        tracing::warn!(worker = self.name(), "Receive failed: {failure}");
        self.mark_down();
        Err(failure)
    }

    /// Drops the stream without scheduling a reconnect.
    pub async fn disconnect(&self) {
        self.inner.ready.store(false, Ordering::Release);
        *self.inner.stream.lock().await = None;
    }

    /// Best-effort `stop`, then drops the stream for good.
    pub async fn close(&self) {
        self.shut(Message::Stop).await;
    }

    /// Best-effort `exit`, which terminates the worker process, then drops
    /// the stream for good.
    pub async fn terminate(&self) {
        self.shut(Message::Exit).await;
    }

    async fn shut(&self, farewell: Message) {
        self.inner.closed.cancel();
        self.inner.ready.store(false, Ordering::Release);

        let mut guard = self.inner.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            if let Err(e) = stream.send(&farewell).await {
                tracing::debug!(worker = self.name(), "Unable to send {}: {e}", farewell.kind());
            }
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected {
            name: self.inner.name.clone(),
        }
    }

    fn mark_down(&self) {
        self.inner.ready.store(false, Ordering::Release);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        if self.inner.closed.is_cancelled() || self.inner.reconnecting.swap(true, Ordering::AcqRel)
        {
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            let mut delay = conn.inner.backoff;
            loop {
                tokio::select! {
                    biased;
                    () = conn.inner.closed.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                if conn.is_ready() {
                    break;
                }

                match conn.connect().await {
                    Ok(()) => {
                        tracing::info!(worker = conn.name(), "Reconnected");
                        break;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(conn.inner.max_backoff);
                        tracing::debug!(
                            worker = conn.name(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Reconnect failed: {e}"
                        );
                    }
                }
            }
            conn.inner.reconnecting.store(false, Ordering::Release);
        });
    }
}
