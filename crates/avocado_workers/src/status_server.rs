//! Collects status messages from running tasks.
//!
//! Every producer (the process spawner relaying a runner's stdout, or a
//! network connection from a runner) pushes into one bounded queue that
//! the scheduler drains. Messages of one task keep the order in which
//! the producer saw them.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use avocado_utils::net_protocol;
use avocado_utils::net_protocol::messages::Message;
use avocado_utils::net_protocol::task::TaskAuth;
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::task::TaskId;

/// Bound on queued messages; producers wait when the scheduler lags.
const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum StatusServerError {
    #[error("could not listen on {addr}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Producer half of the status queue.
#[derive(Clone)]
pub struct StatusSender(mpsc::Sender<Message>);

impl StatusSender {
    /// Queues `message`, attributing it to `task`.
    pub async fn send(&self, task: &TaskId, message: Message) {
        let message = message.with_task_id(task.as_str());
        if self.0.send(message).await.is_err() {
            tracing::debug!(%task, "status queue closed; dropping message");
        }
    }
}

type Registered = Arc<Mutex<HashSet<String>>>;

struct Endpoint {
    addr: SocketAddr,
    /// Address given to runners when it differs from the bound one.
    advertised: Option<String>,
    accept_loop: JoinHandle<()>,
}

pub struct StatusServer {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    registered: Registered,
    endpoint: Option<Endpoint>,
}

impl StatusServer {
    /// A server that only accepts messages from in-process producers.
    pub fn local() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            registered: Default::default(),
            endpoint: None,
        }
    }

    /// A server that additionally accepts runner connections on `addr`.
    /// Port 0 picks a free port; see [StatusServer::uri].
    pub async fn bind(addr: SocketAddr) -> Result<Self, StatusServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StatusServerError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| StatusServerError::Bind { addr, source })?;

        let mut server = Self::local();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            server.tx.clone(),
            server.registered.clone(),
        ));
        tracing::debug!(%addr, "status server listening");
        server.endpoint = Some(Endpoint {
            addr,
            advertised: None,
            accept_loop,
        });
        Ok(server)
    }

    /// Makes runners report to `uri` instead of the bound address, for
    /// listeners behind NAT or a wildcard address.
    pub fn with_advertised_uri(mut self, uri: impl Into<String>) -> Self {
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.advertised = Some(uri.into());
        }
        self
    }

    /// `host:port` runners should report to, in network mode.
    pub fn uri(&self) -> Option<String> {
        self.endpoint.as_ref().map(|e| {
            e.advertised
                .clone()
                .unwrap_or_else(|| e.addr.to_string())
        })
    }

    pub fn sender(&self) -> StatusSender {
        StatusSender(self.tx.clone())
    }

    /// Allows network connections authenticating as `task`.
    pub fn register_task(&self, task: &TaskId) {
        self.registered.lock().insert(task.to_string());
    }

    pub fn unregister_task(&self, task: &TaskId) {
        self.registered.lock().remove(task.as_str());
    }

    /// Next queued message, if one is available right now.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Waits at most `timeout` for the next message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.accept_loop.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Message>, registered: Registered) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, tx.clone(), registered.clone()));
            }
            Err(err) => {
                tracing::warn!(?err, "status server failed to accept a connection");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Message>,
    registered: Registered,
) {
    let mut reader = BufReader::new(stream);
    let auth: TaskAuth = match net_protocol::async_read(&mut reader).await {
        Ok(Some(auth)) => auth,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(?err, "invalid status connection handshake");
            return;
        }
    };
    if !registered.lock().contains(&auth.task_id) {
        tracing::warn!(task = %auth.task_id, "rejecting status connection for unknown task");
        return;
    }

    loop {
        match net_protocol::async_read::<Message, _>(&mut reader).await {
            Ok(Some(message)) => {
                let message = message.with_task_id(auth.task_id.clone());
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(task = %auth.task_id, ?err, "dropping malformed status record");
                return;
            }
        }
    }
}
