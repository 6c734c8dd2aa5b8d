//! Where a runner process delivers its messages.

use std::io;
use std::pin::Pin;

use avocado_utils::net_protocol;
use avocado_utils::net_protocol::messages::Message;
use avocado_utils::net_protocol::task::TaskAuth;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

type Target = Pin<Box<dyn AsyncWrite + Send>>;

/// Writes messages as JSON lines to stdout or to status servers.
pub struct StatusWriter {
    targets: Vec<(String, Target)>,
}

impl StatusWriter {
    pub fn stdout() -> Self {
        Self {
            targets: vec![("stdout".to_string(), Box::pin(tokio::io::stdout()))],
        }
    }

    /// Connects to every `host:port` in `uris`, authenticating as the task.
    ///
    /// Fails only if no endpoint could be reached.
    pub async fn connect(uris: &[String], auth: &TaskAuth) -> io::Result<Self> {
        let mut targets: Vec<(String, Target)> = Vec::with_capacity(uris.len());
        let mut last_error = None;
        for uri in uris {
            match TcpStream::connect(uri.as_str()).await {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    net_protocol::async_write(&mut stream, auth).await?;
                    targets.push((uri.clone(), Box::pin(stream)));
                }
                Err(err) => {
                    tracing::warn!(%uri, ?err, "could not reach status server");
                    last_error = Some(err);
                }
            }
        }
        match (targets.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(Self { targets }),
        }
    }

    /// Delivers `message` to every live target. A target that fails to
    /// accept a message is dropped.
    pub async fn write(&mut self, message: &Message) {
        let mut failed = Vec::new();
        for (index, (uri, target)) in self.targets.iter_mut().enumerate() {
            if let Err(err) = net_protocol::async_write(target, message).await {
                tracing::warn!(%uri, ?err, "dropping status target");
                failed.push(index);
            }
        }
        for index in failed.into_iter().rev() {
            self.targets.remove(index);
        }
    }
}

#[cfg(test)]
mod test {
    use super::StatusWriter;
    use avocado_utils::net_protocol;
    use avocado_utils::net_protocol::messages::Message;
    use avocado_utils::net_protocol::task::TaskAuth;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn authenticates_then_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let auth = TaskAuth {
            task_id: "1-t".to_string(),
            job_id: Some("job".to_string()),
        };

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let auth: TaskAuth = net_protocol::async_read(&mut reader).await.unwrap().unwrap();
            let msg: Message = net_protocol::async_read(&mut reader).await.unwrap().unwrap();
            (auth, msg)
        });

        let mut writer = StatusWriter::connect(&[addr], &auth).await.unwrap();
        writer.write(&Message::running().with_task_id("1-t")).await;

        let (got_auth, msg) = server.await.unwrap();
        assert_eq!(got_auth, auth);
        assert_eq!(msg.type_name(), "running");
        assert_eq!(msg.task_id.as_deref(), Some("1-t"));
    }

    #[tokio::test]
    async fn unreachable_endpoints_fail() {
        let auth = TaskAuth {
            task_id: "1-t".to_string(),
            job_id: None,
        };
        assert!(StatusWriter::connect(&["127.0.0.1:1".to_string()], &auth)
            .await
            .is_err());
    }
}
