// PostgreSQL wire protocol TCP server

use crate::channel::SuspendingChannel;
use crate::executor::QueryExecutor;
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use super::{
    protocol::BackendKey,
    session::{SessionConfig, SessionHandler},
    Result, DEFAULT_PORT,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 100,
            session: SessionConfig::default(),
        }
    }
}

/// Accepts connections and runs one [`SessionHandler`] task per client.
pub struct Server {
    config: ServerConfig,
    executor: Arc<dyn QueryExecutor>,
    next_process_id: AtomicI32,
}

impl Server {
    pub fn new(config: ServerConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            config,
            executor,
            next_process_id: AtomicI32::new(1),
        }
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Accepts from an already bound listener until `shutdown` resolves.
    ///
    /// Sessions that are still running when the listener stops are left to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        // Connection limiter
        let connection_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Listener stopped");
                    return Ok(());
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
            }

            // Clone what we need for the spawned task
            let executor = Arc::clone(&self.executor);
            let session_config = self.config.session.clone();
            let semaphore = connection_semaphore.clone();
            let backend_key =
                BackendKey::generate(self.next_process_id.fetch_add(1, Ordering::Relaxed));

            tokio::spawn(async move {
                // Acquire connection permit
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Failed to acquire connection permit");
                        return;
                    }
                };

                info!(
                    "New connection from {} (backend {})",
                    peer_addr, backend_key.process_id
                );

                let channel = SuspendingChannel::from_stream(stream, session_config.read_timeout);
                let mut session =
                    SessionHandler::new(channel, executor, backend_key, &session_config);
                if let Err(e) = session.run().await {
                    warn!("Connection error from {}: {}", peer_addr, e);
                }

                info!("Connection closed from {}", peer_addr);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SampleExecutor;
    use crate::network::{PROTOCOL_VERSION_3, SSL_REQUEST_CODE};
    use byteorder::{BigEndian, ByteOrder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn start_server(max_connections: usize) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            listen_addr: addr,
            max_connections,
            session: SessionConfig::default(),
        };
        let server = Server::new(config, Arc::new(SampleExecutor::new(1)));

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });
        (addr, tx)
    }

    async fn handshake(stream: &mut TcpStream) -> Vec<u8> {
        let mut ssl_request = Vec::new();
        ssl_request.extend_from_slice(&8i32.to_be_bytes());
        ssl_request.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        stream.write_all(&ssl_request).await.unwrap();

        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"N");

        let params = b"user\0bob\0\0";
        let mut startup = Vec::new();
        startup.extend_from_slice(&((8 + params.len()) as i32).to_be_bytes());
        startup.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
        startup.extend_from_slice(params);
        stream.write_all(&startup).await.unwrap();

        read_tags_until_ready(stream).await
    }

    async fn read_tags_until_ready(stream: &mut TcpStream) -> Vec<u8> {
        let mut tags = Vec::new();
        loop {
            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; BigEndian::read_i32(&header[1..5]) as usize - 4];
            stream.read_exact(&mut body).await.unwrap();
            tags.push(header[0]);
            if header[0] == b'Z' {
                return tags;
            }
        }
    }

    #[tokio::test]
    async fn test_server_handshake_and_query() {
        let (addr, _shutdown) = start_server(10).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let tags = handshake(&mut stream).await;
        assert_eq!(tags.first(), Some(&b'R'));
        assert!(tags.contains(&b'K'));

        let mut query = vec![b'Q'];
        query.extend_from_slice(&13i32.to_be_bytes());
        query.extend_from_slice(b"SELECT 1\0");
        stream.write_all(&query).await.unwrap();
        assert_eq!(read_tags_until_ready(&mut stream).await, b"TDCZ".to_vec());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (addr, _shutdown) = start_server(10).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        // A silent first client does not hold up the second one
        first.write_all(&8i32.to_be_bytes()).await.unwrap();
        handshake(&mut second).await;

        drop(second);
        let mut rest = [0u8; 4];
        first.write_all(&SSL_REQUEST_CODE.to_be_bytes()).await.unwrap();
        first.read_exact(&mut rest[..1]).await.unwrap();
        assert_eq!(rest[0], b'N');
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(ServerConfig::default(), Arc::new(SampleExecutor::default()));

        let (tx, rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 5432);
        assert_eq!(config.max_connections, 100);
        assert!(config.session.read_timeout.is_none());
    }
}
