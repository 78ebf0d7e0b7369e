// PostgreSQL wire protocol session handler

use crate::channel::{ReadOutcome, SuspendingChannel};
use crate::executor::QueryExecutor;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::{
    message::{RequestMessage, ResponseMessage},
    protocol::{Action, BackendKey, ProtocolHandler, SessionState},
    NetworkError, Result, MAX_STARTUP_MESSAGE_LEN, READ_BUFFER_CAPACITY,
};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fail a read that sees no bytes for this long.
    pub read_timeout: Option<Duration>,
    /// Reported to clients in the `server_version` parameter.
    pub server_version: String,
    /// Largest declared length accepted for a tagged message.
    pub max_message_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            server_version: "15.0".to_string(),
            max_message_len: 64 * 1024 * 1024,
        }
    }
}

/// Drives one client connection: read, frame, decode, dispatch, write.
pub struct SessionHandler<S = TcpStream> {
    channel: SuspendingChannel<S>,
    protocol: ProtocolHandler,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    max_message_len: usize,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        channel: SuspendingChannel<S>,
        executor: Arc<dyn QueryExecutor>,
        backend_key: BackendKey,
        config: &SessionConfig,
    ) -> Self {
        Self {
            channel,
            protocol: ProtocolHandler::new(executor, backend_key, config.server_version.clone()),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buffer: BytesMut::with_capacity(8192),
            max_message_len: config.max_message_len,
        }
    }

    pub fn state(&self) -> &SessionState {
        self.protocol.state()
    }

    /// Serves the connection until the client leaves or an error occurs.
    ///
    /// The channel is closed on every exit path.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.serve().await;
        self.channel.close().await;
        self.protocol.close();
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            // Dispatch every complete frame before reading again
            while let Some(frame) = self.next_frame()? {
                let message = RequestMessage::decode(&frame)?;
                debug!("Received {:?}", message);

                let reply = self.protocol.handle_message(message)?;
                self.send(&reply.responses).await?;
                if reply.action == Action::Close {
                    return Ok(());
                }
            }

            match self.channel.read(&mut self.read_buffer).await? {
                ReadOutcome::Data(n) => debug!("Read {} bytes", n),
                ReadOutcome::EndOfStream => {
                    if !self.read_buffer.is_empty() {
                        debug!(
                            "Discarding {} bytes of an incomplete message",
                            self.read_buffer.len()
                        );
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Splits the next complete message off the read buffer.
    ///
    /// Startup-phase messages carry no tag byte, except a simple query which
    /// is recognised by its leading `Q`. Once startup completes every message
    /// is tagged.
    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let tagged =
            !self.state().in_startup() || self.read_buffer.first() == Some(&b'Q');
        let (header, limit) = if tagged {
            (1, self.max_message_len)
        } else {
            (0, MAX_STARTUP_MESSAGE_LEN)
        };

        if self.read_buffer.len() < header + 4 {
            return Ok(None);
        }

        let declared = BigEndian::read_i32(&self.read_buffer[header..header + 4]);
        if declared < 4 || declared as usize > limit {
            return Err(NetworkError::MalformedMessage(format!(
                "declared length {} outside 4..={}",
                declared, limit
            )));
        }

        // The buffer grows as bytes arrive, never from the declared length alone
        let total = header + declared as usize;
        if self.read_buffer.len() < total {
            return Ok(None);
        }

        Ok(Some(self.read_buffer.split_to(total).freeze()))
    }

    async fn send(&mut self, responses: &[ResponseMessage]) -> Result<()> {
        if responses.is_empty() {
            return Ok(());
        }

        self.write_buffer.clear();
        for response in responses {
            response.encode(&mut self.write_buffer)?;
        }
        let n = self.channel.write(&self.write_buffer).await?;
        debug!("Sent {} messages ({} bytes)", responses.len(), n);
        Ok(())
    }
}
