//! Transport implementations for coordinator/worker message exchange
//!
//! All framed transports speak newline-delimited JSON envelopes. Frames are
//! delivered in the order the peer emitted them; nothing is guaranteed
//! between different transports.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, WIRE_PROTOCOL_VERSION};

/// Framed duplex channel to exactly one peer. `Out` frames go to the peer,
/// `In` frames come back.
#[async_trait]
pub trait Transport<Out, In>: Send
where
    Out: Serialize + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
{
    /// Send one envelope to the peer
    async fn send(&mut self, envelope: &MessageEnvelope<Out>) -> Result<(), IpcError>;

    /// Receive the next complete envelope from the peer. Returns
    /// `IpcError::ChannelClosed` once the peer has gone away.
    async fn receive(&mut self) -> Result<MessageEnvelope<In>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

async fn write_frame<W, T>(writer: &mut W, envelope: &MessageEnvelope<T>) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize,
{
    let mut json = serde_json::to_string(envelope).map_err(|e| {
        IpcError::Serialization(e.to_string())
    })?;
    json.push('\n');

    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<MessageEnvelope<T>, IpcError>
where
    R: AsyncBufRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Err(IpcError::ChannelClosed);
    }

    let envelope: MessageEnvelope<T> = serde_json::from_str(line.trim_end())
        .map_err(|e| IpcError::Deserialization(e.to_string()))?;

    if envelope.protocol_version != WIRE_PROTOCOL_VERSION {
        return Err(IpcError::VersionMismatch {
            expected: WIRE_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope)
}

/// Worker-side transport over the process's own stdin/stdout. Used inside a
/// spawned worker unit to talk back to the coordinator.
pub struct StdioTransport {
    stdin: BufReader<tokio::io::Stdin>,
    stdout: tokio::io::Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Out, In> Transport<Out, In> for StdioTransport
where
    Out: Serialize + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn send(&mut self, envelope: &MessageEnvelope<Out>) -> Result<(), IpcError> {
        write_frame(&mut self.stdout, envelope).await
    }

    async fn receive(&mut self) -> Result<MessageEnvelope<In>, IpcError> {
        read_frame(&mut self.stdin).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Stdin/stdout close with the process
        Ok(())
    }
}

/// Coordinator-side transport over a child process's piped stdin/stdout
pub struct ChildProcessTransport {
    stdin: Option<tokio::process::ChildStdin>,
    stdout: Option<BufReader<tokio::process::ChildStdout>>,
}

impl ChildProcessTransport {
    pub fn new(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
        }
    }
}

#[async_trait]
impl<Out, In> Transport<Out, In> for ChildProcessTransport
where
    Out: Serialize + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn send(&mut self, envelope: &MessageEnvelope<Out>) -> Result<(), IpcError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| IpcError::Io("stdin already closed".to_string()))?;
        write_frame(stdin, envelope).await
    }

    async fn receive(&mut self) -> Result<MessageEnvelope<In>, IpcError> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| IpcError::Io("stdout already closed".to_string()))?;
        read_frame(stdout).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Dropping the pipe ends signals EOF to the child
        let _ = self.stdin.take();
        let _ = self.stdout.take();
        Ok(())
    }
}

/// In-process transport for thread-based worker units. One end lives with
/// the coordinator, the other inside the worker thread; no serialization is
/// involved, but framing and ordering semantics match the pipe transports.
pub struct ChannelTransport<Out, In> {
    tx: Option<mpsc::UnboundedSender<MessageEnvelope<Out>>>,
    rx: mpsc::UnboundedReceiver<MessageEnvelope<In>>,
}

/// Create a connected pair of channel transports. The first element sends
/// `A` and receives `B`; the second is its mirror image.
pub fn channel_pair<A, B>() -> (ChannelTransport<A, B>, ChannelTransport<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        ChannelTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl<Out, In> Transport<Out, In> for ChannelTransport<Out, In>
where
    Out: Serialize + Clone + Send + Sync + 'static,
    In: DeserializeOwned + Send + 'static,
{
    async fn send(&mut self, envelope: &MessageEnvelope<Out>) -> Result<(), IpcError> {
        let tx = self.tx.as_ref().ok_or(IpcError::ChannelClosed)?;
        tx.send(envelope.clone()).map_err(|_| IpcError::ChannelClosed)
    }

    async fn receive(&mut self) -> Result<MessageEnvelope<In>, IpcError> {
        self.rx.recv().await.ok_or(IpcError::ChannelClosed)
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Dropping our sender wakes the peer's receive with ChannelClosed
        let _ = self.tx.take();
        Ok(())
    }
}
