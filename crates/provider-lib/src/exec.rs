//! Exec session proxy
//!
//! The backend answers an exec request with a websocket address and a
//! one-time password. The password goes out as the first text frame; after
//! that stdin is forwarded as binary frames and every frame received is
//! written to stdout.

use crate::error::{ProviderError, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 4096;

fn stream_error(e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Backend(format!("exec stream: {e}"))
}

/// Connect to an exec session and relay it until cancelled or closed
pub async fn proxy<R, W>(
    url: &str,
    password: &str,
    stdin: Option<R>,
    stdout: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (ws, _) = connect_async(url).await.map_err(stream_error)?;
    debug!(url = %url, "Exec stream connected");
    relay(ws, password, stdin, stdout, cancel).await
}

/// Relay an established exec session
///
/// Ends when the remote side closes or `cancel` fires. Stdin reaching EOF
/// stops input only; output keeps flowing until the session ends.
pub async fn relay<S, R, W>(
    ws: WebSocketStream<S>,
    password: &str,
    stdin: Option<R>,
    stdout: W,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    sink.send(Message::Text(password.to_string()))
        .await
        .map_err(stream_error)?;

    let outbound = async {
        if let Some(stdin) = stdin {
            copy_input(stdin, &mut sink, &cancel).await?;
        }
        std::future::pending::<Result<()>>().await
    };
    let inbound = copy_output(&mut stream, stdout, &cancel);

    tokio::select! {
        res = outbound => res,
        res = inbound => res,
    }
}

async fn copy_input<R, K>(mut stdin: R, sink: &mut K, cancel: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = stdin.read(&mut buf) => {
                let n = read.map_err(stream_error)?;
                if n == 0 {
                    debug!("Exec stdin closed");
                    return Ok(());
                }
                sink.send(Message::Binary(buf[..n].to_vec()))
                    .await
                    .map_err(stream_error)?;
            }
        }
    }
}

async fn copy_output<T, W>(stream: &mut T, mut stdout: W, cancel: &CancellationToken) -> Result<()>
where
    T: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                stdout.write_all(&data).await.map_err(stream_error)?
            }
            Some(Ok(Message::Text(text))) => {
                stdout.write_all(text.as_bytes()).await.map_err(stream_error)?
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(WsError::ConnectionClosed)) => break,
            Some(Err(e)) => return Err(stream_error(e)),
        }
    }

    stdout.flush().await.map_err(stream_error)
}
