//! One-shot request/response
//!
//! [`exchange`] opens an [`AsyncSocket`], sends one message, waits for one
//! reply, and closes the socket, all under a single deadline.

use std::time::Duration;

use tokio::time::Instant;

use super::async_socket::{AsyncSocket, FlushStatus};
use crate::env::IpcEnv;
use crate::error::{ExchangeStage, IpcError, IpcResult};

/// Send one message to `name` and return the reply payload
///
/// The socket is closed on every path.
///
/// # Errors
///
/// Returns `IpcError::Exchange` naming the stage that failed. A deadline
/// expiry during flush or receive is reported as `IpcError::Timeout` inside
/// it.
pub async fn exchange(
    env: &IpcEnv,
    name: &str,
    code: u32,
    data: &[u8],
    timeout: Duration,
) -> IpcResult<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let remaining = || deadline.saturating_duration_since(Instant::now());
    let failed = |stage: ExchangeStage, source: IpcError| IpcError::Exchange {
        service: name.to_string(),
        stage,
        source: Box::new(source),
    };

    let mut socket = AsyncSocket::open(env, name, remaining())
        .await
        .map_err(|e| failed(ExchangeStage::Open, e))?;

    let result = async {
        socket
            .send(code, data)
            .map_err(|e| failed(ExchangeStage::Send, e))?;

        match socket.flush(remaining()).await {
            Ok(FlushStatus::Flushed) => {}
            Ok(FlushStatus::TimedOut) => return Err(failed(ExchangeStage::Flush, IpcError::Timeout)),
            Err(e) => return Err(failed(ExchangeStage::Flush, e)),
        }

        match socket.recv(remaining()).await {
            Ok(Some(reply)) => Ok(reply.into_data()),
            Ok(None) => Err(failed(ExchangeStage::Recv, IpcError::Timeout)),
            Err(e) => Err(failed(ExchangeStage::Recv, e)),
        }
    }
    .await;

    socket.close();

    if let Err(e) = &result {
        tracing::debug!(service = %name, code, error = %e, "Exchange failed");
    }
    result
}
