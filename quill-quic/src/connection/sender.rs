//! Outbound packet hand-off.
//!
//! Encoding, sealing and socket I/O live behind [`PacketSender`]. The engine
//! passes each packet with the cipher of its level and gets a
//! [`SendCompletion`] back; callers that need back-pressure await it, others
//! drop it.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::crypto::AeadCipher;
use crate::error::{Error, Result};
use crate::packet::Packet;

/// Transmits packets on behalf of a connection.
///
/// `send` must not call back into the connection before returning; queue
/// the packet and complete asynchronously instead.
pub trait PacketSender: Send + Sync {
    fn send(&self, packet: Packet, cipher: Arc<AeadCipher>) -> SendCompletion;
}

/// Resolves once the sender has transmitted (or failed to transmit) a packet.
#[derive(Debug)]
#[must_use = "dropping a completion discards send failures"]
pub struct SendCompletion {
    inner: Option<oneshot::Receiver<Result<()>>>,
}

/// Sender-side half of a [`SendCompletion`].
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<Result<()>>,
}

impl SendCompletion {
    /// A pending completion and the handle that resolves it.
    pub fn pending() -> (CompletionHandle, SendCompletion) {
        let (tx, rx) = oneshot::channel();
        (CompletionHandle { tx }, SendCompletion { inner: Some(rx) })
    }

    /// Already transmitted.
    pub fn done() -> Self {
        Self { inner: None }
    }

    /// Already failed.
    pub fn failed(error: Error) -> Self {
        let (handle, completion) = Self::pending();
        handle.complete(Err(error));
        completion
    }

    /// Failure the sender reported before returning, if any. A pending
    /// completion is left untouched.
    pub fn immediate_failure(&mut self) -> Option<Error> {
        let rx = self.inner.as_mut()?;
        match rx.try_recv() {
            Ok(result) => {
                self.inner = None;
                result.err()
            }
            Err(_) => None,
        }
    }

    pub async fn wait(self) -> Result<()> {
        match self.inner {
            None => Ok(()),
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::SendFailed("sender dropped the packet".into()))),
        }
    }
}

impl CompletionHandle {
    pub fn complete(self, result: Result<()>) {
        // the waiter may have gone away
        let _ = self.tx.send(result);
    }
}
