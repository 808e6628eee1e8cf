use judge_protocol::ClientFrame;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::JudgeError;

/// Write side of one dispatch connection. Cloned into every task that
/// was dispatched over that connection; once the connection's writer
/// goes away every send fails with [`JudgeError::ChannelClosed`].
#[derive(Clone, Debug)]
pub struct DispatchSender {
    tx: mpsc::Sender<String>,
}

impl DispatchSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: &ClientFrame) -> Result<(), JudgeError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| JudgeError::system(format!("failed to encode frame: {e}")))?;
        self.send_raw(text).await
    }

    /// Send a pre-encoded text frame (the credential frame is not JSON).
    pub async fn send_raw(&self, text: String) -> Result<(), JudgeError> {
        self.tx
            .send(text)
            .await
            .map_err(|_| JudgeError::ChannelClosed)
    }

    /// Best-effort, non-blocking send for informational frames.
    pub fn notify(&self, frame: &ClientFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                if let Err(e) = self.tx.try_send(text) {
                    debug!("dropped informational frame: {e}");
                }
            }
            Err(e) => debug!("failed to encode informational frame: {e}"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
