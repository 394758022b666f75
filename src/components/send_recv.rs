use crate::interface::link::Message;
use log::error;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

/// Request/response over a link client task. `None` means the link is closed or the client
/// dropped the request; callers treat it as "no answer this time".
pub trait SendRecv {
    fn get_sender(&self) -> Option<&mpsc::Sender<Message>>;
    fn write(&self, buffer: &[u8]) -> impl Future<Output = Option<Vec<u8>>> + Send
    where
        Self: Sync,
    {
        async move {
            let sender = self.get_sender()?;
            let (resp_tx, resp_rx) = oneshot::channel();
            let msg = Message {
                buffer: buffer.to_vec(),
                response: resp_tx,
            };
            if let Err(e) = sender.send(msg).await {
                error!("Link client is gone: {e}");
                return None;
            }
            resp_rx.await.ok()
        }
    }
}
