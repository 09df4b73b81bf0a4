//! Mock CAN transport for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::hub::MessageHub;
use super::simulator::SimulatedDevice;
use super::traits::{CanTransport, TransportError};
use crate::protocol::{CanMessage, frame};

/// Produces the device's replies to one sent message.
pub type Responder = Box<dyn FnMut(&CanMessage) -> Vec<CanMessage> + Send>;

/// Mock transport for unit testing session logic.
///
/// Replies are produced synchronously inside [`CanTransport::send`] and
/// dispatched through the hub, so a waiter registered before the send
/// always sees them.
pub struct MockTransport {
    hub: Arc<MessageHub>,
    /// Captured sends.
    sent: Mutex<Vec<CanMessage>>,
    responder: Mutex<Option<Responder>>,
    connected: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockTransport {
    /// Silent mock: records sends, never replies.
    pub fn new() -> Self {
        Self {
            hub: MessageHub::new(),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Mock that answers with a custom responder.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&CanMessage) -> Vec<CanMessage> + Send + 'static,
    {
        let mock = Self::new();
        mock.set_responder(responder);
        mock
    }

    /// Mock backed by a simulated bootloader.
    pub fn with_device(mut device: SimulatedDevice) -> Self {
        Self::with_responder(move |msg| device.respond(msg))
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanMessage) -> Vec<CanMessage> + Send + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Deliver an unsolicited message as if received from the bus.
    pub fn inject(&self, msg: CanMessage) {
        self.hub.dispatch(msg);
    }

    /// Get all captured sends.
    pub fn sent(&self) -> Vec<CanMessage> {
        lock(&self.sent).clone()
    }

    /// Captured sends with the given identifier.
    pub fn sent_with_id(&self, id: u16) -> Vec<CanMessage> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.id() == id)
            .copied()
            .collect()
    }

    /// Clear captured sends.
    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    /// Simulate link loss.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.close();
    }

    /// Simulate link recovery.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CanTransport for MockTransport {
    fn send(&self, id: u16, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        // Same limits as the physical link.
        frame::encode(id, payload)?;

        let msg = CanMessage::from_parts(id, payload);
        lock(&self.sent).push(msg);

        let replies = match lock(&self.responder).as_mut() {
            Some(responder) => responder(&msg),
            None => Vec::new(),
        };
        for reply in replies {
            self.hub.dispatch(reply);
        }
        Ok(())
    }

    fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_mock_send_capture() {
        let mock = MockTransport::new();
        mock.send(CMD_PING, &[]).unwrap();
        mock.send(CMD_RESET, &[]).unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id(), CMD_PING);
        assert_eq!(mock.sent_with_id(CMD_RESET).len(), 1);

        mock.clear_sent();
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn test_mock_rejects_what_the_link_would() {
        let mock = MockTransport::new();
        assert!(matches!(
            mock.send(0x800, &[]),
            Err(TransportError::Frame(_))
        ));
        assert!(mock.send(CMD_DATA, &[0; 9]).is_err());
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn test_mock_replies_reach_subscribers() {
        let mock = MockTransport::with_responder(|msg| {
            vec![CanMessage::from_parts(RSP_PING, &[msg.payload().len() as u8])]
        });
        let sub = mock.hub().subscribe();
        mock.send(CMD_PING, &[]).unwrap();
        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload(), &[0]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.send(CMD_PING, &[]),
            Err(TransportError::Disconnected)
        ));

        mock.reconnect();
        assert!(mock.send(CMD_PING, &[]).is_ok());
    }
}
