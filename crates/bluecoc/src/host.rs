//! Event dispatch for the channel stack
//!
//! The `Host` owns the event queue and the managers and feeds them events
//! one at a time, so everything runs on the thread that drives it.

use std::time::Duration;

use log::trace;

use crate::eatt::{Bearer, EattError, EattManager, EattResult};
use crate::l2cap::{ConnHandle, L2capManager};
use crate::runtime::{Event, EventQueue, EventSender, ReceivePath};

pub struct Host {
    queue: EventQueue,
    l2cap: L2capManager,
    eatt: Option<EattManager>,
}

impl Host {
    pub fn new(l2cap: L2capManager) -> Self {
        Self::with_queue(EventQueue::new(), l2cap)
    }

    /// Host draining an existing queue, for collaborators that need a
    /// sender before the managers exist
    pub fn with_queue(queue: EventQueue, l2cap: L2capManager) -> Self {
        Self {
            queue,
            l2cap,
            eatt: None,
        }
    }

    /// Attach an EATT manager and register its PSM
    pub fn with_eatt(mut self, mut eatt: EattManager) -> EattResult<Self> {
        eatt.register(&mut self.l2cap)?;
        self.eatt = Some(eatt);
        Ok(self)
    }

    /// Handle for posting events from other threads
    pub fn sender(&self) -> EventSender {
        self.queue.sender()
    }

    /// Entry point for the lower transport's receive side
    pub fn receive_path(&self) -> ReceivePath {
        ReceivePath::new(self.queue.sender(), self.l2cap.occupancy())
    }

    pub fn l2cap(&self) -> &L2capManager {
        &self.l2cap
    }

    /// Direct access to the channel layer. Call `flush` afterwards so the
    /// EATT layer sees what happened.
    pub fn l2cap_mut(&mut self) -> &mut L2capManager {
        &mut self.l2cap
    }

    pub fn eatt(&self) -> Option<&EattManager> {
        self.eatt.as_ref()
    }

    /// Handle one event
    pub fn dispatch(&mut self, event: Event) {
        trace!("Dispatching {:?}", event);
        self.l2cap.handle_event(&event);

        if let Some(eatt) = self.eatt.as_mut() {
            eatt.process_inbox(&mut self.l2cap);
            eatt.handle_event(&mut self.l2cap, &event);
            eatt.process_inbox(&mut self.l2cap);
        }
    }

    /// Hand queued channel events to the EATT layer
    pub fn flush(&mut self) {
        if let Some(eatt) = self.eatt.as_mut() {
            eatt.process_inbox(&mut self.l2cap);
        }
    }

    /// Handle every queued event; returns how many there were
    pub fn run_until_idle(&mut self) -> usize {
        self.flush();

        let mut handled = 0;
        while let Some(event) = self.queue.try_next() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one event and handle it
    pub fn run_once(&mut self, timeout: Duration) -> bool {
        match self.queue.next_timeout(timeout) {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Send an ATT PDU over the best EATT bearer, or the legacy one
    pub fn eatt_send(&mut self, handle: ConnHandle, priority: u8, pdu: Vec<u8>) -> EattResult<Bearer> {
        let eatt = self.eatt.as_mut().ok_or(EattError::InvalidState)?;
        let bearer = eatt.send(&mut self.l2cap, handle, priority, pdu)?;
        eatt.process_inbox(&mut self.l2cap);
        Ok(bearer)
    }

    /// Resize every EATT bearer of a link
    pub fn eatt_reconfigure(&mut self, handle: ConnHandle, mtu: u16, mps: u16) -> EattResult<()> {
        let eatt = self.eatt.as_mut().ok_or(EattError::InvalidState)?;
        eatt.reconfigure(&mut self.l2cap, handle, mtu, mps)?;
        eatt.process_inbox(&mut self.l2cap);
        Ok(())
    }

    /// Close every EATT bearer of a link
    pub fn eatt_disconnect(&mut self, handle: ConnHandle) -> EattResult<()> {
        let eatt = self.eatt.as_mut().ok_or(EattError::InvalidState)?;
        eatt.disconnect_all(&mut self.l2cap, handle)?;
        eatt.process_inbox(&mut self.l2cap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::constants::L2CAP_LE_SIGNALING_CID;
    use crate::l2cap::{L2capConfig, LinkRole};
    use crate::runtime::HeapBuffers;
    use crate::testing::*;
    use std::sync::Arc;

    fn host() -> (Host, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let l2cap = L2capManager::new(
            L2capConfig::default(),
            sink.clone(),
            ManualTimers::new(),
            Arc::new(HeapBuffers::default()),
        );
        (Host::new(l2cap), sink)
    }

    #[test]
    fn test_events_are_dispatched_in_order() {
        let (mut host, _sink) = host();
        let sender = host.sender();

        sender
            .post(Event::LinkOpened {
                handle: HANDLE,
                conn_id: 3,
                role: LinkRole::Peripheral,
                conn_interval: Duration::from_millis(50),
            })
            .unwrap();
        sender.post(Event::LinkClosed { handle: HANDLE }).unwrap();

        assert!(host.run_once(Duration::from_millis(10)));
        assert_eq!(host.l2cap().link(HANDLE).map(|link| link.conn_id), Some(3));

        assert_eq!(host.run_until_idle(), 1);
        assert!(host.l2cap().link(HANDLE).is_none());
        assert!(!host.run_once(Duration::from_millis(1)));
    }

    #[test]
    fn test_receive_path_feeds_the_queue() {
        let (mut host, sink) = host();
        host.l2cap_mut()
            .link_opened(HANDLE, 0, LinkRole::Central, Duration::from_millis(30));

        // Unknown signaling command: answered with a Command Reject
        let path = host.receive_path();
        assert!(path
            .deliver(HANDLE, L2CAP_LE_SIGNALING_CID, &[0x7F, 0x01, 0x00, 0x00])
            .unwrap());
        assert_eq!(host.run_until_idle(), 1);
        assert_eq!(sink.signals().len(), 1);

        assert!(host.eatt().is_none());
        assert!(matches!(
            host.eatt_send(HANDLE, 0, vec![0x0A]),
            Err(EattError::InvalidState)
        ));
    }
}
