//! Test doubles for the runtime seams

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;
use crate::l2cap::constants::*;
use crate::l2cap::*;
use crate::runtime::{FrameSink, HeapBuffers, TimerId, TimerService};

pub const HANDLE: ConnHandle = 0x0001;

/// Frame sink that keeps everything it is asked to send
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(ConnHandle, ChannelId, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drains every recorded frame
    pub fn take(&self) -> Vec<(ConnHandle, ChannelId, Vec<u8>)> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    /// Drains the recorded frames and decodes the signaling ones
    pub fn signals(&self) -> Vec<SignalingMessage> {
        self.take()
            .into_iter()
            .filter(|(_, cid, _)| *cid == L2CAP_LE_SIGNALING_CID)
            .map(|(_, _, payload)| SignalingMessage::parse(&payload).unwrap())
            .collect()
    }

    /// Drains the recorded frames, keeping the payloads sent on `cid`
    pub fn data_on(&self, cid: ChannelId) -> Vec<Vec<u8>> {
        self.take()
            .into_iter()
            .filter(|(_, frame_cid, _)| *frame_cid == cid)
            .map(|(_, _, payload)| payload)
            .collect()
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                handle,
                cid,
                reason: "test sink failing".into(),
            });
        }

        self.frames.lock().unwrap().push((handle, cid, payload.to_vec()));
        Ok(())
    }
}

/// Timer service that only records which timers are armed
#[derive(Default)]
pub struct ManualTimers {
    active: Mutex<HashSet<TimerId>>,
    durations: Mutex<Vec<(TimerId, Duration)>>,
}

impl ManualTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.lock().unwrap().contains(&id)
    }

    pub fn active(&self) -> Vec<TimerId> {
        self.active.lock().unwrap().iter().copied().collect()
    }

    /// Every start call seen so far, oldest first
    pub fn started(&self) -> Vec<(TimerId, Duration)> {
        self.durations.lock().unwrap().clone()
    }
}

impl TimerService for ManualTimers {
    fn start(&self, id: TimerId, after: Duration) -> Result<(), TransportError> {
        self.active.lock().unwrap().insert(id);
        self.durations.lock().unwrap().push((id, after));
        Ok(())
    }

    fn stop(&self, id: TimerId) {
        self.active.lock().unwrap().remove(&id);
    }
}

/// Event callback that stores what it receives
pub fn recorder() -> (CocEventCallback, Arc<Mutex<Vec<CocEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: CocEventCallback = Arc::new(Mutex::new(move |event: CocEvent| -> L2capResult<()> {
        sink.lock().unwrap().push(event);
        Ok(())
    }));
    (callback, events)
}

pub fn take_events(events: &Arc<Mutex<Vec<CocEvent>>>) -> Vec<CocEvent> {
    std::mem::take(&mut *events.lock().unwrap())
}

/// A manager wired to test doubles
pub struct Harness {
    pub manager: L2capManager,
    pub sink: Arc<RecordingSink>,
    pub timers: Arc<ManualTimers>,
    pub buffers: Arc<HeapBuffers>,
}

impl Harness {
    pub fn new(config: L2capConfig) -> Self {
        let sink = RecordingSink::new();
        let timers = ManualTimers::new();
        let buffers = Arc::new(HeapBuffers::default());
        let manager = L2capManager::new(config, sink.clone(), timers.clone(), buffers.clone());

        Self {
            manager,
            sink,
            timers,
            buffers,
        }
    }

    /// Harness with one link open on `HANDLE`
    pub fn with_link(role: LinkRole) -> Self {
        let mut harness = Self::new(L2capConfig::default());
        harness
            .manager
            .link_opened(HANDLE, 0, role, Duration::from_millis(30));
        harness
    }

    /// Feeds a signaling PDU from the peer
    pub fn peer_signal(&mut self, message: SignalingMessage) {
        self.manager
            .handle_frame(HANDLE, L2CAP_LE_SIGNALING_CID, &message.serialize());
    }

    /// Feeds a K-frame from the peer
    pub fn peer_data(&mut self, cid: ChannelId, frame: &[u8]) {
        self.manager.handle_frame(HANDLE, cid, frame);
    }
}

/// Moves frames between two managers until both sides are quiet
pub fn shuttle(a: &mut Harness, b: &mut Harness) {
    loop {
        let from_a = a.sink.take();
        let from_b = b.sink.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }

        for (handle, cid, payload) in from_a {
            b.manager.handle_frame(handle, cid, &payload);
        }
        for (handle, cid, payload) in from_b {
            a.manager.handle_frame(handle, cid, &payload);
        }
    }
}
