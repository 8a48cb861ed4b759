//! Upper layer that records everything it is handed

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use acx_wlan::{FlowState, FrameSink, RxMeta};

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(Vec<u8>, RxMeta)>>,
    flow: Mutex<Vec<FlowState>>,
    scans: AtomicUsize,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<(Vec<u8>, RxMeta)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn flow_events(&self) -> Vec<FlowState> {
        self.flow.lock().unwrap().clone()
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn on_rx_frame(&self, frame: &[u8], meta: RxMeta) {
        self.frames.lock().unwrap().push((frame.to_vec(), meta));
    }

    fn on_tx_flow(&self, state: FlowState) {
        self.flow.lock().unwrap().push(state);
    }

    fn on_scan_complete(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }
}
