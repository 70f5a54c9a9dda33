use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::GrayImage;

use crate::types::{Frame, Timestamp};

/// A frame published for display: the raw camera image, or a detector's
/// diagnostic image when a display mode is selected.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub t: Timestamp,
    pub image: Arc<GrayImage>,
}

impl From<&Frame> for DisplayFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            t: frame.t,
            image: frame.image.clone(),
        }
    }
}

/// Sending half of the display channel. Holds its own receiver handle so a
/// full buffer can be relieved by evicting the oldest frame, which is the
/// whole point: the display prefers fresh over complete and the publisher
/// never blocks.
pub struct DisplaySender {
    tx: Sender<DisplayFrame>,
    rx: Receiver<DisplayFrame>,
}

impl DisplaySender {
    /// Publish without blocking. On a full buffer the oldest queued frame
    /// is dropped (never the new one), so a slow consumer always ends up
    /// seeing the most recent frame.
    pub fn send_latest(&self, frame: DisplayFrame) {
        let mut pending = frame;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(frame)) => {
                    // Evict one and retry; a racing consumer draining the
                    // queue just makes the retry succeed sooner.
                    let _ = self.rx.try_recv();
                    pending = frame;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// A bounded drop-oldest channel of display frames. `capacity` of 1 gives
/// the classic single-slot "most recent wins" buffer.
pub fn display_channel(capacity: usize) -> (DisplaySender, Receiver<DisplayFrame>) {
    let (tx, rx) = bounded(capacity.max(1));
    let sender = DisplaySender {
        tx,
        rx: rx.clone(),
    };
    (sender, rx)
}
