use std::collections::VecDeque;

use shared::protocol::OutboundFrame;

/// Frames attempted while the socket was not open, in send order.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<OutboundFrame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, frame: OutboundFrame) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundFrame> {
        self.frames.iter()
    }

    /// On failure the frame stays at the head and draining stops.
    pub fn flush<E>(
        &mut self,
        mut send: impl FnMut(&OutboundFrame) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut sent = 0;
        while let Some(frame) = self.frames.pop_front() {
            if let Err(err) = send(&frame) {
                self.frames.push_front(frame);
                return Err(err);
            }
            sent += 1;
        }
        Ok(sent)
    }
}
