//! Packet view that records how far into the frame the classifier read

use std::cell::Cell;

use sipsieve_ebpf::PacketView;

pub struct RecordingFrame<'a> {
    bytes: &'a [u8],
    furthest: Cell<usize>,
}

impl<'a> RecordingFrame<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            furthest: Cell::new(0),
        }
    }

    /// One past the last byte any successful load touched.
    pub fn furthest_read(&self) -> usize {
        self.furthest.get()
    }
}

impl PacketView for RecordingFrame<'_> {
    fn frame_len(&self) -> usize {
        self.bytes.len()
    }

    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let out = self.bytes.load::<N>(offset)?;
        self.furthest.set(self.furthest.get().max(offset + N));
        Some(out)
    }
}
