use peerpipe_protocol::{ChunkLayout, CodecError, Metadata};

/// Pre-sized slots for every chunk of one transfer.
///
/// Created from `Metadata`, filled by index as chunks arrive (a repeated
/// index overwrites the earlier payload) and consumed by [`assemble`].
///
/// [`assemble`]: ReceiverBuffer::assemble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverBuffer {
    file_name: String,
    layout: ChunkLayout,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
    received_bytes: u64,
    highest_index: Option<u32>,
}

impl ReceiverBuffer {
    pub fn new(metadata: &Metadata) -> Result<Self, CodecError> {
        let layout = metadata.layout()?;
        Ok(Self {
            file_name: metadata.file_name.clone(),
            layout,
            slots: vec![None; layout.total_chunks() as usize],
            filled: 0,
            received_bytes: 0,
            highest_index: None,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Number of distinct indices that hold a payload.
    pub fn filled(&self) -> u32 {
        self.filled
    }

    pub fn missing(&self) -> u32 {
        self.layout.total_chunks() - self.filled
    }

    /// Bytes held across all filled slots.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Highest index stored so far.
    pub fn highest_index(&self) -> Option<u32> {
        self.highest_index
    }

    /// Stores `payload` at `index`.
    ///
    /// Returns `Ok(true)` if the slot was empty, `Ok(false)` for a duplicate.
    /// The caller checks the index range first; an out-of-range index or a
    /// wrong payload length is reported as a codec error.
    pub fn insert(&mut self, index: u32, payload: Vec<u8>) -> Result<bool, CodecError> {
        let expected = self
            .layout
            .chunk_len(index)
            .ok_or(CodecError::ChunkCountMismatch {
                declared: index,
                expected: self.layout.total_chunks(),
            })?;
        if payload.len() != expected {
            return Err(CodecError::PayloadLengthMismatch {
                index,
                expected,
                actual: payload.len(),
            });
        }

        self.highest_index = self.highest_index.max(Some(index));
        let slot = &mut self.slots[index as usize];
        let fresh = slot.is_none();
        if fresh {
            self.filled += 1;
            self.received_bytes += payload.len() as u64;
        }
        *slot = Some(payload);
        Ok(fresh)
    }

    /// Concatenates all slots in index order.
    ///
    /// Returns the number of empty slots if any chunk is missing.
    pub fn assemble(self) -> Result<Vec<u8>, u32> {
        let missing = self.missing();
        if missing > 0 {
            return Err(missing);
        }
        let mut out = Vec::with_capacity(self.layout.total_size() as usize);
        for payload in self.slots.into_iter().flatten() {
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }
}
