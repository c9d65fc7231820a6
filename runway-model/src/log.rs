use serde::{Deserialize, Serialize};

use crate::ids::JobId;

/// Marker byte that closes a phase's output; tailing stops here.
pub const END_OF_STREAM: u8 = 0x03;

/// A contiguous window of a phase's log stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSlice {
    pub job_id: JobId,
    /// Offset of `data[0]` within the stream.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Stream length at the time of the read.
    pub stream_length: u64,
    /// Whether the stream has been closed with [`END_OF_STREAM`].
    pub closed: bool,
}

impl LogSlice {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// More bytes exist past this slice, or may still be appended.
    pub fn more_available(&self) -> bool {
        self.end_offset() < self.stream_length || !self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_streams_always_have_more() {
        let slice = LogSlice {
            job_id: JobId::new(),
            offset: 0,
            data: b"abc".to_vec(),
            stream_length: 3,
            closed: false,
        };
        assert!(slice.more_available());
    }

    #[test]
    fn closed_stream_read_to_end_has_no_more() {
        let slice = LogSlice {
            job_id: JobId::new(),
            offset: 2,
            data: vec![b'c', END_OF_STREAM],
            stream_length: 4,
            closed: true,
        };
        assert_eq!(slice.end_offset(), 4);
        assert!(!slice.more_available());
    }
}
