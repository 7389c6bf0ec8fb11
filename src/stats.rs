use crate::util;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureStats {
    pub bytes_written: u64,
    pub chunks: u64,
    pub reconnects: u64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: usize) {
        self.bytes_written += bytes as u64;
        self.chunks += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "Wrote {} in {} chunks ({} reconnects)",
            util::format_bytes(self.bytes_written),
            self.chunks,
            self.reconnects
        )
    }
}
