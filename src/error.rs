use crate::bpf::filter::Label;

#[derive(Debug, thiserror::Error)]
pub enum NhrpError {
    #[error("buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("PDU of {0} bytes does not fit the 16-bit length field")]
    PacketTooLarge(usize),
    #[error("extension slot {0} is not a valid extension type")]
    InvalidExtension(usize),
    #[error("address of {len} bytes exceeds the {max} byte limit")]
    AddressTooLong { len: usize, max: usize },
    #[error("filter code buffer too small (code actual length {count}, limit {max})")]
    CapacityExceeded { count: usize, max: usize },
    #[error("BUG: branch to label {0:?} which was never marked")]
    UnresolvedLabel(Label),
    #[error("BUG: jump from instruction {from} to {to} is not a forward jump")]
    JumpOutOfRange { from: usize, to: usize },
    #[error("SO_ATTACH_FILTER failed: {0}")]
    InstallFailed(#[source] std::io::Error),
    #[error("PF_PACKET returned EOF")]
    CaptureEof,
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("capture device is not open")]
    NotOpen,
    #[error("unknown interface index {0}")]
    UnknownInterface(u32),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
    #[error("event loop error: {0}")]
    EventLoop(#[source] std::io::Error),
}

impl NhrpError {
    /// Errors after which the capture path cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NhrpError::CaptureEof | NhrpError::CaptureDevice(_) | NhrpError::EventLoop(_)
        )
    }
}
