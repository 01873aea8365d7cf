//! Host side of the remote control protocol (RCP) that scanner radios speak
//! over their serial port.
//!
//! Frames look like `STX code data.. ETX sum`. See [`codec`] for the
//! framing rules and [`Session`] for the command set.

pub mod codec;
pub mod command;
pub mod payload;
pub mod pending;
pub mod session;
pub mod splitter;
pub mod transport;

pub use command::{Command, Frequency, ParseFrequencyError, RxMode, build_command};
pub use payload::{Lcd, ParsePayloadError, Status};
pub use session::{Session, SessionDriver, SessionError};
pub use transport::{Transport, TransportError};

/// Length of a full memory image, in both directions.
pub const MEMORY_IMAGE_LEN: usize = 67452;

/// Every code that appears in the code position of a frame.
/// Replies carry the code of the request they answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Status = 0x41,
    DownloadRequest = 0x43,
    TransferInitiate = 0x45,
    SendKey = 0x4b,
    GetLcd = 0x4c,
    ProgramMode = 0x50,
    Tune = 0x54,
}

impl Code {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x41 => Self::Status,
            0x43 => Self::DownloadRequest,
            0x45 => Self::TransferInitiate,
            0x4b => Self::SendKey,
            0x4c => Self::GetLcd,
            0x50 => Self::ProgramMode,
            0x54 => Self::Tune,
            _ => return None,
        })
    }
}
