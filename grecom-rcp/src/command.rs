use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{Code, codec::pack};

/// Demodulation used when tuning a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RxMode {
    Am = 0,
    Fm = 1,
    #[default]
    Auto = 2,
}

impl RxMode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Am,
            1 => Self::Fm,
            2 => Self::Auto,
            _ => return None,
        })
    }
}

/// A channel frequency in the radio's own integer unit.
///
/// The radio reads the first nine significant digits of the frequency as
/// written in MHz: "123.456" is sent as 123456000. Status replies carry the
/// same field, which reads back as the value times 1e-6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frequency(i32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseFrequencyError {
    #[error("empty frequency")]
    Empty,
    #[error("invalid frequency {0:?}; expected digits with an optional decimal point")]
    Invalid(String),
}

impl Frequency {
    const SIGNIFICANT_DIGITS: usize = 9;

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl FromStr for Frequency {
    type Err = ParseFrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ParseFrequencyError::Empty);
        }
        let all_digits = int_part
            .bytes()
            .chain(frac_part.bytes())
            .all(|b| b.is_ascii_digit());
        if !all_digits {
            return Err(ParseFrequencyError::Invalid(s.to_owned()));
        }

        let mut digits = int_part
            .bytes()
            .chain(frac_part.bytes())
            .map(|b| u64::from(b - b'0'))
            .skip_while(|d| *d == 0);
        let mut value = 0u64;
        for _ in 0..Self::SIGNIFICANT_DIGITS {
            value = value * 10 + digits.next().unwrap_or(0);
        }
        if digits.next().is_some_and(|d| d >= 5) {
            value += 1;
        }
        // rounding 999999999.5 up carries into a tenth digit
        if value >= 10u64.pow(Self::SIGNIFICANT_DIGITS as u32) {
            value /= 10;
        }
        Ok(Self(value as i32))
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let (whole, frac) = (abs / 1_000_000, abs % 1_000_000);
        if frac == 0 {
            return write!(f, "{sign}{whole}");
        }
        let frac = format!("{frac:06}");
        write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
    }
}

/// A request to the radio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Emulate a key press.
    SendKey { key: u8 },
    Tune { frequency: Frequency, rx_mode: RxMode },
    GetLcd,
    GetStatus,
    /// First step of a memory download.
    DownloadRequest,
    /// Switch to programming mode for a download.
    PrepareDownload,
    /// Switch to programming mode for an upload. The radio answers with a
    /// bare 0x45 once it is ready for the image.
    PrepareUpload,
    /// Start streaming the memory image.
    TransferInitiate,
}

impl Command {
    const PROGRAM_READ: u8 = 0x01;
    const PROGRAM_WRITE: u8 = 0x03;

    pub fn code(&self) -> Code {
        match self {
            Self::SendKey { .. } => Code::SendKey,
            Self::Tune { .. } => Code::Tune,
            Self::GetLcd => Code::GetLcd,
            Self::GetStatus => Code::Status,
            Self::DownloadRequest => Code::DownloadRequest,
            Self::PrepareDownload | Self::PrepareUpload => Code::ProgramMode,
            Self::TransferInitiate => Code::TransferInitiate,
        }
    }

    /// Code of the framed reply this command gets, if any.
    pub fn response_code(&self) -> Option<Code> {
        match self {
            Self::GetLcd | Self::GetStatus => Some(self.code()),
            _ => None,
        }
    }

    fn data(&self) -> Vec<u8> {
        match self {
            Self::SendKey { key } => vec![*key],
            Self::Tune {
                frequency,
                rx_mode,
            } => {
                let mut out = frequency.to_le_bytes().to_vec();
                out.push(*rx_mode as u8);
                out
            }
            Self::GetLcd | Self::GetStatus | Self::TransferInitiate => vec![],
            Self::DownloadRequest => vec![0x00],
            Self::PrepareDownload => vec![Self::PROGRAM_READ],
            Self::PrepareUpload => vec![Self::PROGRAM_WRITE],
        }
    }

    /// Code followed by data, i.e. the frame contents between STX and ETX.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data = self.data();
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(self.code() as u8);
        out.extend(data);
        out
    }
}

/// Build the complete frame for `command`.
pub fn build_command(command: &Command) -> Vec<u8> {
    pack(&command.to_bytes())
}
