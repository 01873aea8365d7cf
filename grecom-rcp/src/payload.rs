use std::fmt;

use thiserror::Error;

use crate::{Code, codec::find_message, command::Frequency};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsePayloadError {
    #[error("{payload_type:?} reply is too short: need {expected} bytes, got {got}")]
    TooShort {
        payload_type: Code,
        expected: usize,
        got: usize,
    },
    #[error("expected a {expected:?} reply, got code 0x{got:x}")]
    UnexpectedCode { expected: Code, got: u8 },
    #[error("{payload_type:?} reply is not a complete frame")]
    BadFrame { payload_type: Code },
}

fn check(bytes: &[u8], payload_type: Code, expected: usize) -> Result<(), ParsePayloadError> {
    if bytes.len() < expected {
        return Err(ParsePayloadError::TooShort {
            payload_type,
            expected,
            got: bytes.len(),
        });
    }
    if bytes[1] != payload_type as u8 {
        return Err(ParsePayloadError::UnexpectedCode {
            expected: payload_type,
            got: bytes[1],
        });
    }
    // unterminated, or the sum does not match
    if find_message(bytes) != Some(bytes.len() - 1) {
        return Err(ParsePayloadError::BadFrame { payload_type });
    }
    Ok(())
}

/// What the radio's display currently shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lcd {
    pub rows: [String; 4],
    /// Signal strength bars, 0-7.
    pub rssi: u8,
    pub s_icon: bool,
    pub battery_icon_on: bool,
    pub battery_icon_blinking: bool,
    pub f_icon: bool,
    pub g_icon: bool,
    pub a_icon: bool,
    pub t_icon: bool,
    pub up_icon: bool,
    pub down_icon: bool,
    pub backlight: bool,
}

impl Lcd {
    const ROW_LEN: usize = 16;
    const ICONS: usize = 2 + 4 * Self::ROW_LEN;
    // STX code rows icons1 icons2
    const MIN_LEN: usize = Self::ICONS + 2;

    /// Decode a complete LCD reply frame, ETX and sum included.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParsePayloadError> {
        check(bytes, Code::GetLcd, Self::MIN_LEN)?;
        let row = |i: usize| {
            let start = 2 + i * Self::ROW_LEN;
            String::from_utf8_lossy(&bytes[start..start + Self::ROW_LEN]).into_owned()
        };
        let icons1 = bytes[Self::ICONS];
        let icons2 = bytes[Self::ICONS + 1];
        Ok(Self {
            rows: [row(0), row(1), row(2), row(3)],
            rssi: icons1 & 0x07,
            s_icon: icons1 & 0x08 != 0,
            battery_icon_on: icons1 & 0x10 != 0,
            battery_icon_blinking: icons1 & 0x20 != 0,
            f_icon: icons2 & 0x01 != 0,
            g_icon: icons2 & 0x02 != 0,
            a_icon: icons2 & 0x04 != 0,
            t_icon: icons2 & 0x08 != 0,
            up_icon: icons2 & 0x10 != 0,
            down_icon: icons2 & 0x20 != 0,
            backlight: icons2 & 0x40 != 0,
        })
    }
}

impl fmt::Display for Lcd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            writeln!(f, "|{row}|")?;
        }
        Ok(())
    }
}

/// Radio state as reported by the status command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub mode: u8,
    pub squelch_rf: bool,
    pub unmuted: bool,
    pub squelch_xf: bool,
    pub squelch_hd2: bool,
    pub squelch_hd5: bool,
    pub mobile: bool,
    pub backlight_dim: bool,
    /// Raw battery word; bit 15 is the charging flag.
    pub battery_level: u16,
    pub charging: bool,
    pub rssi: u16,
    pub zm: u16,
    pub led_r: u8,
    pub led_g: u8,
    pub led_b: u8,
    pub frequency: Frequency,
    /// Raw byte; see [`crate::RxMode::from_byte`].
    pub rx_mode: u8,
}

impl Status {
    const MIN_LEN: usize = 18;
    const CHARGING: u16 = 0x8000;

    /// Decode a complete status reply frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParsePayloadError> {
        check(bytes, Code::Status, Self::MIN_LEN)?;
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let flags = bytes[3];
        let battery = u16_at(4);
        Ok(Self {
            mode: bytes[2],
            squelch_rf: flags & 0x01 != 0,
            unmuted: flags & 0x02 != 0,
            squelch_xf: flags & 0x04 != 0,
            squelch_hd2: flags & 0x08 != 0,
            squelch_hd5: flags & 0x10 != 0,
            mobile: flags & 0x20 != 0,
            backlight_dim: flags & 0x40 != 0,
            battery_level: battery,
            charging: battery & Self::CHARGING != 0,
            rssi: u16_at(6),
            zm: u16_at(8),
            led_r: bytes[10],
            led_g: bytes[11],
            led_b: bytes[12],
            frequency: Frequency::from_raw(i32::from_le_bytes([
                bytes[13], bytes[14], bytes[15], bytes[16],
            ])),
            rx_mode: bytes[17],
        })
    }
}
