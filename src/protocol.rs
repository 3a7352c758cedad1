//! LionChief wire format.
//!
//! Every command is a short fixed-layout frame written to the write
//! characteristic:
//!
//! ```text
//! ┌────────┬──────┬──────────────┬──────────┐
//! │ prefix │ code │  parameters  │ checksum │
//! │  0x00  │ (1B) │ (fixed, 1-3) │   (1B)   │
//! └────────┴──────┴──────────────┴──────────┘
//! ```
//!
//! The locomotives accept [`CHECKSUM_PLACEHOLDER`] in the checksum position.
//! No computed checksum has been confirmed against real hardware, so encode
//! always writes the placeholder and decode never validates it.

use crate::{
    error::{LionChiefError, Result},
    types::{Announcement, Direction, SoundSource},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

/// First byte of every command and notification frame
pub const FRAME_PREFIX: u8 = 0x00;

/// Value written into the checksum position of every command frame
pub const CHECKSUM_PLACEHOLDER: u8 = 0x00;

/// Highest native throttle step
pub const SPEED_STEPS: u8 = 31;

/// Shortest notification carrying any known payload
pub const MIN_NOTIFICATION_SIZE: usize = 4;

/// Notification marker for locomotive status reports
pub const NOTIFY_STATUS: u8 = 0x81;
/// Sub-marker following [`NOTIFY_STATUS`]
pub const NOTIFY_STATUS_KIND: u8 = 0x02;
/// Notification marker for battery reports
pub const NOTIFY_BATTERY: u8 = 0x64;
/// Notification marker for temperature reports
pub const NOTIFY_TEMPERATURE: u8 = 0x65;
/// Notification marker for voltage reports
pub const NOTIFY_VOLTAGE: u8 = 0x66;

const STATUS_SIZE: usize = 8;
const VOLTAGE_SIZE: usize = 5;
const TEMPERATURE_OFFSET: i16 = 40;

const FLAG_BELL: u8 = 0x02;
const FLAG_LIGHTS: u8 = 0x04;

/// Command codes understood by LionChief locomotives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Per-source volume and pitch
    SoundVolume = 0x44,
    /// Throttle step
    Speed = 0x45,
    /// Travel direction
    Direction = 0x46,
    /// Bell on/off
    Bell = 0x47,
    /// Horn on/off
    Horn = 0x48,
    /// Ask the locomotive to drop the link
    Disconnect = 0x4B,
    /// Play a conductor announcement
    Announcement = 0x4D,
    /// Headlight on/off
    Lights = 0x51,
}

impl CommandCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x44 => Some(Self::SoundVolume),
            0x45 => Some(Self::Speed),
            0x46 => Some(Self::Direction),
            0x47 => Some(Self::Bell),
            0x48 => Some(Self::Horn),
            0x4B => Some(Self::Disconnect),
            0x4D => Some(Self::Announcement),
            0x51 => Some(Self::Lights),
            _ => None,
        }
    }

    /// Number of parameter bytes this code carries
    #[must_use]
    pub const fn param_len(self) -> usize {
        match self {
            Self::Speed | Self::Direction | Self::Bell | Self::Horn | Self::Lights => 1,
            Self::Announcement | Self::Disconnect => 2,
            Self::SoundVolume => 3,
        }
    }

    /// Total frame length including prefix, code and checksum
    #[must_use]
    pub const fn frame_len(self) -> usize {
        self.param_len() + 3
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02X})", *self as u8)
    }
}

/// An encoded command ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    code: CommandCode,
    bytes: Bytes,
}

impl CommandFrame {
    /// Command code carried in byte 1
    #[must_use]
    pub const fn code(&self) -> CommandCode {
        self.code
    }

    /// Raw frame bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheaply cloneable frame bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Frame length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; frames carry at least prefix, code and checksum
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parameter bytes between code and checksum
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.bytes[2..self.bytes.len() - 1]
    }

    /// Checksum byte
    #[must_use]
    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }
}

/// Build a command frame, validating parameters against the code's fixed layout
///
/// # Errors
///
/// Returns [`LionChiefError::InvalidParameter`] if the parameter count does not
/// match the code or a value is outside its documented range.
pub fn encode(code: CommandCode, params: &[u8]) -> Result<CommandFrame> {
    if params.len() != code.param_len() {
        return Err(LionChiefError::InvalidParameter(format!(
            "{code} takes {} parameter byte(s), got {}",
            code.param_len(),
            params.len()
        )));
    }

    validate_params(code, params)?;

    let mut buf = BytesMut::with_capacity(code.frame_len());
    buf.put_u8(FRAME_PREFIX);
    buf.put_u8(code as u8);
    buf.extend_from_slice(params);
    buf.put_u8(CHECKSUM_PLACEHOLDER);

    Ok(CommandFrame {
        code,
        bytes: buf.freeze(),
    })
}

fn validate_params(code: CommandCode, params: &[u8]) -> Result<()> {
    let invalid = |what: String| -> Result<()> { Err(LionChiefError::InvalidParameter(what)) };

    match code {
        CommandCode::Speed => {
            if params[0] > SPEED_STEPS {
                return invalid(format!(
                    "Speed step {} is out of range (0 - {SPEED_STEPS})",
                    params[0]
                ));
            }
        }
        CommandCode::Direction => {
            if params[0] != Direction::Forward.code() && params[0] != Direction::Reverse.code() {
                return invalid(format!("Direction flag 0x{:02X} is not valid", params[0]));
            }
        }
        CommandCode::Bell | CommandCode::Horn | CommandCode::Lights => {
            if params[0] > 1 {
                return invalid(format!("{code} expects 0 or 1, got {}", params[0]));
            }
        }
        CommandCode::Announcement => {
            Announcement::from_id(params[0])?;
            if params[1] != 0 {
                return invalid(format!("{code} trailing byte must be zero"));
            }
        }
        CommandCode::Disconnect => {
            if params != [0, 0] {
                return invalid(format!("{code} parameters must be zero"));
            }
        }
        CommandCode::SoundVolume => {
            SoundSource::try_from(params[0])?;
            check_volume(params[1])?;
            check_pitch(i8::from_ne_bytes([params[2]]))?;
        }
    }

    Ok(())
}

pub(crate) fn check_volume(volume: u8) -> Result<()> {
    if volume > 7 {
        return Err(LionChiefError::InvalidParameter(format!(
            "Volume {volume} is out of range (0 - 7)"
        )));
    }
    Ok(())
}

pub(crate) fn check_pitch(pitch: i8) -> Result<()> {
    if !(-2..=2).contains(&pitch) {
        return Err(LionChiefError::InvalidParameter(format!(
            "Pitch {pitch} is out of range (-2 - 2)"
        )));
    }
    Ok(())
}

/// Map a throttle percentage onto the locomotive's native step
///
/// # Errors
///
/// Returns [`LionChiefError::InvalidParameter`] for percentages above 100.
pub fn speed_step(percent: u8) -> Result<u8> {
    if percent > 100 {
        return Err(LionChiefError::InvalidParameter(format!(
            "Speed {percent}% is out of range (0 - 100)"
        )));
    }
    let step = u16::from(percent) * u16::from(SPEED_STEPS) / 100;
    Ok(u8::try_from(step).unwrap_or(SPEED_STEPS))
}

/// Map a native step back onto a percentage
#[must_use]
pub fn speed_percent(step: u8) -> u8 {
    let step = step.min(SPEED_STEPS);
    let percent = u16::from(step) * 100 / u16::from(SPEED_STEPS);
    u8::try_from(percent).unwrap_or(100)
}

/// A decoded notification
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NotificationEvent {
    /// Locomotive status report
    LocomotiveStatus {
        /// Native throttle step
        speed_step: u8,
        /// Throttle as percent
        speed_percent: u8,
        /// Travel direction
        direction: Direction,
        /// Headlight state
        lights_on: bool,
        /// Bell state
        bell_on: bool,
    },
    /// Battery level report
    Battery {
        /// Level in percent
        percent: u8,
    },
    /// Temperature report
    Temperature {
        /// Degrees Celsius
        celsius: i16,
    },
    /// Supply voltage report
    Voltage {
        /// Volts
        volts: f32,
    },
}

impl NotificationEvent {
    /// Short name of the notification kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LocomotiveStatus { .. } => "status",
            Self::Battery { .. } => "battery",
            Self::Temperature { .. } => "temperature",
            Self::Voltage { .. } => "voltage",
        }
    }
}

/// Parse a notification payload
///
/// Known layouts:
/// - `00 81 02 speed direction 03 0C flags`: status (flags bit 2 lights, bit 1 bell)
/// - `00 64 level ..`: battery percent
/// - `00 65 raw ..`: temperature, `raw - 40` °C
/// - `00 66 hi lo ..`: voltage, big-endian hundredths of a volt
///
/// Trailing bytes, including any checksum, are ignored.
///
/// # Errors
///
/// Returns [`LionChiefError::MalformedFrame`] if the payload is shorter than
/// [`MIN_NOTIFICATION_SIZE`] or its markers match no known layout.
pub fn decode(data: &[u8]) -> Result<NotificationEvent> {
    if data.len() < MIN_NOTIFICATION_SIZE {
        return Err(LionChiefError::MalformedFrame(format!(
            "Notification too short: {} bytes, expected at least {MIN_NOTIFICATION_SIZE}",
            data.len()
        )));
    }

    let mut buf = data;
    let prefix = buf.get_u8();
    if prefix != FRAME_PREFIX {
        return Err(LionChiefError::MalformedFrame(format!(
            "Unexpected prefix 0x{prefix:02X}"
        )));
    }

    let marker = buf.get_u8();
    let event = match marker {
        NOTIFY_STATUS if data.len() >= STATUS_SIZE && data[2] == NOTIFY_STATUS_KIND => {
            buf.advance(1);
            let speed_step = buf.get_u8();
            let direction = Direction::from_forward(buf.get_u8() == Direction::Forward.code());
            buf.advance(2);
            let flags = buf.get_u8();
            NotificationEvent::LocomotiveStatus {
                speed_step,
                speed_percent: speed_percent(speed_step),
                direction,
                lights_on: flags & FLAG_LIGHTS != 0,
                bell_on: flags & FLAG_BELL != 0,
            }
        }
        NOTIFY_BATTERY => NotificationEvent::Battery {
            percent: buf.get_u8(),
        },
        NOTIFY_TEMPERATURE => NotificationEvent::Temperature {
            celsius: i16::from(buf.get_u8()) - TEMPERATURE_OFFSET,
        },
        NOTIFY_VOLTAGE if data.len() >= VOLTAGE_SIZE => NotificationEvent::Voltage {
            volts: f32::from(buf.get_u16()) / 100.0,
        },
        other => {
            return Err(LionChiefError::MalformedFrame(format!(
                "Unknown notification marker 0x{other:02X} ({} bytes)",
                data.len()
            )));
        }
    };

    trace!("Decoded {} notification: {:02X?}", event.kind(), data);
    Ok(event)
}
