use crate::{
    error::Result,
    protocol::{self, CommandCode, CommandFrame},
    types::{Announcement, Direction, LocomotiveState, SoundSetting, SoundSource},
};
use std::fmt;

/// Logical locomotive operations
///
/// Each command resolves to exactly one [`CommandFrame`] without touching the
/// transport, so parameter errors surface before anything is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Throttle, 0-100 percent
    SetSpeed(u8),
    /// Travel direction
    SetDirection(Direction),
    /// Headlight on/off
    SetLights(bool),
    /// Horn on/off
    SetHorn(bool),
    /// Bell on/off
    SetBell(bool),
    /// Immediate stop, dispatched ahead of every queued command
    EmergencyStop,
    /// One-shot conductor announcement
    PlayAnnouncement(Announcement),
    /// Ask the locomotive to drop the link, then tear the session down
    Disconnect,
    /// Volume (0-7) and pitch (-2..=2) for one sound source
    SetSoundVolume {
        /// Addressed source
        source: SoundSource,
        /// Volume 0-7
        volume: u8,
        /// Pitch offset -2..=2
        pitch: i8,
    },
}

impl Command {
    /// Command code written in byte 1 of the frame
    #[must_use]
    pub const fn code(&self) -> CommandCode {
        match self {
            Self::SetSpeed(_) | Self::EmergencyStop => CommandCode::Speed,
            Self::SetDirection(_) => CommandCode::Direction,
            Self::SetLights(_) => CommandCode::Lights,
            Self::SetHorn(_) => CommandCode::Horn,
            Self::SetBell(_) => CommandCode::Bell,
            Self::PlayAnnouncement(_) => CommandCode::Announcement,
            Self::Disconnect => CommandCode::Disconnect,
            Self::SetSoundVolume { .. } => CommandCode::SoundVolume,
        }
    }

    /// Encode the command
    ///
    /// # Errors
    ///
    /// Returns [`crate::LionChiefError::InvalidParameter`] if a value is outside
    /// its documented range (speed above 100, volume above 7, pitch outside -2..=2).
    pub fn to_frame(&self) -> Result<CommandFrame> {
        match *self {
            Self::SetSpeed(percent) => {
                protocol::encode(CommandCode::Speed, &[protocol::speed_step(percent)?])
            }
            Self::EmergencyStop => protocol::encode(CommandCode::Speed, &[0]),
            Self::SetDirection(direction) => {
                protocol::encode(CommandCode::Direction, &[direction.code()])
            }
            Self::SetLights(on) => protocol::encode(CommandCode::Lights, &[u8::from(on)]),
            Self::SetHorn(on) => protocol::encode(CommandCode::Horn, &[u8::from(on)]),
            Self::SetBell(on) => protocol::encode(CommandCode::Bell, &[u8::from(on)]),
            Self::PlayAnnouncement(announcement) => {
                protocol::encode(CommandCode::Announcement, &[announcement.id(), 0x00])
            }
            Self::Disconnect => protocol::encode(CommandCode::Disconnect, &[0x00, 0x00]),
            Self::SetSoundVolume {
                source,
                volume,
                pitch,
            } => {
                protocol::check_volume(volume)?;
                protocol::check_pitch(pitch)?;
                protocol::encode(
                    CommandCode::SoundVolume,
                    &[source as u8, volume, pitch.to_ne_bytes()[0]],
                )
            }
        }
    }

    /// Whether the command jumps ahead of queued commands
    #[must_use]
    pub const fn is_priority(&self) -> bool {
        matches!(self, Self::EmergencyStop)
    }

    /// Fold the effect of a successfully written command into the tracked state
    pub fn apply_to(&self, state: &mut LocomotiveState) {
        match *self {
            Self::SetSpeed(percent) => state.speed_percent = percent.min(100),
            Self::EmergencyStop => state.speed_percent = 0,
            Self::SetDirection(direction) => state.direction = direction,
            Self::SetLights(on) => state.lights_on = on,
            Self::SetHorn(on) => state.horn_on = on,
            Self::SetBell(on) => state.bell_on = on,
            Self::SetSoundVolume {
                source,
                volume,
                pitch,
            } => state.sound.set(source, SoundSetting { volume, pitch }),
            Self::PlayAnnouncement(_) | Self::Disconnect => {}
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetSpeed(percent) => write!(f, "SetSpeed({percent}%)"),
            Self::SetDirection(direction) => write!(f, "SetDirection({direction})"),
            Self::SetLights(on) => write!(f, "SetLights({on})"),
            Self::SetHorn(on) => write!(f, "SetHorn({on})"),
            Self::SetBell(on) => write!(f, "SetBell({on})"),
            Self::EmergencyStop => write!(f, "EmergencyStop"),
            Self::PlayAnnouncement(announcement) => write!(f, "PlayAnnouncement({announcement})"),
            Self::Disconnect => write!(f, "Disconnect"),
            Self::SetSoundVolume {
                source,
                volume,
                pitch,
            } => write!(f, "SetSoundVolume({source}, volume {volume}, pitch {pitch})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LionChiefError;

    #[test]
    fn test_speed_command() {
        let frame = Command::SetSpeed(50).to_frame().unwrap();
        assert_eq!(frame.as_bytes(), &[0x00, 0x45, 15, 0x00]);

        let frame = Command::SetSpeed(100).to_frame().unwrap();
        assert_eq!(frame.params(), &[31]);

        assert!(matches!(
            Command::SetSpeed(101).to_frame(),
            Err(LionChiefError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_emergency_stop_is_speed_zero() {
        let stop = Command::EmergencyStop.to_frame().unwrap();
        assert_eq!(stop, Command::SetSpeed(0).to_frame().unwrap());
        assert!(Command::EmergencyStop.is_priority());
        assert!(!Command::SetSpeed(0).is_priority());
    }

    #[test]
    fn test_direction_command() {
        let forward = Command::SetDirection(Direction::Forward).to_frame().unwrap();
        assert_eq!(forward.as_bytes(), &[0x00, 0x46, 0x01, 0x00]);

        let reverse = Command::SetDirection(Direction::Reverse).to_frame().unwrap();
        assert_eq!(reverse.as_bytes(), &[0x00, 0x46, 0x02, 0x00]);
    }

    #[test]
    fn test_toggle_commands() {
        assert_eq!(
            Command::SetLights(true).to_frame().unwrap().as_bytes(),
            &[0x00, 0x51, 0x01, 0x00]
        );
        assert_eq!(
            Command::SetHorn(false).to_frame().unwrap().as_bytes(),
            &[0x00, 0x48, 0x00, 0x00]
        );
        assert_eq!(
            Command::SetBell(true).to_frame().unwrap().as_bytes(),
            &[0x00, 0x47, 0x01, 0x00]
        );
    }

    #[test]
    fn test_announcement_frames() {
        for announcement in Announcement::ALL {
            let frame = Command::PlayAnnouncement(announcement).to_frame().unwrap();
            assert_eq!(
                frame.as_bytes(),
                &[0x00, 0x4D, announcement.id(), 0x00, 0x00]
            );
        }
    }

    #[test]
    fn test_disconnect_frame() {
        let frame = Command::Disconnect.to_frame().unwrap();
        assert_eq!(frame.as_bytes(), &[0x00, 0x4B, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_sound_volume_command() {
        let frame = Command::SetSoundVolume {
            source: SoundSource::Bell,
            volume: 7,
            pitch: -1,
        }
        .to_frame()
        .unwrap();
        assert_eq!(frame.as_bytes(), &[0x00, 0x44, 0x02, 0x07, 0xFF, 0x00]);

        let too_loud = Command::SetSoundVolume {
            source: SoundSource::Horn,
            volume: 8,
            pitch: 0,
        };
        assert!(too_loud.to_frame().is_err());

        let too_high = Command::SetSoundVolume {
            source: SoundSource::Horn,
            volume: 3,
            pitch: 3,
        };
        assert!(too_high.to_frame().is_err());
    }

    #[test]
    fn test_apply_to_state() {
        let mut state = LocomotiveState::default();

        Command::SetSpeed(40).apply_to(&mut state);
        Command::SetDirection(Direction::Reverse).apply_to(&mut state);
        Command::SetHorn(true).apply_to(&mut state);
        Command::SetSoundVolume {
            source: SoundSource::Engine,
            volume: 2,
            pitch: 1,
        }
        .apply_to(&mut state);

        assert_eq!(state.speed_percent, 40);
        assert_eq!(state.direction, Direction::Reverse);
        assert!(state.horn_on);
        assert_eq!(
            state.sound.get(SoundSource::Engine),
            SoundSetting {
                volume: 2,
                pitch: 1
            }
        );

        Command::EmergencyStop.apply_to(&mut state);
        assert_eq!(state.speed_percent, 0);
    }
}
