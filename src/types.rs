use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

use crate::{
    error::{LionChiefError, Result},
    DEVICE_INFO_SERVICE_UUID, LIONCHIEF_NOTIFY_CHAR_UUID, LIONCHIEF_SERVICE_UUID,
    LIONCHIEF_WRITE_CHAR_UUID,
};

/// Travel direction of the locomotive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Forward travel
    Forward,
    /// Reverse travel
    Reverse,
}

impl Direction {
    /// Wire value of the direction flag
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Forward => 0x01,
            Self::Reverse => 0x02,
        }
    }

    /// `true` maps to [`Direction::Forward`]
    #[must_use]
    pub const fn from_forward(forward: bool) -> Self {
        if forward {
            Self::Forward
        } else {
            Self::Reverse
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "Forward"),
            Self::Reverse => write!(f, "Reverse"),
        }
    }
}

/// Built-in conductor announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Announcement {
    /// Device picks one at random
    Random = 0x00,
    /// "Ready to roll"
    ReadyToRoll = 0x01,
    /// "Hey there"
    HeyThere = 0x02,
    /// Squeaky wheel
    Squeaky = 0x03,
    /// "Water and fire"
    WaterAndFire = 0x04,
    /// "Fastest freight"
    FastestFreight = 0x05,
    /// "Penna flyer"
    PennaFlyer = 0x06,
}

impl Announcement {
    /// Every announcement, ordered by id
    pub const ALL: [Self; 7] = [
        Self::Random,
        Self::ReadyToRoll,
        Self::HeyThere,
        Self::Squeaky,
        Self::WaterAndFire,
        Self::FastestFreight,
        Self::PennaFlyer,
    ];

    /// Wire id of the announcement
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a raw announcement id
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::InvalidParameter`] for ids above 6.
    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.id() == id)
            .ok_or_else(|| {
                LionChiefError::InvalidParameter(format!("Unknown announcement id {id}"))
            })
    }

    /// Human readable name, as shown on the locomotive's control app
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Random => "Random",
            Self::ReadyToRoll => "Ready to Roll",
            Self::HeyThere => "Hey There",
            Self::Squeaky => "Squeaky",
            Self::WaterAndFire => "Water and Fire",
            Self::FastestFreight => "Fastest Freight",
            Self::PennaFlyer => "Penna Flyer",
        }
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Announcement {
    type Err = LionChiefError;

    /// Accepts the display name ("Ready to Roll") or the compact form ("ReadyToRoll"),
    /// ignoring case, spaces and underscores.
    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect::<String>()
            .to_lowercase();

        Self::ALL
            .into_iter()
            .find(|a| a.name().replace(' ', "").to_lowercase() == wanted)
            .ok_or_else(|| LionChiefError::InvalidParameter(format!("Unknown announcement '{s}'")))
    }
}

/// Sound source addressed by the volume command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SoundSource {
    /// Horn / whistle
    Horn = 0x01,
    /// Bell
    Bell = 0x02,
    /// Conductor speech
    Speech = 0x03,
    /// Engine chuff / diesel rumble
    Engine = 0x04,
}

impl TryFrom<u8> for SoundSource {
    type Error = LionChiefError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Horn),
            0x02 => Ok(Self::Bell),
            0x03 => Ok(Self::Speech),
            0x04 => Ok(Self::Engine),
            other => Err(LionChiefError::InvalidParameter(format!(
                "Unknown sound source {other}"
            ))),
        }
    }
}

impl fmt::Display for SoundSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Horn => write!(f, "Horn"),
            Self::Bell => write!(f, "Bell"),
            Self::Speech => write!(f, "Speech"),
            Self::Engine => write!(f, "Engine"),
        }
    }
}

/// Connectivity as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link; commands are rejected
    Disconnected,
    /// Link or discovery in progress
    Connecting,
    /// Ready for commands
    Connected,
    /// Graceful teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Internal lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Idle, no link
    Disconnected,
    /// Opening the link
    Connecting,
    /// Resolving services, subscribing and reading identity
    Discovering,
    /// Link is up and commands are dispatched
    Ready,
    /// Link dropped unexpectedly; automatic attempts pending
    Reconnecting,
    /// Graceful teardown
    Disconnecting,
}

impl SessionPhase {
    /// The observer-facing connection state for this phase
    #[must_use]
    pub const fn connection_state(self) -> ConnectionState {
        match self {
            Self::Disconnected | Self::Reconnecting => ConnectionState::Disconnected,
            Self::Connecting | Self::Discovering => ConnectionState::Connecting,
            Self::Ready => ConnectionState::Connected,
            Self::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

/// Standard Device Information Service values
///
/// Every field is best-effort; a locomotive that does not expose a value
/// simply leaves it empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Model number string
    pub model_number: Option<String>,
    /// Serial number string
    pub serial_number: Option<String>,
    /// Firmware revision string
    pub firmware_revision: Option<String>,
    /// Hardware revision string
    pub hardware_revision: Option<String>,
    /// Software revision string
    pub software_revision: Option<String>,
    /// Manufacturer name string
    pub manufacturer_name: Option<String>,
}

impl DeviceIdentity {
    /// Whether no field was populated
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.model_number.is_none()
            && self.serial_number.is_none()
            && self.firmware_revision.is_none()
            && self.hardware_revision.is_none()
            && self.software_revision.is_none()
            && self.manufacturer_name.is_none()
    }

    /// Model name with the generic fallback used for registry display
    #[must_use]
    pub fn model_or_default(&self) -> &str {
        self.model_number.as_deref().unwrap_or("LionChief Locomotive")
    }

    /// Manufacturer with the generic fallback used for registry display
    #[must_use]
    pub fn manufacturer_or_default(&self) -> &str {
        self.manufacturer_name.as_deref().unwrap_or("Lionel")
    }
}

/// Volume and pitch for one sound source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundSetting {
    /// Volume 0-7
    pub volume: u8,
    /// Pitch offset -2..=2
    pub pitch: i8,
}

impl Default for SoundSetting {
    fn default() -> Self {
        Self { volume: 5, pitch: 0 }
    }
}

/// Per-source sound settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundLevels {
    /// Horn settings
    pub horn: SoundSetting,
    /// Bell settings
    pub bell: SoundSetting,
    /// Speech settings
    pub speech: SoundSetting,
    /// Engine settings
    pub engine: SoundSetting,
}

impl SoundLevels {
    /// Settings for one source
    #[must_use]
    pub const fn get(&self, source: SoundSource) -> SoundSetting {
        match source {
            SoundSource::Horn => self.horn,
            SoundSource::Bell => self.bell,
            SoundSource::Speech => self.speech,
            SoundSource::Engine => self.engine,
        }
    }

    pub(crate) fn set(&mut self, source: SoundSource, setting: SoundSetting) {
        let slot = match source {
            SoundSource::Horn => &mut self.horn,
            SoundSource::Bell => &mut self.bell,
            SoundSource::Speech => &mut self.speech,
            SoundSource::Engine => &mut self.engine,
        };
        *slot = setting;
    }
}

/// Last known locomotive controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocomotiveState {
    /// Throttle, 0-100 percent
    pub speed_percent: u8,
    /// Travel direction
    pub direction: Direction,
    /// Headlight state
    pub lights_on: bool,
    /// Horn state
    pub horn_on: bool,
    /// Bell state
    pub bell_on: bool,
    /// Sound settings
    pub sound: SoundLevels,
}

impl Default for LocomotiveState {
    fn default() -> Self {
        Self {
            speed_percent: 0,
            direction: Direction::Forward,
            // headlights come on with track power
            lights_on: true,
            horn_on: false,
            bell_on: false,
            sound: SoundLevels::default(),
        }
    }
}

/// Telemetry reported by the locomotive
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Battery level percent
    pub battery_percent: Option<u8>,
    /// Temperature in Celsius
    pub temperature_celsius: Option<i16>,
    /// Supply voltage
    pub voltage: Option<f32>,
}

/// Why the session last left the connected path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFault {
    /// An explicit connect attempt failed
    ConnectFailed,
    /// Required service or characteristic missing
    ServiceDiscoveryFailed,
    /// Notify subscription failed
    SubscribeFailed,
    /// The link dropped while ready
    LinkLost,
    /// Automatic reconnection gave up
    ReconnectExhausted,
}

impl SessionFault {
    /// Classify a connect-path error
    #[must_use]
    pub const fn from_error(error: &LionChiefError) -> Self {
        match error {
            LionChiefError::ServiceDiscoveryFailed(_) => Self::ServiceDiscoveryFailed,
            LionChiefError::SubscribeFailed(_) => Self::SubscribeFailed,
            LionChiefError::ReconnectExhausted { .. } => Self::ReconnectExhausted,
            _ => Self::ConnectFailed,
        }
    }
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "Connect failed"),
            Self::ServiceDiscoveryFailed => write!(f, "Service discovery failed"),
            Self::SubscribeFailed => write!(f, "Subscribe failed"),
            Self::LinkLost => write!(f, "Link lost"),
            Self::ReconnectExhausted => write!(f, "Reconnect exhausted"),
        }
    }
}

/// Immutable view of a session, handed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Observer-facing connectivity
    pub connection: ConnectionState,
    /// Internal lifecycle phase
    pub phase: SessionPhase,
    /// Identity of the connected locomotive, empty while disconnected
    pub identity: DeviceIdentity,
    /// Last known controls
    pub locomotive: LocomotiveState,
    /// Last reported telemetry
    pub telemetry: Telemetry,
    /// Current automatic reconnect attempt, 0 when none is running
    pub reconnect_attempt: u32,
    /// Most recent fault, cleared on a successful connect
    pub last_fault: Option<SessionFault>,
}

impl StatusSnapshot {
    /// Whether commands are currently dispatched
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            phase: SessionPhase::Disconnected,
            identity: DeviceIdentity::default(),
            locomotive: LocomotiveState::default(),
            telemetry: Telemetry::default(),
            reconnect_attempt: 0,
            last_fault: None,
        }
    }
}

/// Validated locomotive address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    mac: String,
    service_uuid: Option<Uuid>,
}

impl DeviceAddress {
    /// Parse a `XX:XX:XX:XX:XX:XX` MAC address
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::InvalidParameter`] if the address is malformed.
    pub fn parse(mac: &str) -> Result<Self> {
        parse_mac_address(mac)?;
        Ok(Self {
            mac: mac.to_uppercase(),
            service_uuid: None,
        })
    }

    /// Override the primary service UUID for models that advertise another one
    #[must_use]
    pub const fn with_service_uuid(mut self, service_uuid: Uuid) -> Self {
        self.service_uuid = Some(service_uuid);
        self
    }

    /// Normalized upper-case MAC address
    #[must_use]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// The configured service override, if any
    #[must_use]
    pub const fn service_override(&self) -> Option<Uuid> {
        self.service_uuid
    }

    /// The primary service UUID to resolve during discovery
    #[must_use]
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid.unwrap_or(LIONCHIEF_SERVICE_UUID)
    }

    /// Address bytes, most significant first
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        // validated on construction
        parse_mac_address(&self.mac).unwrap_or_default()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mac)
    }
}

fn parse_mac_address(mac_address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac_address.split(':').collect();
    if parts.len() != 6 {
        return Err(LionChiefError::InvalidParameter(format!(
            "Invalid MAC address format: {mac_address}. Expected format: XX:XX:XX:XX:XX:XX"
        )));
    }

    let mut mac_bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LionChiefError::InvalidParameter(format!(
                "Invalid MAC address byte: {part}"
            )));
        }
        mac_bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
            LionChiefError::InvalidParameter(format!("Invalid MAC address byte: {part}"))
        })?;
    }

    Ok(mac_bytes)
}

/// Bounded automatic reconnection after an unexpected link loss
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before attempt `n` is `n * base_delay_ms`
    pub base_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
        }
    }
}

/// Session configuration, consumed read-only when the session is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Locomotive MAC address
    pub mac_address: String,
    /// Primary service override; `None` uses the LionChief default
    pub service_uuid: Option<Uuid>,
    /// Command characteristic
    pub write_characteristic_uuid: Uuid,
    /// Notification characteristic
    pub notify_characteristic_uuid: Uuid,
    /// Device Information Service
    pub device_info_service_uuid: Uuid,
    /// Bound on one connect or reconnect attempt, including discovery
    pub connect_timeout_ms: u64,
    /// Scan window used by the BLE transport to locate the address
    pub scan_timeout_ms: u64,
    /// Automatic reconnection policy
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    /// Default configuration for one locomotive
    #[must_use]
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            ..Self::default()
        }
    }

    /// Validated address including the service override
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::Config`] if the MAC address is malformed.
    pub fn address(&self) -> Result<DeviceAddress> {
        let address = DeviceAddress::parse(&self.mac_address)
            .map_err(|e| LionChiefError::Config(e.to_string()))?;
        Ok(match self.service_uuid {
            Some(uuid) => address.with_service_uuid(uuid),
            None => address,
        })
    }

    /// Check the configuration before a session is built from it
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::Config`] for a malformed address, a zero
    /// connect timeout, or write and notify characteristics that coincide.
    pub fn validate(&self) -> Result<()> {
        self.address()?;

        if self.connect_timeout_ms == 0 {
            return Err(LionChiefError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.write_characteristic_uuid == self.notify_characteristic_uuid {
            return Err(LionChiefError::Config(
                "write and notify characteristics must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mac_address: String::new(),
            service_uuid: None,
            write_characteristic_uuid: LIONCHIEF_WRITE_CHAR_UUID,
            notify_characteristic_uuid: LIONCHIEF_NOTIFY_CHAR_UUID,
            device_info_service_uuid: DEVICE_INFO_SERVICE_UUID,
            connect_timeout_ms: 10_000,
            scan_timeout_ms: 5_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_parsing() {
        let address = DeviceAddress::parse("fc:1f:c3:9f:a5:4a").unwrap();
        assert_eq!(address.mac(), "FC:1F:C3:9F:A5:4A");
        assert_eq!(address.octets(), [0xFC, 0x1F, 0xC3, 0x9F, 0xA5, 0x4A]);
        assert_eq!(address.service_uuid(), LIONCHIEF_SERVICE_UUID);

        let invalid_macs = vec![
            "12:34:56:78:9A",       // Too short
            "12:34:56:78:9A:BC:DE", // Too long
            "12:34:56:78:9A:XY",    // Invalid hex
            "12-34-56-78-9A-BC",    // Wrong separator
            "1:234:56:78:9A:BC",    // Wrong grouping
            "",                     // Empty string
        ];

        for invalid_mac in invalid_macs {
            assert!(
                DeviceAddress::parse(invalid_mac).is_err(),
                "MAC address parsing should have failed for: {invalid_mac}"
            );
        }
    }

    #[test]
    fn test_service_override() {
        let custom = Uuid::from_u128(0x1234);
        let address = DeviceAddress::parse("00:11:22:33:44:55")
            .unwrap()
            .with_service_uuid(custom);
        assert_eq!(address.service_uuid(), custom);
        assert_eq!(address.service_override(), Some(custom));
    }

    #[test]
    fn test_announcement_lookup() {
        assert_eq!(Announcement::from_id(1).unwrap(), Announcement::ReadyToRoll);
        assert_eq!(Announcement::from_id(6).unwrap(), Announcement::PennaFlyer);
        assert!(Announcement::from_id(7).is_err());

        assert_eq!(
            "Water and Fire".parse::<Announcement>().unwrap(),
            Announcement::WaterAndFire
        );
        assert_eq!(
            "fastest_freight".parse::<Announcement>().unwrap(),
            Announcement::FastestFreight
        );
        assert!("Caboose".parse::<Announcement>().is_err());
    }

    #[test]
    fn test_phase_maps_to_connection_state() {
        assert_eq!(
            SessionPhase::Reconnecting.connection_state(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            SessionPhase::Discovering.connection_state(),
            ConnectionState::Connecting
        );
        assert_eq!(
            SessionPhase::Ready.connection_state(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_reconnect_backoff_is_linear() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("FC:1F:C3:9F:A5:4A");
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(
            config.write_characteristic_uuid.to_string(),
            "08590f7e-db05-467e-8757-72f6faeb13d4"
        );
        assert_eq!(
            config.notify_characteristic_uuid.to_string(),
            "08590f7e-db05-467e-8757-72f6faeb14d3"
        );
        assert_eq!(
            config.device_info_service_uuid.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::new("not a mac").validate().is_err());

        let mut config = SessionConfig::new("FC:1F:C3:9F:A5:4A");
        config.connect_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(LionChiefError::Config(_))));

        let mut config = SessionConfig::new("FC:1F:C3:9F:A5:4A");
        config.notify_characteristic_uuid = config.write_characteristic_uuid;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_from_json() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "mac_address": "FC:1F:C3:9F:A5:4A",
                "service_uuid": "e20a39f4-73f5-4bc4-a12f-17d1ad07a961",
                "reconnect": { "max_attempts": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 2_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(
            config.address().unwrap().service_uuid(),
            LIONCHIEF_SERVICE_UUID
        );
    }

    #[test]
    fn test_default_locomotive_state() {
        let state = LocomotiveState::default();
        assert!(state.lights_on);
        assert_eq!(state.direction, Direction::Forward);
        assert_eq!(state.sound.get(SoundSource::Engine).volume, 5);
    }
}
