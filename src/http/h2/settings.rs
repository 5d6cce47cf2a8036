//! SETTINGS parameters (RFC 7540 Section 6.5) and the per-connection
//! table of what each side advertised
//!
//! [`SettingsTable`] keeps local values separate from the peer's: local
//! values bound what we accept, remote values bound what we send.

use super::error::{Error, ErrorCode, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use super::{MAX_ALLOWED_FRAME_SIZE, MAX_WINDOW_SIZE};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Size of one SETTINGS entry on the wire (16-bit id + 32-bit value)
pub const SETTING_ENTRY_SIZE: usize = 6;

/// Settings identifiers this engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    /// Initial send window of every stream the receiver opens or accepts
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    /// Advisory; the engine enforces its own header block limit instead
    MaxHeaderListSize = 0x6,
    /// RFC 8441
    EnableConnectProtocol = 0x8,
}

impl SettingsParameter {
    const ALL: [SettingsParameter; 7] = [
        SettingsParameter::HeaderTableSize,
        SettingsParameter::EnablePush,
        SettingsParameter::MaxConcurrentStreams,
        SettingsParameter::InitialWindowSize,
        SettingsParameter::MaxFrameSize,
        SettingsParameter::MaxHeaderListSize,
        SettingsParameter::EnableConnectProtocol,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parameter for a wire identifier; unknown identifiers yield `None`
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.as_u16() == value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
        }
    }

    fn is_flag(self) -> bool {
        matches!(
            self,
            SettingsParameter::EnablePush | SettingsParameter::EnableConnectProtocol
        )
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// A set of SETTINGS values
///
/// `None` means the parameter was not carried; the getters fall back to
/// the RFC 7540 initial values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    /// `None` is unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    /// 16384..=16777215
    pub max_frame_size: Option<u32>,
    /// `None` is unlimited
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
}

impl Settings {
    /// No parameter carried
    pub fn new() -> Self {
        Settings::default()
    }

    /// Settings every endpoint assumes for its peer before the first SETTINGS
    pub fn default_settings() -> Self {
        Settings {
            header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
            enable_push: Some(true),
            max_concurrent_streams: None,
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: None,
            enable_connect_protocol: Some(false),
        }
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Carried parameters as wire values, in identifier order
    pub fn entries(&self) -> impl Iterator<Item = (SettingsParameter, u32)> + '_ {
        SettingsParameter::ALL
            .into_iter()
            .filter_map(move |param| self.value(param).map(|value| (param, value)))
    }

    fn value(&self, param: SettingsParameter) -> Option<u32> {
        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size,
            SettingsParameter::EnablePush => self.enable_push.map(u32::from),
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => self.initial_window_size,
            SettingsParameter::MaxFrameSize => self.max_frame_size,
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size,
            SettingsParameter::EnableConnectProtocol => self.enable_connect_protocol.map(u32::from),
        }
    }

    /// Store a wire value; flags are any non-zero value
    fn store(&mut self, param: SettingsParameter, value: u32) {
        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size = Some(value),
            SettingsParameter::EnablePush => self.enable_push = Some(value != 0),
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            SettingsParameter::InitialWindowSize => self.initial_window_size = Some(value),
            SettingsParameter::MaxFrameSize => self.max_frame_size = Some(value),
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size = Some(value),
            SettingsParameter::EnableConnectProtocol => {
                self.enable_connect_protocol = Some(value != 0)
            }
        }
    }

    /// Check ranges; errors carry the code RFC 7540 assigns to the setting
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size.filter(|&size| size > MAX_WINDOW_SIZE) {
            return Err(Error::InvalidSettings(
                ErrorCode::FlowControlError,
                format!("INITIAL_WINDOW_SIZE {} exceeds 2^31-1", size),
            ));
        }
        if let Some(size) = self
            .max_frame_size
            .filter(|size| !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(size))
        {
            return Err(Error::InvalidSettings(
                ErrorCode::ProtocolError,
                format!("MAX_FRAME_SIZE {} outside 16384..=16777215", size),
            ));
        }
        Ok(())
    }

    /// Overlay every parameter `other` carries onto `self`
    pub fn merge(&mut self, other: &Settings) {
        for (param, value) in other.entries() {
            self.store(param, value);
        }
    }

    /// Parse a SETTINGS payload
    ///
    /// Unknown identifiers are skipped (RFC 7540 Section 6.5.2). Flag
    /// parameters must be 0 or 1. Later entries override earlier ones.
    pub fn decode_payload(payload: &[u8]) -> Result<Settings> {
        if payload.len() % SETTING_ENTRY_SIZE != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for entry in payload.chunks_exact(SETTING_ENTRY_SIZE) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            let Some(param) = SettingsParameter::from_u16(id) else {
                continue;
            };
            if param.is_flag() && value > 1 {
                return Err(Error::InvalidSettings(
                    ErrorCode::ProtocolError,
                    format!("{} must be 0 or 1, got {}", param.name(), value),
                ));
            }
            settings.store(param, value);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Append one entry per carried parameter
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        for (param, value) in self.entries() {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        }
    }

    /// Number of bytes `encode_payload` will produce
    pub fn payload_len(&self) -> usize {
        self.entries().count() * SETTING_ENTRY_SIZE
    }
}

/// Chained construction of a validated [`Settings`]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Fails when a value is out of range
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes a freshly applied peer SETTINGS frame requires elsewhere
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDelta {
    /// Signed change of INITIAL_WINDOW_SIZE, to apply to every open
    /// stream's send window
    pub initial_window_delta: i64,
    /// New peer HEADER_TABLE_SIZE, if it changed
    pub header_table_size: Option<u32>,
    /// New peer MAX_CONCURRENT_STREAMS, if carried
    pub max_concurrent_streams: Option<u32>,
}

/// Per-connection settings state
///
/// `local` is what this side advertised (in effect as soon as it is
/// sent), `remote` is what the peer has advertised so far.
#[derive(Debug, Clone)]
pub struct SettingsTable {
    local: Settings,
    remote: Settings,
    pending_acks: usize,
}

impl SettingsTable {
    /// Peer values start at the RFC 7540 initial values
    pub fn new(local: Settings) -> Self {
        SettingsTable {
            local,
            remote: Settings::default_settings(),
            pending_acks: 0,
        }
    }

    /// Settings this side advertises
    pub fn local(&self) -> &Settings {
        &self.local
    }

    /// Settings the peer has advertised
    pub fn remote(&self) -> &Settings {
        &self.remote
    }

    /// Record that our SETTINGS went out and an ACK is now owed
    pub fn local_sent(&mut self) {
        self.pending_acks += 1;
    }

    /// Whether we still wait for the peer to ACK our SETTINGS
    pub fn awaiting_ack(&self) -> bool {
        self.pending_acks > 0
    }

    /// Handle a SETTINGS ACK from the peer
    pub fn acknowledge(&mut self) -> Result<()> {
        if self.pending_acks == 0 {
            return Err(Error::Protocol(
                "SETTINGS ACK received with no SETTINGS outstanding".to_string(),
            ));
        }
        self.pending_acks -= 1;
        Ok(())
    }

    /// Validate and apply the peer's SETTINGS
    ///
    /// Either every parameter is applied, or the table is left untouched.
    pub fn apply(&mut self, incoming: &Settings) -> Result<SettingsDelta> {
        self.apply_with(incoming, |_| Ok(()))
    }

    /// Like [`apply`](Self::apply), running `adjust` on the delta before
    /// committing
    ///
    /// When `adjust` fails the table is left untouched, so state kept
    /// elsewhere can change in the same step as the table.
    pub fn apply_with<F>(&mut self, incoming: &Settings, adjust: F) -> Result<SettingsDelta>
    where
        F: FnOnce(&SettingsDelta) -> Result<()>,
    {
        incoming.validate()?;

        let mut next = self.remote.clone();
        next.merge(incoming);

        let delta = SettingsDelta {
            initial_window_delta: next.get_initial_window_size() as i64
                - self.remote.get_initial_window_size() as i64,
            header_table_size: changed(
                self.remote.get_header_table_size(),
                next.get_header_table_size(),
            ),
            max_concurrent_streams: incoming.max_concurrent_streams,
        };

        adjust(&delta)?;
        self.remote = next;
        Ok(delta)
    }
}

fn changed(old: u32, new: u32) -> Option<u32> {
    if old != new {
        Some(new)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_parameter_conversion() {
        assert_eq!(SettingsParameter::HeaderTableSize.as_u16(), 0x1);
        assert_eq!(SettingsParameter::EnablePush.as_u16(), 0x2);

        assert_eq!(
            SettingsParameter::from_u16(0x4),
            Some(SettingsParameter::InitialWindowSize)
        );
        assert_eq!(SettingsParameter::from_u16(0xff), None);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default_settings();
        assert_eq!(settings.get_header_table_size(), 4096);
        assert!(settings.get_enable_push());
        assert_eq!(settings.get_initial_window_size(), 65535);
        assert_eq!(settings.get_max_frame_size(), 16384);
    }

    #[test]
    fn test_settings_validation() {
        let settings = SettingsBuilder::new()
            .initial_window_size(0x80000000)
            .build();
        assert!(matches!(
            settings,
            Err(Error::InvalidSettings(ErrorCode::FlowControlError, _))
        ));

        let settings = SettingsBuilder::new().max_frame_size(1024).build();
        assert!(matches!(
            settings,
            Err(Error::InvalidSettings(ErrorCode::ProtocolError, _))
        ));

        let settings = SettingsBuilder::new().max_frame_size(16777216).build();
        assert!(settings.is_err());
    }

    #[test]
    fn test_payload_round_trip() {
        let settings = SettingsBuilder::new()
            .enable_push(false)
            .max_concurrent_streams(100)
            .initial_window_size(1 << 20)
            .build()
            .unwrap();

        let mut buf = BytesMut::new();
        settings.encode_payload(&mut buf);
        assert_eq!(buf.len(), 18);
        assert_eq!(settings.payload_len(), 18);

        let decoded = Settings::decode_payload(&buf).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_entries_and_merge() {
        let settings = SettingsBuilder::new()
            .max_frame_size(32768)
            .enable_push(false)
            .build()
            .unwrap();
        let entries: Vec<_> = settings.entries().collect();
        assert_eq!(
            entries,
            [
                (SettingsParameter::EnablePush, 0),
                (SettingsParameter::MaxFrameSize, 32768),
            ]
        );

        let mut merged = Settings::default_settings();
        merged.merge(&settings);
        assert!(!merged.get_enable_push());
        assert_eq!(merged.get_max_frame_size(), 32768);
        assert_eq!(merged.get_initial_window_size(), 65535);
    }

    #[test]
    fn test_decode_rejects_bad_length_and_values() {
        assert!(matches!(
            Settings::decode_payload(&[0u8; 7]),
            Err(Error::FrameSize(_))
        ));

        // ENABLE_PUSH = 2
        let payload = [0x00, 0x02, 0x00, 0x00, 0x00, 0x02];
        let err = Settings::decode_payload(&payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        // Unknown identifier is ignored
        let payload = [0x00, 0x99, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(Settings::decode_payload(&payload).unwrap(), Settings::new());
    }

    #[test]
    fn test_table_apply_reports_window_delta() {
        let mut table = SettingsTable::new(Settings::new());
        let incoming = SettingsBuilder::new()
            .initial_window_size(100_000)
            .max_frame_size(32768)
            .build()
            .unwrap();

        let delta = table.apply(&incoming).unwrap();
        assert_eq!(delta.initial_window_delta, 100_000 - 65535);
        assert_eq!(delta.header_table_size, None);
        assert_eq!(table.remote().get_initial_window_size(), 100_000);
        assert_eq!(table.remote().get_max_frame_size(), 32768);

        let shrink = SettingsBuilder::new()
            .initial_window_size(1000)
            .header_table_size(0)
            .build()
            .unwrap();
        let delta = table.apply(&shrink).unwrap();
        assert_eq!(delta.initial_window_delta, 1000 - 100_000);
        assert_eq!(delta.header_table_size, Some(0));
    }

    #[test]
    fn test_failed_adjust_leaves_table_untouched() {
        let mut table = SettingsTable::new(Settings::new());
        let incoming = SettingsBuilder::new()
            .initial_window_size(100_000)
            .build()
            .unwrap();

        let result = table.apply_with(&incoming, |delta| {
            assert_eq!(delta.initial_window_delta, 100_000 - 65535);
            Err(Error::FlowControl("window overflow".to_string()))
        });
        assert!(matches!(result, Err(Error::FlowControl(_))));
        assert_eq!(table.remote(), &Settings::default_settings());
    }

    #[test]
    fn test_table_apply_is_atomic() {
        let mut table = SettingsTable::new(Settings::new());
        let bad = Settings {
            max_concurrent_streams: Some(10),
            max_frame_size: Some(10),
            ..Settings::new()
        };
        assert!(table.apply(&bad).is_err());
        assert_eq!(table.remote(), &Settings::default_settings());
    }

    #[test]
    fn test_table_ack_tracking() {
        let mut table = SettingsTable::new(Settings::new());
        assert!(table.acknowledge().is_err());

        table.local_sent();
        assert!(table.awaiting_ack());
        table.acknowledge().unwrap();
        assert!(!table.awaiting_ack());
        assert!(table.acknowledge().is_err());
    }
}
