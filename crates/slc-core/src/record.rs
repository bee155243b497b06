//! Status records published by control nodes.
//!
//! A node owns exactly one live [`StatusRecord`], allocated by its callback at
//! startup. The channel array has a fixed cardinality decided at allocation:
//! callers can mutate channels in place through [`PublishableStatus`] but can
//! never grow or shrink it.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Maximum channel count of a high-voltage crate record.
pub const HV_MAX_CHANNELS: usize = 92;

/// Maximum link count of a readout controller record.
pub const READOUT_MAX_CHANNELS: usize = 8;

// ============================================================================
// State Codes
// ============================================================================

/// Coarse lifecycle state of a node as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    #[default]
    Offline,
    Ready,
    Running,
    Error,
}

impl NodeState {
    /// Returns the numeric code used in the wire layout.
    pub fn code(self) -> u32 {
        match self {
            Self::Offline => 0,
            Self::Ready => 1,
            Self::Running => 2,
            Self::Error => 3,
        }
    }

    /// Parses a wire code. Unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Offline),
            1 => Some(Self::Ready),
            2 => Some(Self::Running),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// State of a single hardware channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Off,
    On,
    RampUp,
    RampDown,
    Trip,
    Fault,
}

impl ChannelState {
    pub fn code(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::RampUp => 2,
            Self::RampDown => 3,
            Self::Trip => 4,
            Self::Fault => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::RampUp),
            3 => Some(Self::RampDown),
            4 => Some(Self::Trip),
            5 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Returns true if the channel has tripped or faulted.
    #[must_use]
    pub fn is_alarm(self) -> bool {
        matches!(self, Self::Trip | Self::Fault)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::On => "on",
            Self::RampUp => "ramp_up",
            Self::RampDown => "ramp_down",
            Self::Trip => "trip",
            Self::Fault => "fault",
        };
        f.write_str(s)
    }
}

/// Monitored values of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Monitored voltage.
    pub vmon: f32,
    /// Monitored current.
    pub imon: f32,
}

impl ChannelStatus {
    pub fn new(state: ChannelState, vmon: f32, imon: f32) -> Self {
        Self { state, vmon, imon }
    }
}

// ============================================================================
// Record Variants
// ============================================================================

/// Discriminant of a [`StatusRecord`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Hv,
    Readout,
}

impl RecordKind {
    /// Wire code of this kind.
    pub fn code(self) -> u16 {
        match self {
            Self::Hv => 1,
            Self::Readout => 2,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Hv),
            2 => Some(Self::Readout),
            _ => None,
        }
    }

    /// Largest channel count this variant can hold.
    pub fn max_channels(self) -> usize {
        match self {
            Self::Hv => HV_MAX_CHANNELS,
            Self::Readout => READOUT_MAX_CHANNELS,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hv => f.write_str("hv"),
            Self::Readout => f.write_str("readout"),
        }
    }
}

/// Allocation request exceeds the variant's channel capacity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} record holds at most {max} channels, requested {requested}")]
pub struct ChannelCountError {
    pub kind: RecordKind,
    pub requested: usize,
    pub max: usize,
}

fn check_channels(kind: RecordKind, requested: usize) -> Result<(), ChannelCountError> {
    let max = kind.max_channels();
    if requested > max {
        return Err(ChannelCountError {
            kind,
            requested,
            max,
        });
    }
    Ok(())
}

/// Status of a high-voltage crate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HvStatus {
    pub(crate) state: NodeState,
    pub(crate) config_id: u32,
    pub(crate) updated_at: u64,
    pub(crate) channels: Vec<ChannelStatus>,
}

impl HvStatus {
    /// Allocates an offline record with `channels` channels switched off.
    pub fn new(channels: usize) -> Result<Self, ChannelCountError> {
        check_channels(RecordKind::Hv, channels)?;
        Ok(Self {
            state: NodeState::Offline,
            config_id: 0,
            updated_at: 0,
            channels: vec![ChannelStatus::default(); channels],
        })
    }
}

/// Status of a readout controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadoutStatus {
    pub(crate) state: NodeState,
    pub(crate) config_id: u32,
    pub(crate) updated_at: u64,
    pub(crate) channels: Vec<ChannelStatus>,
    pub exp_number: u32,
    pub run_number: u32,
    pub event_count: u64,
}

impl ReadoutStatus {
    /// Allocates an offline record with `links` idle links and zeroed counters.
    pub fn new(links: usize) -> Result<Self, ChannelCountError> {
        check_channels(RecordKind::Readout, links)?;
        Ok(Self {
            state: NodeState::Offline,
            config_id: 0,
            updated_at: 0,
            channels: vec![ChannelStatus::default(); links],
            exp_number: 0,
            run_number: 0,
            event_count: 0,
        })
    }
}

/// Status record of one node. Fixed layout per variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusRecord {
    Hv(HvStatus),
    Readout(ReadoutStatus),
}

impl StatusRecord {
    /// Allocates a fresh offline record of the given kind.
    pub fn allocate(kind: RecordKind, channels: usize) -> Result<Self, ChannelCountError> {
        match kind {
            RecordKind::Hv => HvStatus::new(channels).map(Self::Hv),
            RecordKind::Readout => ReadoutStatus::new(channels).map(Self::Readout),
        }
    }

    /// Returns true if `other` has the same variant and channel count.
    #[must_use]
    pub fn same_layout(&self, other: &StatusRecord) -> bool {
        self.kind() == other.kind() && self.channels().len() == other.channels().len()
    }

    pub fn as_readout(&self) -> Option<&ReadoutStatus> {
        match self {
            Self::Readout(r) => Some(r),
            Self::Hv(_) => None,
        }
    }

    pub fn as_readout_mut(&mut self) -> Option<&mut ReadoutStatus> {
        match self {
            Self::Readout(r) => Some(r),
            Self::Hv(_) => None,
        }
    }
}

impl From<HvStatus> for StatusRecord {
    fn from(s: HvStatus) -> Self {
        Self::Hv(s)
    }
}

impl From<ReadoutStatus> for StatusRecord {
    fn from(s: ReadoutStatus) -> Self {
        Self::Readout(s)
    }
}

// ============================================================================
// Publishable Capability
// ============================================================================

/// Common view over every record variant.
pub trait PublishableStatus {
    fn kind(&self) -> RecordKind;
    fn state(&self) -> NodeState;
    fn set_state(&mut self, state: NodeState);
    fn config_id(&self) -> u32;
    fn set_config_id(&mut self, id: u32);
    fn updated_at(&self) -> u64;
    fn set_updated_at(&mut self, secs: u64);
    fn channels(&self) -> &[ChannelStatus];
    fn channels_mut(&mut self) -> &mut [ChannelStatus];

    /// Stamps the record with the current wall-clock time.
    fn touch(&mut self) {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        self.set_updated_at(now);
    }
}

macro_rules! impl_publishable {
    ($ty:ty, $kind:expr) => {
        impl PublishableStatus for $ty {
            fn kind(&self) -> RecordKind {
                $kind
            }
            fn state(&self) -> NodeState {
                self.state
            }
            fn set_state(&mut self, state: NodeState) {
                self.state = state;
            }
            fn config_id(&self) -> u32 {
                self.config_id
            }
            fn set_config_id(&mut self, id: u32) {
                self.config_id = id;
            }
            fn updated_at(&self) -> u64 {
                self.updated_at
            }
            fn set_updated_at(&mut self, secs: u64) {
                self.updated_at = secs;
            }
            fn channels(&self) -> &[ChannelStatus] {
                &self.channels
            }
            fn channels_mut(&mut self) -> &mut [ChannelStatus] {
                &mut self.channels
            }
        }
    };
}

impl_publishable!(HvStatus, RecordKind::Hv);
impl_publishable!(ReadoutStatus, RecordKind::Readout);

impl StatusRecord {
    fn inner(&self) -> &dyn PublishableStatus {
        match self {
            Self::Hv(s) => s,
            Self::Readout(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn PublishableStatus {
        match self {
            Self::Hv(s) => s,
            Self::Readout(s) => s,
        }
    }
}

impl PublishableStatus for StatusRecord {
    fn kind(&self) -> RecordKind {
        self.inner().kind()
    }
    fn state(&self) -> NodeState {
        self.inner().state()
    }
    fn set_state(&mut self, state: NodeState) {
        self.inner_mut().set_state(state);
    }
    fn config_id(&self) -> u32 {
        self.inner().config_id()
    }
    fn set_config_id(&mut self, id: u32) {
        self.inner_mut().set_config_id(id);
    }
    fn updated_at(&self) -> u64 {
        self.inner().updated_at()
    }
    fn set_updated_at(&mut self, secs: u64) {
        self.inner_mut().set_updated_at(secs);
    }
    fn channels(&self) -> &[ChannelStatus] {
        self.inner().channels()
    }
    fn channels_mut(&mut self) -> &mut [ChannelStatus] {
        self.inner_mut().channels_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for code in 0..4 {
            let state = NodeState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(NodeState::from_code(4), None);
        for code in 0..6 {
            assert_eq!(ChannelState::from_code(code).unwrap().code(), code);
        }
        assert_eq!(ChannelState::from_code(6), None);
    }

    #[test]
    fn test_allocate_respects_capacity() {
        assert!(HvStatus::new(HV_MAX_CHANNELS).is_ok());
        let err = HvStatus::new(HV_MAX_CHANNELS + 1).unwrap_err();
        assert_eq!(err.max, HV_MAX_CHANNELS);
        assert!(ReadoutStatus::new(READOUT_MAX_CHANNELS + 1).is_err());
    }

    #[test]
    fn test_new_record_is_offline() {
        let record = StatusRecord::allocate(RecordKind::Hv, 4).unwrap();
        assert_eq!(record.state(), NodeState::Offline);
        assert_eq!(record.config_id(), 0);
        assert_eq!(record.channels().len(), 4);
        assert!(record.channels().iter().all(|c| c.state == ChannelState::Off));
    }

    #[test]
    fn test_mutation_through_trait() {
        let mut record = StatusRecord::allocate(RecordKind::Readout, 2).unwrap();
        record.set_state(NodeState::Ready);
        record.set_config_id(17);
        if let Some(ch) = record.channels_mut().first_mut() {
            ch.state = ChannelState::On;
        }
        record.touch();

        assert_eq!(record.state(), NodeState::Ready);
        assert_eq!(record.config_id(), 17);
        assert_eq!(record.channels()[0].state, ChannelState::On);
        assert!(record.updated_at() > 0);
    }

    #[test]
    fn test_same_layout() {
        let hv4 = StatusRecord::allocate(RecordKind::Hv, 4).unwrap();
        let hv5 = StatusRecord::allocate(RecordKind::Hv, 5).unwrap();
        let ro4 = StatusRecord::allocate(RecordKind::Readout, 4).unwrap();
        assert!(hv4.same_layout(&hv4.clone()));
        assert!(!hv4.same_layout(&hv5));
        assert!(!hv4.same_layout(&ro4));
    }

    #[test]
    fn test_readout_accessors() {
        let mut record = StatusRecord::allocate(RecordKind::Readout, 1).unwrap();
        record.as_readout_mut().unwrap().run_number = 12;
        assert_eq!(record.as_readout().unwrap().run_number, 12);

        let hv = StatusRecord::allocate(RecordKind::Hv, 1).unwrap();
        assert!(hv.as_readout().is_none());
    }
}
