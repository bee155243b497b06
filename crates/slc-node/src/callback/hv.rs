//! High-voltage crate callback.

use async_trait::async_trait;
use tracing::{info, warn};

use slc_core::{
    ChannelState, Command, CommandAck, CommandError, CommandResult, NodeIdentity, NodeState,
    PublishableStatus, RecordKind, StatusRecord,
};

use super::{apply_common_verb, require_state, ControlCallback};
use crate::error::CallbackError;
use crate::hardware::{MonitorReading, MonitorSource};

/// Callback for high-voltage crates.
///
/// Verbs: `turnon` (READY to RUNNING, channels on), `turnoff` (to READY,
/// channels off) plus the common verbs. `reset` switches the outputs off
/// before the record goes OFFLINE. A tripped or faulted channel while
/// RUNNING moves the node to ERROR.
pub struct HvCallback {
    monitor: Box<dyn MonitorSource>,
    channels: usize,
}

impl HvCallback {
    pub fn new(monitor: Box<dyn MonitorSource>, channels: usize) -> Self {
        Self { monitor, channels }
    }

    async fn read(&mut self) -> Result<MonitorReading, CallbackError> {
        let reading = self.monitor.read_monitor(self.channels).await?;
        if reading.channels.len() != self.channels {
            return Err(CallbackError::BadData(format!(
                "expected {} channels, monitor returned {}",
                self.channels,
                reading.channels.len()
            )));
        }
        Ok(reading)
    }

    async fn switch(&mut self, command: &Command, on: bool) -> Result<(), CommandError> {
        self.monitor
            .set_output(on)
            .await
            .map_err(|e| CommandError::failed(format!("{}: {e}", command.verb)))
    }

    /// Switches every output off and marks the channels accordingly.
    async fn switch_off(
        &mut self,
        command: &Command,
        record: &mut StatusRecord,
    ) -> Result<(), CommandError> {
        self.switch(command, false).await?;
        for ch in record.channels_mut() {
            ch.state = ChannelState::Off;
        }
        Ok(())
    }
}

/// Whether any output may still be live.
fn outputs_live(record: &StatusRecord) -> bool {
    record.state() == NodeState::Running
        || record.channels().iter().any(|c| c.state == ChannelState::On)
}

/// Copies readings into the record; alarm states from hardware win over
/// the commanded channel state.
fn merge(record: &mut StatusRecord, reading: &MonitorReading) {
    for (ch, read) in record.channels_mut().iter_mut().zip(&reading.channels) {
        ch.vmon = read.vmon;
        ch.imon = read.imon;
        if read.state.is_alarm() {
            ch.state = read.state;
        }
    }
}

#[async_trait]
impl ControlCallback for HvCallback {
    fn kind(&self) -> RecordKind {
        RecordKind::Hv
    }

    async fn on_initialize(
        &mut self,
        identity: &NodeIdentity,
    ) -> Result<StatusRecord, CallbackError> {
        let mut record = StatusRecord::allocate(RecordKind::Hv, self.channels)?;
        let reading = self.read().await?;
        merge(&mut record, &reading);
        record.touch();
        info!(
            node = %identity,
            channels = self.channels,
            monitor = %self.monitor.describe(),
            "HV node initialized"
        );
        Ok(record)
    }

    async fn on_tick(&mut self, record: &mut StatusRecord) -> Result<(), CallbackError> {
        let reading = self.read().await?;
        merge(record, &reading);

        let alarms = record.channels().iter().filter(|c| c.state.is_alarm()).count();
        if alarms > 0 && record.state() == NodeState::Running {
            warn!(alarms, "Channel alarm, node goes to ERROR");
            record.set_state(NodeState::Error);
        }
        record.touch();
        Ok(())
    }

    async fn on_command(&mut self, command: &Command, record: &mut StatusRecord) -> CommandResult {
        // A reset from RUNNING must not leave the crate at voltage
        if command.verb == "reset" {
            self.switch_off(command, record).await?;
        }
        if let Some(result) = apply_common_verb(command, record) {
            return result;
        }

        match command.verb.as_str() {
            "turnon" => {
                require_state(command, record, &[NodeState::Ready])?;
                self.switch(command, true).await?;
                for ch in record.channels_mut() {
                    ch.state = ChannelState::On;
                }
                record.set_state(NodeState::Running);
                Ok(CommandAck::with_message(format!("{} channels on", self.channels)))
            }
            "turnoff" => {
                require_state(command, record, &[NodeState::Ready, NodeState::Running])?;
                self.switch_off(command, record).await?;
                record.set_state(NodeState::Ready);
                Ok(CommandAck::ok())
            }
            _ => Err(CommandError::unsupported(command)),
        }
    }

    async fn on_terminate(&mut self, record: &mut StatusRecord) {
        if outputs_live(record) {
            if let Err(e) = self.monitor.set_output(false).await {
                warn!(error = %e, "Failed to switch outputs off on shutdown");
            }
        }
    }
}
