//! Readout controller callback.

use async_trait::async_trait;
use tracing::info;

use slc_core::{
    Command, CommandAck, CommandError, CommandResult, NodeIdentity, NodeState, PublishableStatus,
    RecordKind, StatusRecord,
};

use super::{apply_common_verb, require_state, ControlCallback};
use crate::error::CallbackError;
use crate::hardware::MonitorSource;

/// Callback for readout controllers.
///
/// Verbs: `start <exp> <run>` (READY to RUNNING, counters reset) and `stop`
/// (RUNNING to READY) plus the common verbs. While RUNNING each tick adds
/// the hardware counter's advance to `event_count`.
pub struct ReadoutCallback {
    monitor: Box<dyn MonitorSource>,
    links: usize,
    last_counter: Option<u64>,
}

impl ReadoutCallback {
    pub fn new(monitor: Box<dyn MonitorSource>, links: usize) -> Self {
        Self {
            monitor,
            links,
            last_counter: None,
        }
    }
}

#[async_trait]
impl ControlCallback for ReadoutCallback {
    fn kind(&self) -> RecordKind {
        RecordKind::Readout
    }

    async fn on_initialize(
        &mut self,
        identity: &NodeIdentity,
    ) -> Result<StatusRecord, CallbackError> {
        let mut record = StatusRecord::allocate(RecordKind::Readout, self.links)?;
        self.on_tick(&mut record).await?;
        info!(node = %identity, links = self.links, monitor = %self.monitor.describe(), "Readout node initialized");
        Ok(record)
    }

    async fn on_tick(&mut self, record: &mut StatusRecord) -> Result<(), CallbackError> {
        let reading = self.monitor.read_monitor(self.links).await?;
        if reading.channels.len() != self.links {
            return Err(CallbackError::BadData(format!(
                "expected {} links, monitor returned {}",
                self.links,
                reading.channels.len()
            )));
        }

        let running = record.state() == NodeState::Running;
        let advance = self
            .last_counter
            .map(|last| reading.counter.saturating_sub(last))
            .unwrap_or(0);
        self.last_counter = Some(reading.counter);

        for (link, read) in record.channels_mut().iter_mut().zip(&reading.channels) {
            *link = *read;
        }
        if running {
            if let Some(readout) = record.as_readout_mut() {
                readout.event_count = readout.event_count.saturating_add(advance);
            }
        }
        record.touch();
        Ok(())
    }

    async fn on_command(&mut self, command: &Command, record: &mut StatusRecord) -> CommandResult {
        if let Some(result) = apply_common_verb(command, record) {
            return result;
        }

        match command.verb.as_str() {
            "start" => {
                let exp: u32 = command.numeric_arg(0, "experiment number")?;
                let run: u32 = command.numeric_arg(1, "run number")?;
                require_state(command, record, &[NodeState::Ready])?;

                let Some(readout) = record.as_readout_mut() else {
                    return Err(CommandError::failed("record is not a readout record"));
                };
                readout.exp_number = exp;
                readout.run_number = run;
                readout.event_count = 0;
                record.set_state(NodeState::Running);
                Ok(CommandAck::with_message(format!("run {exp}.{run}")))
            }
            "stop" => {
                require_state(command, record, &[NodeState::Running])?;
                record.set_state(NodeState::Ready);
                let events = record.as_readout().map(|r| r.event_count).unwrap_or(0);
                Ok(CommandAck::with_message(format!("{events} events")))
            }
            _ => Err(CommandError::unsupported(command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedMonitor;
    use slc_core::NodeName;

    fn cmd(verb: &str, args: &[&str]) -> Command {
        Command::new(
            NodeName::new("ropc01").unwrap(),
            verb,
            args.iter().map(|a| a.to_string()).collect(),
        )
    }

    async fn ready_node() -> (ReadoutCallback, StatusRecord) {
        let mut cb = ReadoutCallback::new(Box::new(SimulatedMonitor::new(0.0)), 4);
        let mut rec = cb
            .on_initialize(&NodeIdentity::parse("ropc01").unwrap())
            .await
            .unwrap();
        cb.on_command(&cmd("configure", &["cfg1"]), &mut rec)
            .await
            .unwrap();
        (cb, rec)
    }

    #[tokio::test]
    async fn test_start_counts_events_while_running() {
        let (mut cb, mut rec) = ready_node().await;
        cb.on_command(&cmd("start", &["12", "345"]), &mut rec)
            .await
            .unwrap();

        let readout = rec.as_readout().unwrap();
        assert_eq!((readout.exp_number, readout.run_number), (12, 345));
        assert_eq!(readout.event_count, 0);

        cb.on_tick(&mut rec).await.unwrap();
        cb.on_tick(&mut rec).await.unwrap();
        assert_eq!(rec.as_readout().unwrap().event_count, 200);

        let ack = cb.on_command(&cmd("stop", &[]), &mut rec).await.unwrap();
        assert_eq!(ack.message.as_deref(), Some("200 events"));
        assert_eq!(rec.state(), NodeState::Ready);

        // Not running: counter advances are not counted
        cb.on_tick(&mut rec).await.unwrap();
        assert_eq!(rec.as_readout().unwrap().event_count, 200);
    }

    #[tokio::test]
    async fn test_start_needs_numeric_arguments() {
        let (mut cb, mut rec) = ready_node().await;
        let err = cb
            .on_command(&cmd("start", &["12"]), &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::BadArguments { .. }));

        let err = cb
            .on_command(&cmd("start", &["exp", "1"]), &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::BadArguments { .. }));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_rejected() {
        let (mut cb, mut rec) = ready_node().await;
        let err = cb.on_command(&cmd("stop", &[]), &mut rec).await.unwrap_err();
        assert!(matches!(err, CommandError::Rejected { .. }));
    }
}
