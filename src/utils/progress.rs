//! Progress reporting. Events flow through an unbounded channel so the
//! execution path never blocks on a slow or absent consumer.

use crate::models::{ProgressEvent, TestKind, TestState};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

pub struct ProgressReporter {
    sink: Mutex<Option<UnboundedSender<ProgressEvent>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        ProgressReporter {
            sink: Mutex::new(None),
        }
    }

    /// Attach a consumer; returns the receiving end. Replaces any
    /// previous subscription.
    pub fn subscribe(&self) -> UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut sink) = self.sink.lock() {
            *sink = Some(tx);
        }
        rx
    }

    pub fn report(&self, event: ProgressEvent) {
        if let Ok(sink) = self.sink.lock() {
            if let Some(tx) = sink.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    pub fn report_status(
        &self,
        session_id: Uuid,
        device_id: &str,
        test: TestKind,
        state: TestState,
        percent: Option<u8>,
        message: &str,
    ) {
        self.report(ProgressEvent {
            session_id,
            device_id: device_id.to_string(),
            test_id: test.id(),
            state,
            percent,
            message: message.to_string(),
        });
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscriber_in_order() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        let sid = Uuid::new_v4();
        reporter.report_status(sid, "sdb", TestKind::SmartInfo, TestState::Running, Some(0), "starting");
        reporter.report_status(sid, "sdb", TestKind::SmartInfo, TestState::Succeeded, Some(100), "done");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.state, TestState::Running);
        assert_eq!(second.state, TestState::Succeeded);
        assert_eq!(second.test_id, "smart_info");
    }

    #[test]
    fn report_without_subscriber_is_a_noop() {
        let reporter = ProgressReporter::new();
        reporter.report_status(Uuid::new_v4(), "sdb", TestKind::SpeedTest, TestState::Running, None, "x");
    }
}
