use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::history::{PacketHistory, RecordOutcome};
use crate::platform::{DeviceHandle, PacketBuffer, Platform, TxRing};

/// Delay between transmit attempts
pub const TX_PERIOD: Duration = Duration::from_millis(100);
/// Outbound CPU ring used for injection
pub const TX_RING: TxRing = TxRing(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Sending,
    Drained,
}

/// Periodically resubmits the template until the sent history is full,
/// then idles until shutdown is requested.
pub struct TransmitScheduler {
    platform: Arc<dyn Platform>,
    handle: DeviceHandle,
    template: PacketBuffer,
    history: Arc<PacketHistory>,
    shutdown: Arc<AtomicBool>,
    period: Duration,
    state: SchedulerState,
    failures: u64,
}

impl TransmitScheduler {
    pub fn new(
        platform: Arc<dyn Platform>,
        handle: DeviceHandle,
        template: PacketBuffer,
        history: Arc<PacketHistory>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            platform,
            handle,
            template,
            history,
            shutdown,
            period: TX_PERIOD,
            state: SchedulerState::Sending,
            failures: 0,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// One scheduling period's worth of work
    pub fn tick(&mut self) -> SchedulerState {
        if self.state == SchedulerState::Drained {
            return self.state;
        }

        let cookie = self.template.id();
        match self
            .platform
            .transmit(self.handle, &self.template, TX_RING, cookie)
        {
            Ok(()) => match self.history.sent.record(self.template.data()) {
                RecordOutcome::Stored(index) => debug!("Sent packet {}", index),
                RecordOutcome::Dropped { excess } => {
                    warn!("Transmitted past the sent history ({} extra)", excess)
                }
            },
            Err(e) => {
                self.failures += 1;
                warn!("Failed to send packet, status={}", e);
            }
        }

        if self.history.sent.is_full() {
            self.state = SchedulerState::Drained;
            info!(
                "Finished sending {} packets; press Ctrl-C to see results",
                self.history.sent.len()
            );
        }

        self.state
    }

    /// Tick every period until shutdown is requested, then release the template
    pub fn run(mut self) {
        debug!("Transmit scheduler started on {} every {:?}", TX_RING, self.period);

        while !self.shutdown.load(Ordering::Acquire) {
            self.tick();
            thread::sleep(self.period);
        }

        info!(
            "Transmit scheduler stopping ({} sent, {} failed attempts)",
            self.history.sent.len(),
            self.failures
        );
        if self.template.is_allocated() {
            self.platform.buffer_free(self.template);
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tx-scheduler".into())
            .spawn(move || self.run())
    }
}
