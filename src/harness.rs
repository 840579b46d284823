use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::history::{HistorySnapshot, PacketHistory};
use crate::packet::{TemplatePacket, build_template};
use crate::platform::{DeviceHandle, PacketBuffer, Platform};
use crate::receiver::{ReceiveHandler, register_transmit_complete};
use crate::scheduler::TransmitScheduler;

/// State shared by the scheduler, the receive callback and the dump
pub struct HarnessContext {
    pub platform: Arc<dyn Platform>,
    pub handle: DeviceHandle,
    pub history: Arc<PacketHistory>,
    pub shutdown: Arc<AtomicBool>,
}

impl HarnessContext {
    /// Device bring-up and table programming. A failed init is reported and
    /// the harness carries on with a default handle.
    pub fn bring_up(platform: Arc<dyn Platform>) -> Self {
        let handle = match platform.device_init() {
            Ok(handle) => {
                info!("Device initialized, session {:?}", handle);
                handle
            }
            Err(e) => {
                warn!("Device initialization failed: {}", e);
                DeviceHandle::default()
            }
        };

        platform.apply_fixed_configuration();

        Self {
            platform,
            handle,
            history: Arc::new(PacketHistory::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        self.history.snapshot()
    }
}

/// Wires the harness together: callbacks registered, template built,
/// scheduler started on demand and stopped on shutdown.
pub struct Harness {
    context: HarnessContext,
    receiver: Arc<ReceiveHandler>,
    template: Option<PacketBuffer>,
    tx_period: Option<Duration>,
    scheduler: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn bring_up(platform: Arc<dyn Platform>) -> Self {
        let context = HarnessContext::bring_up(platform);
        info!("Starting control plane harness");

        register_transmit_complete(context.platform.as_ref());

        let receiver = Arc::new(ReceiveHandler::new(
            context.platform.clone(),
            context.history.clone(),
            context.shutdown.clone(),
        ));
        receiver.register_all();

        let template = build_template(context.platform.as_ref(), &TemplatePacket::default());

        Self {
            context,
            receiver,
            template: Some(template),
            tx_period: None,
            scheduler: None,
        }
    }

    /// Override the transmit period (tests drive the scheduler faster)
    pub fn with_tx_period(mut self, period: Duration) -> Self {
        self.tx_period = Some(period);
        self
    }

    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    pub fn start_transmitting(&mut self) -> io::Result<()> {
        let Some(template) = self.template.take() else {
            warn!("Transmit scheduler already started");
            return Ok(());
        };

        let mut scheduler = TransmitScheduler::new(
            self.context.platform.clone(),
            self.context.handle,
            template,
            self.context.history.clone(),
            self.context.shutdown.clone(),
        );
        if let Some(period) = self.tx_period {
            scheduler = scheduler.with_period(period);
        }

        self.scheduler = Some(scheduler.spawn()?);
        Ok(())
    }

    /// Stop both writers and return the final history
    pub fn stop(mut self) -> HistorySnapshot {
        self.context.request_shutdown();

        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                warn!("Transmit scheduler panicked");
            }
        }
        if let Some(template) = self.template.take() {
            if template.is_allocated() {
                self.context.platform.buffer_free(template);
            }
        }

        let ignored = self.receiver.ignored();
        if ignored > 0 {
            info!("{} packets arrived after shutdown and were not recorded", ignored);
        }

        self.context.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NUM_PKTS, PKT_SIZE, to_record};
    use crate::platform::loopback::{LoopbackOptions, LoopbackPlatform};
    use std::thread;
    use std::time::Instant;

    const FAST: Duration = Duration::from_millis(2);

    fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_loopback_end_to_end_sent_matches_received() {
        let platform = Arc::new(LoopbackPlatform::new(LoopbackOptions::default()));
        let mut harness = Harness::bring_up(platform.clone()).with_tx_period(FAST);
        harness.start_transmitting().unwrap();

        let history = harness.context().history.clone();
        assert!(wait_for(Duration::from_secs(5), || history.received.is_full()));

        let snapshot = harness.stop();
        let expected = to_record(&TemplatePacket::default().to_bytes());
        assert_eq!(snapshot.sent_count, NUM_PKTS);
        assert_eq!(snapshot.received_count, NUM_PKTS);
        for (i, sent, received) in snapshot.rows() {
            assert_eq!(sent, received, "row {} differs", i);
            assert_eq!(*sent, expected);
        }
        assert_eq!(snapshot.matching_rows(), NUM_PKTS);

        assert!(platform.wait_idle(Duration::from_secs(2)));
        let counters = platform.counters();
        assert_eq!(counters.transmits, NUM_PKTS as u64);
        assert_eq!(counters.outstanding_buffers(), 0);
    }

    #[test]
    fn test_extra_returned_packets_saturate_history() {
        let platform = Arc::new(LoopbackPlatform::new(LoopbackOptions::default()));
        let mut harness = Harness::bring_up(platform.clone()).with_tx_period(FAST);
        harness.start_transmitting().unwrap();

        let history = harness.context().history.clone();
        assert!(wait_for(Duration::from_secs(5), || history.received.is_full()));

        // The dataplane replicates two more frames back to the CPU
        let frame = TemplatePacket::default().to_bytes();
        platform.inject(&frame);
        platform.inject(&frame);
        assert!(platform.wait_idle(Duration::from_secs(2)));

        let snapshot = harness.stop();
        assert_eq!(snapshot.received_count, NUM_PKTS);
        assert_eq!(snapshot.received_dropped, 2);
        assert_eq!(snapshot.received.len(), NUM_PKTS);

        let counters = platform.counters();
        assert_eq!(counters.delivered, 12);
        assert_eq!(counters.outstanding_buffers(), 0);
    }

    #[test]
    fn test_stop_before_transmitting_releases_template() {
        let platform = Arc::new(LoopbackPlatform::new(LoopbackOptions::default()));
        let harness = Harness::bring_up(platform.clone());

        let snapshot = harness.stop();
        assert_eq!(snapshot.sent_count, 0);
        assert!(snapshot.sent.iter().all(|r| *r == [0u8; PKT_SIZE]));
        assert_eq!(platform.counters().outstanding_buffers(), 0);
    }

    #[test]
    fn test_degraded_setup_keeps_running() {
        let platform = Arc::new(LoopbackPlatform::new(LoopbackOptions {
            fail_alloc: true,
            ..LoopbackOptions::default()
        }));
        let mut harness = Harness::bring_up(platform.clone()).with_tx_period(FAST);
        harness.start_transmitting().unwrap();
        thread::sleep(Duration::from_millis(20));

        let snapshot = harness.stop();
        assert_eq!(snapshot.sent_count, 0);
        assert_eq!(platform.counters().transmits, 0);
    }
}
