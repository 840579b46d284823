use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use crate::history::{PacketHistory, RecordOutcome};
use crate::platform::{PacketBuffer, Platform, PlatformResult, RxRing, TxRing};

/// Records every packet the platform punts to the CPU and hands the
/// buffer straight back.
pub struct ReceiveHandler {
    platform: Arc<dyn Platform>,
    history: Arc<PacketHistory>,
    shutdown: Arc<AtomicBool>,
    ignored: AtomicU64,
}

impl ReceiveHandler {
    pub fn new(
        platform: Arc<dyn Platform>,
        history: Arc<PacketHistory>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            platform,
            history,
            shutdown,
            ignored: AtomicU64::new(0),
        }
    }

    pub fn on_packet(&self, ring: RxRing, buffer: PacketBuffer) {
        if self.shutdown.load(Ordering::Acquire) {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            trace!("Shutting down, not recording packet on {}", ring);
        } else {
            match self.history.received.record(buffer.data()) {
                RecordOutcome::Stored(index) => {
                    debug!("Received packet {} ({} bytes) on {}", index, buffer.data().len(), ring)
                }
                RecordOutcome::Dropped { .. } => {}
            }
        }

        self.platform.buffer_free(buffer);
    }

    /// Packets that arrived after shutdown was requested
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Register on every receive ring. A ring that refuses is reported and
    /// skipped. Returns the number of rings registered.
    pub fn register_all(self: &Arc<Self>) -> usize {
        let mut registered = 0;
        for ring in RxRing::all() {
            let handler = self.clone();
            let result = self.platform.register_receive(
                ring,
                Arc::new(move |ring: RxRing, buffer: PacketBuffer| handler.on_packet(ring, buffer)),
            );
            match result {
                Ok(()) => registered += 1,
                Err(e) => warn!(
                    "RX registration failed for {} (another handler may own it): {}",
                    ring, e
                ),
            }
        }
        info!("Receive handler registered on {} rings", registered);
        registered
    }
}

/// Transmit completions carry nothing the harness needs; they are only traced.
pub fn register_transmit_complete(platform: &dyn Platform) {
    for ring in TxRing::all() {
        let result = platform.register_transmit_complete(
            ring,
            Arc::new(|ring: TxRing, cookie: u64, status: PlatformResult<()>| {
                trace!("TX complete on {} cookie={} status={:?}", ring, cookie, status)
            }),
        );
        if let Err(e) = result {
            warn!("TX completion registration failed for {}: {}", ring, e);
        }
    }
}
