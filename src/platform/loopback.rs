use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::{
    DeviceHandle, DmaPurpose, PacketBuffer, Platform, PlatformResult, PlatformStatus, RxCallback,
    RxRing, TxCompleteCallback, TxRing, check_rx_ring, check_tx_ring,
};

/// Ring on which echoed and injected frames are delivered
const DELIVERY_RING: RxRing = RxRing(0);

/// Behaviour knobs for the software dataplane
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Echo every successful transmit back to the receive path
    pub echo: bool,
    /// Every allocation fails with `NoSystemResources`
    pub fail_alloc: bool,
    /// Number of upcoming transmits that fail with `TxRingFull`
    pub fail_transmits: u64,
    /// Receive registration on this ring is refused
    pub refuse_rx_ring: Option<RxRing>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            echo: true,
            fail_alloc: false,
            fail_transmits: 0,
            refuse_rx_ring: None,
        }
    }
}

/// Call counts observed by the software dataplane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackCounters {
    pub allocs: u64,
    pub frees: u64,
    pub transmits: u64,
    pub failed_transmits: u64,
    pub delivered: u64,
}

impl LoopbackCounters {
    pub fn outstanding_buffers(&self) -> u64 {
        self.allocs.saturating_sub(self.frees)
    }
}

#[derive(Default)]
struct Stats {
    allocs: AtomicU64,
    frees: AtomicU64,
    transmits: AtomicU64,
    failed_transmits: AtomicU64,
    delivered: AtomicU64,
    pending: AtomicU64,
}

struct Shared {
    next_buffer_id: AtomicU64,
    stats: Stats,
    rx_callbacks: DashMap<RxRing, RxCallback>,
}

impl Shared {
    fn alloc(&self, size: usize) -> PacketBuffer {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        self.stats.allocs.fetch_add(1, Ordering::Relaxed);
        PacketBuffer::new(id, size)
    }

    fn free(&self, buffer: PacketBuffer) {
        trace!("Releasing loopback buffer {}", buffer.id());
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn deliver(&self, frame: Vec<u8>) {
        let mut buffer = self.alloc(frame.len());
        if let Err(e) = buffer.fill(&frame) {
            warn!("Loopback failed to fill receive buffer: {}", e);
        }

        let callback = self
            .rx_callbacks
            .get(&DELIVERY_RING)
            .map(|entry| entry.value().clone());

        match callback {
            Some(callback) => callback(DELIVERY_RING, buffer),
            None => {
                debug!("No receiver on {}, dropping {} byte frame", DELIVERY_RING, frame.len());
                self.free(buffer);
            }
        }

        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        self.stats.pending.fetch_sub(1, Ordering::Release);
    }
}

/// In-process dataplane that hands every transmitted frame back to the
/// receive path from its own delivery thread.
pub struct LoopbackPlatform {
    options: LoopbackOptions,
    shared: Arc<Shared>,
    failures_left: AtomicU64,
    tx_callbacks: DashMap<TxRing, TxCompleteCallback>,
    deliveries: Sender<Vec<u8>>,
}

impl LoopbackPlatform {
    pub fn new(options: LoopbackOptions) -> Self {
        let shared = Arc::new(Shared {
            next_buffer_id: AtomicU64::new(1),
            stats: Stats::default(),
            rx_callbacks: DashMap::new(),
        });

        let (deliveries, inbox) = channel::unbounded();
        let worker_state = shared.clone();
        if let Err(e) = thread::Builder::new()
            .name("loopback-rx".into())
            .spawn(move || run_delivery(worker_state, inbox))
        {
            warn!("Failed to start loopback delivery thread: {}", e);
        }

        Self {
            failures_left: AtomicU64::new(options.fail_transmits),
            options,
            shared,
            tx_callbacks: DashMap::new(),
            deliveries,
        }
    }

    /// Simulate the dataplane punting an arbitrary frame to the CPU
    pub fn inject(&self, frame: &[u8]) {
        self.enqueue(frame.to_vec());
    }

    fn enqueue(&self, frame: Vec<u8>) {
        self.shared.stats.pending.fetch_add(1, Ordering::AcqRel);
        if self.deliveries.send(frame).is_err() {
            warn!("Loopback delivery thread is gone, frame lost");
            self.shared.stats.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Wait until every queued frame has been handed to the receive path
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.stats.pending.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn counters(&self) -> LoopbackCounters {
        let stats = &self.shared.stats;
        LoopbackCounters {
            allocs: stats.allocs.load(Ordering::Relaxed),
            frees: stats.frees.load(Ordering::Relaxed),
            transmits: stats.transmits.load(Ordering::Relaxed),
            failed_transmits: stats.failed_transmits.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
        }
    }

    pub fn registered_rx_rings(&self) -> Vec<RxRing> {
        let mut rings: Vec<RxRing> = self.shared.rx_callbacks.iter().map(|e| *e.key()).collect();
        rings.sort_by_key(|ring| ring.0);
        rings
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

fn run_delivery(shared: Arc<Shared>, inbox: Receiver<Vec<u8>>) {
    debug!("Loopback delivery thread started");
    for frame in inbox.iter() {
        shared.deliver(frame);
    }
    debug!("Loopback delivery thread shutting down");
}

impl Platform for LoopbackPlatform {
    fn device_init(&self) -> PlatformResult<DeviceHandle> {
        info!("Loopback dataplane ready");
        Ok(DeviceHandle(1))
    }

    fn apply_fixed_configuration(&self) {
        info!("Loopback dataplane has no tables to program");
    }

    fn packet_manager_ready(&self) -> bool {
        true
    }

    fn buffer_alloc(&self, size: usize, purpose: DmaPurpose) -> PlatformResult<PacketBuffer> {
        if self.options.fail_alloc {
            return Err(PlatformStatus::NoSystemResources);
        }
        let buffer = self.shared.alloc(size);
        trace!("Allocated loopback buffer {} ({} bytes, {:?})", buffer.id(), size, purpose);
        Ok(buffer)
    }

    fn buffer_free(&self, buffer: PacketBuffer) {
        self.shared.free(buffer);
    }

    fn buffer_copy_in(&self, buffer: &mut PacketBuffer, bytes: &[u8]) -> PlatformResult<()> {
        buffer.fill(bytes)
    }

    fn register_transmit_complete(
        &self,
        ring: TxRing,
        callback: TxCompleteCallback,
    ) -> PlatformResult<()> {
        check_tx_ring(ring)?;
        self.tx_callbacks.insert(ring, callback);
        Ok(())
    }

    fn register_receive(&self, ring: RxRing, callback: RxCallback) -> PlatformResult<()> {
        check_rx_ring(ring)?;
        if self.options.refuse_rx_ring == Some(ring)
            || self.shared.rx_callbacks.contains_key(&ring)
        {
            return Err(PlatformStatus::AlreadyRegistered);
        }
        self.shared.rx_callbacks.insert(ring, callback);
        Ok(())
    }

    fn transmit(
        &self,
        _handle: DeviceHandle,
        buffer: &PacketBuffer,
        ring: TxRing,
        cookie: u64,
    ) -> PlatformResult<()> {
        check_tx_ring(ring)?;
        if !buffer.is_allocated() || buffer.data().is_empty() {
            return Err(PlatformStatus::InvalidArg("empty packet buffer".into()));
        }

        if self.take_injected_failure() {
            self.shared.stats.failed_transmits.fetch_add(1, Ordering::Relaxed);
            return Err(PlatformStatus::TxRingFull);
        }

        self.shared.stats.transmits.fetch_add(1, Ordering::Relaxed);
        if self.options.echo {
            self.enqueue(buffer.data().to_vec());
        }

        if let Some(callback) = self.tx_callbacks.get(&ring).map(|e| e.value().clone()) {
            callback(ring, cookie, Ok(()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_transmit_is_echoed_to_ring_zero() {
        let platform = Arc::new(LoopbackPlatform::new(LoopbackOptions::default()));
        let seen: Arc<Mutex<Vec<(RxRing, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let releaser = platform.clone();
        platform
            .register_receive(
                RxRing(0),
                Arc::new(move |ring: RxRing, buffer: PacketBuffer| {
                    sink.lock().push((ring, buffer.data().to_vec()));
                    releaser.buffer_free(buffer);
                }),
            )
            .unwrap();

        let mut buffer = platform.buffer_alloc(3, DmaPurpose::CpuPacketTransmit0).unwrap();
        platform.buffer_copy_in(&mut buffer, &[9, 8, 7]).unwrap();
        platform.transmit(DeviceHandle(1), &buffer, TxRing(1), 0).unwrap();

        assert!(platform.wait_idle(WAIT));
        assert_eq!(seen.lock().as_slice(), &[(RxRing(0), vec![9, 8, 7])]);

        let counters = platform.counters();
        assert_eq!(counters.transmits, 1);
        assert_eq!(counters.delivered, 1);
        // The template buffer is still held by the test
        assert_eq!(counters.outstanding_buffers(), 1);
    }

    #[test]
    fn test_injected_transmit_failures() {
        let platform = LoopbackPlatform::new(LoopbackOptions {
            fail_transmits: 2,
            echo: false,
            ..LoopbackOptions::default()
        });
        let mut buffer = platform.buffer_alloc(1, DmaPurpose::CpuPacketTransmit0).unwrap();
        platform.buffer_copy_in(&mut buffer, &[1]).unwrap();

        let results: Vec<_> = (0..3)
            .map(|_| platform.transmit(DeviceHandle(1), &buffer, TxRing(1), 0))
            .collect();

        assert_eq!(results[0], Err(PlatformStatus::TxRingFull));
        assert_eq!(results[1], Err(PlatformStatus::TxRingFull));
        assert_eq!(results[2], Ok(()));
        assert_eq!(platform.counters().failed_transmits, 2);
        assert_eq!(platform.counters().transmits, 1);
    }

    #[test]
    fn test_unclaimed_frames_are_released() {
        let platform = LoopbackPlatform::new(LoopbackOptions::default());
        platform.inject(&[0xFF; 16]);

        assert!(platform.wait_idle(WAIT));
        let counters = platform.counters();
        assert_eq!(counters.allocs, 1);
        assert_eq!(counters.frees, 1);
    }

    #[test]
    fn test_duplicate_or_refused_rx_registration() {
        let platform = LoopbackPlatform::new(LoopbackOptions {
            refuse_rx_ring: Some(RxRing(3)),
            ..LoopbackOptions::default()
        });
        let noop: RxCallback = Arc::new(|_, _| {});

        assert!(platform.register_receive(RxRing(0), noop.clone()).is_ok());
        assert_eq!(
            platform.register_receive(RxRing(0), noop.clone()),
            Err(PlatformStatus::AlreadyRegistered)
        );
        assert_eq!(
            platform.register_receive(RxRing(3), noop),
            Err(PlatformStatus::AlreadyRegistered)
        );
        assert_eq!(platform.registered_rx_rings(), vec![RxRing(0)]);
    }
}
