// Packet platform seam: device bring-up, DMA buffers, TX/RX rings
pub mod loopback;
pub mod pcap_backend;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Number of CPU transmit rings on a device
pub const TX_RING_COUNT: u8 = 4;
/// Number of CPU receive rings on a device
pub const RX_RING_COUNT: u8 = 8;

/// Status taxonomy reported by platform primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformStatus {
    #[error("device not ready")]
    NotReady,
    #[error("not enough system resources")]
    NoSystemResources,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("callback already registered")]
    AlreadyRegistered,
    #[error("transmit ring full")]
    TxRingFull,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PlatformResult<T> = Result<T, PlatformStatus>;

/// Opaque session identifier returned by device bring-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxRing(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxRing(pub u8);

impl TxRing {
    pub fn all() -> impl Iterator<Item = TxRing> {
        (0..TX_RING_COUNT).map(TxRing)
    }
}

impl RxRing {
    pub fn all() -> impl Iterator<Item = RxRing> {
        (0..RX_RING_COUNT).map(RxRing)
    }
}

impl fmt::Display for TxRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-ring-{}", self.0)
    }
}

impl fmt::Display for RxRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx-ring-{}", self.0)
    }
}

/// Which DMA pool a buffer is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPurpose {
    CpuPacketTransmit0,
    CpuPacketReceive,
}

/// A packet buffer owned by the caller until it is handed back with
/// [`Platform::buffer_free`]. Not `Clone`: a buffer can be released once.
#[derive(Debug)]
pub struct PacketBuffer {
    id: u64,
    capacity: usize,
    data: Vec<u8>,
}

impl PacketBuffer {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            data: Vec::with_capacity(capacity),
        }
    }

    /// Placeholder for a buffer whose allocation failed
    pub fn detached() -> Self {
        Self {
            id: 0,
            capacity: 0,
            data: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_allocated(&self) -> bool {
        self.id != 0
    }

    /// Replace the buffer contents; fails if the bytes exceed capacity
    pub fn fill(&mut self, bytes: &[u8]) -> PlatformResult<()> {
        if !self.is_allocated() {
            return Err(PlatformStatus::InvalidArg("buffer not allocated".into()));
        }
        if bytes.len() > self.capacity {
            return Err(PlatformStatus::InvalidArg(format!(
                "{} bytes exceed buffer capacity {}",
                bytes.len(),
                self.capacity
            )));
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Invoked when a transmit on a ring completes
pub type TxCompleteCallback = Arc<dyn Fn(TxRing, u64, PlatformResult<()>) + Send + Sync>;

/// Invoked from a platform-owned context for each packet arriving on a ring.
/// The callee owns the buffer and must release it.
pub type RxCallback = Arc<dyn Fn(RxRing, PacketBuffer) + Send + Sync>;

/// Services supplied by the packet platform
pub trait Platform: Send + Sync {
    /// One-time device bring-up
    fn device_init(&self) -> PlatformResult<DeviceHandle>;

    /// Load the static table configuration. Outcome is only logged.
    fn apply_fixed_configuration(&self);

    fn packet_manager_ready(&self) -> bool;

    fn buffer_alloc(&self, size: usize, purpose: DmaPurpose) -> PlatformResult<PacketBuffer>;

    fn buffer_free(&self, buffer: PacketBuffer);

    fn buffer_copy_in(&self, buffer: &mut PacketBuffer, bytes: &[u8]) -> PlatformResult<()>;

    fn register_transmit_complete(
        &self,
        ring: TxRing,
        callback: TxCompleteCallback,
    ) -> PlatformResult<()>;

    fn register_receive(&self, ring: RxRing, callback: RxCallback) -> PlatformResult<()>;

    fn transmit(
        &self,
        handle: DeviceHandle,
        buffer: &PacketBuffer,
        ring: TxRing,
        cookie: u64,
    ) -> PlatformResult<()>;
}

fn check_tx_ring(ring: TxRing) -> PlatformResult<()> {
    if ring.0 < TX_RING_COUNT {
        Ok(())
    } else {
        Err(PlatformStatus::InvalidArg(format!("no such ring {}", ring)))
    }
}

fn check_rx_ring(ring: RxRing) -> PlatformResult<()> {
    if ring.0 < RX_RING_COUNT {
        Ok(())
    } else {
        Err(PlatformStatus::InvalidArg(format!("no such ring {}", ring)))
    }
}
