use dashmap::DashMap;
use parking_lot::Mutex;
use pcap::{Active, Capture, Direction, Error as PcapError};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{
    DeviceHandle, DmaPurpose, PacketBuffer, Platform, PlatformResult, PlatformStatus, RxCallback,
    RxRing, TxCompleteCallback, TxRing, check_rx_ring, check_tx_ring,
};

/// Largest frame the CPU port accepts (jumbo)
const MAX_FRAME_SIZE: usize = 9216;
/// All frames captured on the CPU port arrive on this ring
const CPU_PORT_RING: RxRing = RxRing(0);
const READ_TIMEOUT_MS: i32 = 100;

/// How the host-side view of the device is reached
#[derive(Debug, Clone)]
pub struct PcapConfig {
    /// Network interface exposing the device CPU port
    pub interface: String,
    /// Script fed to the vendor shell to program tables
    pub table_script: Option<PathBuf>,
    /// SDE install directory used to locate the target configuration
    pub sde_install: Option<PathBuf>,
    /// Device status (thrift) port handed to the driver
    pub status_port: u16,
}

impl PcapConfig {
    pub fn target_conf_file(&self) -> Option<PathBuf> {
        self.sde_install
            .as_ref()
            .map(|dir| dir.join("share/p4/targets/tofino/autogen.conf"))
    }
}

struct RxShared {
    next_buffer_id: AtomicU64,
    callbacks: DashMap<RxRing, RxCallback>,
    running: AtomicBool,
}

impl RxShared {
    fn alloc(&self, size: usize) -> PacketBuffer {
        PacketBuffer::new(self.next_buffer_id.fetch_add(1, Ordering::Relaxed), size)
    }
}

/// Platform backed by libpcap on the interface where the device punts CPU
/// traffic. Transmits inject raw frames; a capture thread feeds the RX path.
pub struct PcapPlatform {
    config: PcapConfig,
    tx: Mutex<Option<Capture<Active>>>,
    tx_callbacks: DashMap<TxRing, TxCompleteCallback>,
    rx: Arc<RxShared>,
}

impl PcapPlatform {
    pub fn new(config: PcapConfig) -> Self {
        Self {
            config,
            tx: Mutex::new(None),
            tx_callbacks: DashMap::new(),
            rx: Arc::new(RxShared {
                next_buffer_id: AtomicU64::new(1),
                callbacks: DashMap::new(),
                running: AtomicBool::new(true),
            }),
        }
    }

    fn open_capture(&self) -> Result<Capture<Active>, PcapError> {
        Capture::from_device(self.config.interface.as_str())?
            .promisc(true)
            .snaplen(MAX_FRAME_SIZE as i32)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()
    }

    fn start_capture_thread(&self) -> PlatformResult<()> {
        let mut capture = self
            .open_capture()
            .map_err(|e| PlatformStatus::Io(e.to_string()))?;

        // Only frames coming from the device, not our own injections
        if let Err(e) = capture.direction(Direction::In) {
            warn!("Failed to restrict capture direction on {}: {}", self.config.interface, e);
        }

        let shared = self.rx.clone();
        let interface = self.config.interface.clone();
        thread::Builder::new()
            .name("cpu-port-rx".into())
            .spawn(move || capture_loop(capture, shared, interface))
            .map(|_| ())
            .map_err(|e| PlatformStatus::Internal(e.to_string()))
    }
}

fn capture_loop(mut capture: Capture<Active>, shared: Arc<RxShared>, interface: String) {
    info!("Capturing CPU port traffic on {}", interface);

    while shared.running.load(Ordering::Relaxed) {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(PcapError::TimeoutExpired) => continue,
            Err(e) => {
                error!("Error capturing on {}: {}", interface, e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let mut buffer = shared.alloc(packet.data.len());
        if let Err(e) = buffer.fill(packet.data) {
            warn!("Dropping captured frame: {}", e);
            continue;
        }

        trace!("Captured {} byte frame on {}", packet.data.len(), interface);

        match shared.callbacks.get(&CPU_PORT_RING).map(|e| e.value().clone()) {
            Some(callback) => callback(CPU_PORT_RING, buffer),
            None => debug!("No receiver on {}, dropping frame", CPU_PORT_RING),
        }
    }

    debug!("Capture thread for {} shutting down", interface);
}

impl Drop for PcapPlatform {
    fn drop(&mut self) {
        self.rx.running.store(false, Ordering::Relaxed);
    }
}

impl Platform for PcapPlatform {
    fn device_init(&self) -> PlatformResult<DeviceHandle> {
        match self.config.target_conf_file() {
            Some(conf) => info!("Target configuration: {}", conf.display()),
            None => warn!("SDE install directory not set, target configuration unknown"),
        }
        info!("Device status port: {}", self.config.status_port);

        let capture = self
            .open_capture()
            .map_err(|e| PlatformStatus::Io(e.to_string()))?;
        *self.tx.lock() = Some(capture);

        self.start_capture_thread()?;

        info!("Client initialization on {} complete", self.config.interface);
        Ok(DeviceHandle(0))
    }

    fn apply_fixed_configuration(&self) {
        let Some(script) = &self.config.table_script else {
            info!("No table script configured");
            return;
        };

        info!("Programming tables from {}", script.display());
        match Command::new("bfshell").arg("-f").arg(script).status() {
            Ok(status) if status.success() => info!("Table script applied"),
            Ok(status) => warn!("Table script exited with {}", status),
            Err(e) => warn!("Failed to run bfshell: {}", e),
        }
    }

    fn packet_manager_ready(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn buffer_alloc(&self, size: usize, purpose: DmaPurpose) -> PlatformResult<PacketBuffer> {
        if size > MAX_FRAME_SIZE {
            return Err(PlatformStatus::InvalidArg(format!(
                "{} bytes exceed the maximum frame size",
                size
            )));
        }
        let buffer = self.rx.alloc(size);
        trace!("Allocated buffer {} ({} bytes, {:?})", buffer.id(), size, purpose);
        Ok(buffer)
    }

    fn buffer_free(&self, buffer: PacketBuffer) {
        trace!("Releasing buffer {}", buffer.id());
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
        if self.rx.callbacks.contains_key(&ring) {
            return Err(PlatformStatus::AlreadyRegistered);
        }
        self.rx.callbacks.insert(ring, callback);
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

        {
            let mut tx = self.tx.lock();
            let capture = tx.as_mut().ok_or(PlatformStatus::NotReady)?;
            capture
                .sendpacket(buffer.data())
                .map_err(|e| PlatformStatus::Io(e.to_string()))?;
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

    fn config() -> PcapConfig {
        PcapConfig {
            interface: "bf_pci0".into(),
            table_script: None,
            sde_install: Some(PathBuf::from("/opt/sde/install")),
            status_port: 7777,
        }
    }

    #[test]
    fn test_target_conf_file_location() {
        assert_eq!(
            config().target_conf_file(),
            Some(PathBuf::from("/opt/sde/install/share/p4/targets/tofino/autogen.conf"))
        );
        let unset = PcapConfig {
            sde_install: None,
            ..config()
        };
        assert_eq!(unset.target_conf_file(), None);
    }

    #[test]
    fn test_transmit_before_init_is_not_ready() {
        let platform = PcapPlatform::new(config());
        let mut buffer = platform.buffer_alloc(4, DmaPurpose::CpuPacketTransmit0).unwrap();
        platform.buffer_copy_in(&mut buffer, &[1, 2, 3, 4]).unwrap();

        assert!(!platform.packet_manager_ready());
        assert_eq!(
            platform.transmit(DeviceHandle(0), &buffer, TxRing(1), buffer.id()),
            Err(PlatformStatus::NotReady)
        );
    }

    #[test]
    fn test_oversized_alloc_rejected() {
        let platform = PcapPlatform::new(config());
        assert!(platform.buffer_alloc(MAX_FRAME_SIZE + 1, DmaPurpose::CpuPacketTransmit0).is_err());
    }
}
