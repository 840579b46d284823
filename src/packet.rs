use pnet::packet::MutablePacket;
use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use crate::platform::{DmaPurpose, PacketBuffer, Platform};

/// Number of packets injected and the capacity of each history sequence
pub const NUM_PKTS: usize = 10;
/// Bytes kept per recorded packet
pub const PKT_SIZE: usize = 40;

const MARKER_COUNT: usize = 4;
const ETHERNET_HEADER_LEN: usize = 14;
/// dst(6) + src(6) + ethertype(2) + 4 x 32-bit markers
pub const TEMPLATE_LEN: usize = ETHERNET_HEADER_LEN + MARKER_COUNT * 4;

/// Fixed-size byte image of one packet as kept by the history recorder
pub type PacketRecord = [u8; PKT_SIZE];

/// Copy the first PKT_SIZE bytes of a packet, zero-padding short ones
pub fn to_record(bytes: &[u8]) -> PacketRecord {
    let mut record = [0u8; PKT_SIZE];
    let len = bytes.len().min(PKT_SIZE);
    record[..len].copy_from_slice(&bytes[..len]);
    record
}

/// The single synthetic frame resent by the transmit scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePacket {
    pub destination: MacAddr,
    pub source: MacAddr,
    pub ethertype: EtherType,
    pub markers: [u32; MARKER_COUNT],
}

impl Default for TemplatePacket {
    fn default() -> Self {
        Self {
            destination: MacAddr::new(0x3c, 0xfd, 0xfe, 0xad, 0x82, 0xe0),
            source: MacAddr::new(0x00, 0x00, 0x00, 0x00, 0x00, 0x11),
            ethertype: EtherTypes::Ipv4,
            markers: [0xCAFE_D00D, 0xDEAD_FACE, 0xDEAD_BEEF, 0x0000_0000],
        }
    }
}

impl TemplatePacket {
    /// Wire image of the frame. All multi-byte fields are big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = vec![0u8; TEMPLATE_LEN];

        // The buffer is sized for the header, so construction cannot fail
        if let Some(mut ethernet) = MutableEthernetPacket::new(&mut frame) {
            ethernet.set_destination(self.destination);
            ethernet.set_source(self.source);
            ethernet.set_ethertype(self.ethertype);

            let payload = ethernet.payload_mut();
            for (chunk, marker) in payload.chunks_exact_mut(4).zip(self.markers) {
                chunk.copy_from_slice(&marker.to_be_bytes());
            }
        }

        frame
    }
}

/// Allocate the template buffer from the platform pool and copy the frame in.
///
/// Failures are reported but not fatal: the returned buffer may be detached
/// (allocation failed) or empty (copy-in failed), and every transmit of it
/// will then be rejected by the platform.
pub fn build_template(platform: &dyn Platform, template: &TemplatePacket) -> PacketBuffer {
    let bytes = template.to_bytes();

    let mut buffer = match platform.buffer_alloc(bytes.len(), DmaPurpose::CpuPacketTransmit0) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!("Failed to allocate template packet buffer: {}", e);
            return PacketBuffer::detached();
        }
    };

    if platform.packet_manager_ready() {
        info!("Packet manager is initialized");
    } else {
        warn!("Packet manager reports not initialized");
    }

    if let Err(e) = platform.buffer_copy_in(&mut buffer, &bytes) {
        warn!("Failed to copy template into packet buffer: {}", e);
    }

    debug!(
        "Template packet {} built: {} bytes, dst={} src={} ethertype={}",
        buffer.id(),
        buffer.data().len(),
        template.destination,
        template.source,
        template.ethertype
    );

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackOptions, LoopbackPlatform};

    const EXPECTED_FRAME: [u8; TEMPLATE_LEN] = [
        0x3C, 0xFD, 0xFE, 0xAD, 0x82, 0xE0, // destination
        0x00, 0x00, 0x00, 0x00, 0x00, 0x11, // source
        0x08, 0x00, // ethertype
        0xCA, 0xFE, 0xD0, 0x0D, 0xDE, 0xAD, 0xFA, 0xCE, //
        0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn test_template_byte_image() {
        let bytes = TemplatePacket::default().to_bytes();
        assert_eq!(bytes.len(), 30);
        assert_eq!(bytes, EXPECTED_FRAME);
    }

    #[test]
    fn test_record_pads_and_truncates() {
        let short = to_record(&[0xAA; 4]);
        assert_eq!(&short[..4], &[0xAA; 4]);
        assert!(short[4..].iter().all(|&b| b == 0));

        let long = to_record(&[0x55; 64]);
        assert_eq!(long, [0x55; PKT_SIZE]);
    }

    #[test]
    fn test_build_template_copies_into_platform_buffer() {
        let platform = LoopbackPlatform::new(LoopbackOptions::default());
        let buffer = build_template(&platform, &TemplatePacket::default());

        assert!(buffer.is_allocated());
        assert_eq!(buffer.data(), &EXPECTED_FRAME);
        assert_eq!(platform.counters().allocs, 1);
    }

    #[test]
    fn test_build_template_survives_alloc_failure() {
        let platform = LoopbackPlatform::new(LoopbackOptions {
            fail_alloc: true,
            ..LoopbackOptions::default()
        });
        let buffer = build_template(&platform, &TemplatePacket::default());

        assert!(!buffer.is_allocated());
        assert!(buffer.data().is_empty());
    }
}
