use std::fmt::Write as _;
use std::io::{self, Write};

use crate::history::HistorySnapshot;
use crate::packet::PacketRecord;

/// Upper-case hex bytes separated by single spaces
pub fn hex_row(record: &PacketRecord) -> String {
    let mut row = String::with_capacity(record.len() * 3);
    for (i, byte) in record.iter().enumerate() {
        if i > 0 {
            row.push(' ');
        }
        let _ = write!(row, "{:02X}", byte);
    }
    row
}

/// Side-by-side sent/received report, one block per history slot
pub fn render_dump<W: Write>(out: &mut W, snapshot: &HistorySnapshot) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Caught interrupt")?;

    for (i, sent, received) in snapshot.rows() {
        writeln!(out, "Packet {}", i)?;
        writeln!(out, "Sent: {}", hex_row(sent))?;
        writeln!(out, "Recv: {}", hex_row(received))?;
    }

    writeln!(out, "{}", "─".repeat(40))?;
    writeln!(
        out,
        "Transmitted: {}  Received: {} ({} dropped)  Matching: {}/{}",
        snapshot.sent_count,
        snapshot.received_count,
        snapshot.received_dropped,
        snapshot.matching_rows(),
        snapshot.sent.len()
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::PacketHistory;
    use crate::packet::{NUM_PKTS, PKT_SIZE, TemplatePacket};

    fn render(snapshot: &HistorySnapshot) -> String {
        let mut out = Vec::new();
        render_dump(&mut out, snapshot).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_hex_row_format() {
        let mut record = [0u8; PKT_SIZE];
        record[..3].copy_from_slice(&[0x3C, 0x0A, 0xFF]);
        let row = hex_row(&record);

        assert!(row.starts_with("3C 0A FF 00"));
        assert_eq!(row.split(' ').count(), PKT_SIZE);
        assert!(!row.ends_with(' '));
    }

    #[test]
    fn test_prints_every_row_at_any_receive_count() {
        for received in 0..=NUM_PKTS {
            let history = PacketHistory::default();
            for _ in 0..NUM_PKTS {
                history.sent.record(&TemplatePacket::default().to_bytes());
            }
            for _ in 0..received {
                history.received.record(&TemplatePacket::default().to_bytes());
            }

            let text = render(&history.snapshot());
            let packets = text.lines().filter(|l| l.starts_with("Packet ")).count();
            let recv_rows: Vec<&str> = text.lines().filter(|l| l.starts_with("Recv: ")).collect();

            assert_eq!(packets, NUM_PKTS);
            assert_eq!(recv_rows.len(), NUM_PKTS);
            for row in &recv_rows[received..] {
                assert_eq!(row.trim_start_matches("Recv: "), hex_row(&[0u8; PKT_SIZE]));
            }
            assert!(text.contains(&format!("Matching: {}/{}", received, NUM_PKTS)));
        }
    }

    #[test]
    fn test_empty_history_renders_zero_rows() {
        let text = render(&PacketHistory::default().snapshot());
        let zeros = hex_row(&[0u8; PKT_SIZE]);

        assert_eq!(text.matches(&zeros).count(), 2 * NUM_PKTS);
        assert!(text.contains("Transmitted: 0  Received: 0 (0 dropped)"));
    }

    #[test]
    fn test_reports_dropped_packets() {
        let history = PacketHistory::default();
        for _ in 0..12 {
            history.received.record(&[1; PKT_SIZE]);
        }

        let text = render(&history.snapshot());
        assert!(text.contains("Received: 10 (2 dropped)"));
    }
}
