//! Statistics display helpers for the CLI tools

use snp::DriverStats;

/// Format a stats snapshot as one compact log line.
pub fn display_stats(stats: &DriverStats) -> String {
    format!(
        "sent={} ({} B) recv={} ({} B) dropped={} dup={} retx={} accepted={}",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.dropped_packets,
        stats.dropped_duplicates,
        stats.retransmits,
        stats.connections_accepted,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_stats() {
        let stats = DriverStats {
            packets_sent: 3,
            bytes_sent: 300,
            ..Default::default()
        };
        let line = display_stats(&stats);
        assert!(line.contains("sent=3 (300 B)"));
        assert!(line.contains("dup=0"));
    }
}
