//! Extraction of probe observations from tcpdump output lines.
//!
//! The capture runs tcpdump in monitor mode with radiotap headers, so every
//! useful line starts with an epoch timestamp and carries a `-NNdBm signal`
//! field plus a transmitter (`TA:`) or source (`SA:`) address. Lines missing
//! any of the three are filtered out rather than treated as errors.

use std::sync::OnceLock;

use regex::Regex;

use crate::record::{Observation, UNKNOWN_CHANNEL};

struct Patterns {
    timestamp: Regex,
    signal: Regex,
    transmitter: Regex,
    source: Regex,
    frequency: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        timestamp: Regex::new(r"^(\d+\.\d{3,})").expect("valid timestamp regex"),
        signal: Regex::new(r"(-?\d{1,3})dBm signal").expect("valid signal regex"),
        transmitter: Regex::new(r"\bTA:([0-9A-Fa-f:]{17})\b").expect("valid TA regex"),
        source: Regex::new(r"\bSA:([0-9A-Fa-f:]{17})\b").expect("valid SA regex"),
        frequency: Regex::new(r"\b(\d{4}) MHz\b").expect("valid frequency regex"),
    })
}

/// Parse one capture line into an observation.
///
/// Returns `None` when the timestamp, signal or address is missing. The
/// address is lowercased; the channel is derived from the radiotap frequency
/// when present, otherwise it is [`UNKNOWN_CHANNEL`].
pub fn parse_line(line: &str) -> Option<Observation> {
    let p = patterns();

    let ts: f64 = p.timestamp.captures(line)?.get(1)?.as_str().parse().ok()?;
    let rssi: i32 = p.signal.captures(line)?.get(1)?.as_str().parse().ok()?;
    let mac = p
        .transmitter
        .captures(line)
        .or_else(|| p.source.captures(line))?
        .get(1)?
        .as_str()
        .to_lowercase();

    let channel = p
        .frequency
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .and_then(frequency_to_channel)
        .unwrap_or(UNKNOWN_CHANNEL);

    Some(Observation::new(mac, rssi, ts).with_channel(channel))
}

/// Map a center frequency in MHz to its 802.11 channel number.
pub fn frequency_to_channel(mhz: u32) -> Option<i32> {
    match mhz {
        2484 => Some(14),
        2412..=2472 if (mhz - 2407) % 5 == 0 => Some(((mhz - 2407) / 5) as i32),
        5000..=5895 if mhz % 5 == 0 => Some(((mhz - 5000) / 5) as i32),
        _ => None,
    }
}
