//! Stratum dialect detection (spec §4.C.2): the miner's reported user-agent
//! picks between the standard `EthereumStratum/1.0.0`-style responses and
//! the Bitmain/Antminer-family variant. Once latched on a session, the
//! dialect governs every subsequent response/notification shape.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Standard,
    Bitmain,
}

const BITMAIN_MARKERS: &[&str] = &["godminer", "bitmain", "antminer"];

/// Matches the teacher-language pattern `/GodMiner|Bitmain|Antminer/i`.
pub fn detect(user_agent: &str) -> Dialect {
    let lowered = user_agent.to_lowercase();
    if BITMAIN_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        Dialect::Bitmain
    } else {
        Dialect::Standard
    }
}
