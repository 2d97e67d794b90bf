use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// client prefix in Azureus style peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-PE0100-";

pub fn generate_peer_id() -> [u8; 20] {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }
    peer_id
}

/// Human readable client name from a peer id, e.g. `qBittorrent 4.6.2`.
pub fn client_name(peer_id: &[u8; 20]) -> String {
    if peer_id[0] == b'-' && peer_id[7] == b'-' {
        let code = String::from_utf8_lossy(&peer_id[1..3]);
        let name = match code.as_ref() {
            "qB" => "qBittorrent",
            "UT" => "µTorrent",
            "UM" => "µTorrent Mac",
            "TR" => "Transmission",
            "DE" => "Deluge",
            "LT" => "libtorrent",
            "lt" => "libTorrent",
            "AZ" => "Vuze",
            "BI" => "BiglyBT",
            "BC" => "BitComet",
            "BT" => "BitTorrent",
            "KT" => "KTorrent",
            "FD" => "Free Download Manager",
            "XL" => "Xunlei",
            "SD" => "Thunder",
            "PE" => "peer-evidence",
            other => return format!("{} {}", other, version_digits(&peer_id[3..7])),
        };
        return format!("{} {}", name, version_digits(&peer_id[3..7]));
    }
    if peer_id[0] == b'M' || peer_id[0] == b'Q' {
        // Mainline style, e.g. M7-4-2--
        let text = String::from_utf8_lossy(&peer_id[1..8]);
        let version: Vec<&str> = text.split('-').filter(|s| !s.is_empty()).collect();
        if !version.is_empty() && version.iter().all(|s| s.chars().all(|c| c.is_ascii_digit())) {
            let name = if peer_id[0] == b'M' { "Mainline" } else { "Queen Bee" };
            return format!("{} {}", name, version.join("."));
        }
    }
    let printable: String = peer_id
        .iter()
        .take_while(|b| b.is_ascii_graphic())
        .map(|&b| b as char)
        .collect();
    if printable.len() >= 4 {
        printable
    } else {
        "Unknown".to_string()
    }
}

fn version_digits(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| match b {
            b'0'..=b'9' => ((b - b'0') as u32).to_string(),
            b'A'..=b'Z' => ((b - b'A') as u32 + 10).to_string(),
            b'a'..=b'z' => ((b - b'a') as u32 + 36).to_string(),
            _ => "?".to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Locks a mutex even if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
