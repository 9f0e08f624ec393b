//! Filename obfuscation for uploaded chunks, and a one-way hash helper for
//! log lines.
//!
//! These are compliance-adjacent affordances, not security controls: the
//! system's viability against the backing chat service depends on chunk
//! attachments looking like ordinary app cache files rather than raw binary
//! blobs, and on real paths never showing up in process output.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

const PREFIXES: [&str; 10] =
    ["img_", "cache_", "tmp_", "data_", "asset_", "thumb_", "preview_", "backup_", "sync_", "media_"];

const EXTENSIONS: [&str; 12] = [
    "jpg", "png", "webp", "gif", "mp3", "wav", "ogg", "dat", "bin", "cache", "tmp", "db",
];

const LOG_HASH_SALT: &str = "salt_discordfs";

/// Builds an innocuous-looking attachment filename for one chunk.
#[must_use]
pub fn obfuscated_filename(original_path: &str, chunk_index: u32) -> String {
    let prefix = PREFIXES[rand::thread_rng().gen_range_usize(PREFIXES.len())];
    let extension = EXTENSIONS[rand::thread_rng().gen_range_usize(EXTENSIONS.len())];

    let ticks_now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let random64: u64 = rand::thread_rng().next_u64();

    let material = format!("{original_path}:{chunk_index}:{ticks_now}:{random64}");
    let digest = Sha256::digest(material.as_bytes());
    let hash_hex8 = hex::encode(&digest[..8]);

    format!("{prefix}{hash_hex8}.{extension}")
}

/// Non-reversible 6-byte hex tag for `name`, safe to print in logs.
#[must_use]
pub fn hash_file_name(name: &str) -> String {
    let mut material = String::with_capacity(name.len() + LOG_HASH_SALT.len());
    material.push_str(name);
    material.push_str(LOG_HASH_SALT);
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(&digest[..6])
}

trait RngRangeExt {
    fn gen_range_usize(&mut self, upper_exclusive: usize) -> usize;
}

impl<T: RngCore> RngRangeExt for T {
    fn gen_range_usize(&mut self, upper_exclusive: usize) -> usize {
        (self.next_u64() as usize) % upper_exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn obfuscated_filename_matches_the_expected_shape() {
        let re = Regex::new(&format!(
            "^({})[0-9a-f]{{16}}\\.({})$",
            PREFIXES.join("|"),
            EXTENSIONS.join("|")
        ))
        .unwrap();
        for i in 0..50 {
            let name = obfuscated_filename("/some/path.bin", i);
            assert!(re.is_match(&name), "{name} did not match expected shape");
        }
    }

    #[test]
    fn successive_calls_are_not_identical() {
        let a = obfuscated_filename("/x", 0);
        let b = obfuscated_filename("/x", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_file_name_is_deterministic_and_does_not_leak_the_input() {
        let a = hash_file_name("/private/path.txt");
        let b = hash_file_name("/private/path.txt");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("private"));
    }

    #[test]
    fn hash_file_name_differs_for_different_inputs() {
        assert_ne!(hash_file_name("a"), hash_file_name("b"));
    }
}
