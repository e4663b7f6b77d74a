// Deterministic id derivations (spec §3 invariants, §9 "deterministic ids
// over runtime randomness"). Retries are safe because re-deriving an id from
// the same content always lands on the same row.

use sha2::{Digest, Sha256};

/// host.id is a deterministic function of its IPv4 string (dots -> underscores).
pub fn host_id(ip: &str) -> String {
    ip.replace('.', "_")
}

/// port.id uniquely identifies `(number, protocol)`.
pub fn port_id(number: u16, protocol: &str) -> String {
    format!("{number}_{protocol}")
}

/// service.fingerprint = SHA256(lower(name)|lower(product)|lower(version)).
pub fn service_fingerprint(name: &str, product: &str, version: &str) -> String {
    let joined = format!(
        "{}|{}|{}",
        name.to_lowercase(),
        product.to_lowercase(),
        version.to_lowercase()
    );
    sha256_hex(joined.as_bytes())
}

/// banner.id = SHA256(text); tls_cert.id = SHA256(cert bytes). Interned by hash.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn city_id(cc: &str, region: &str, city: &str) -> String {
    format!("{}_{}_{}", cc.to_lowercase(), slug(region), slug(city))
}

pub fn region_id(cc: &str, region: &str) -> String {
    format!("{}_{}", cc.to_lowercase(), slug(region))
}

pub fn country_id(cc: &str) -> String {
    cc.to_lowercase()
}

fn slug(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// UUIDv7 preferred (time-ordered job ids); falls back to v4 only if v7
/// generation somehow fails (it doesn't in practice, but §4.2 calls for the
/// fallback explicitly so callers should go through this helper, not
/// `Uuid::now_v7()` directly).
pub fn new_job_id() -> uuid::Uuid {
    std::panic::catch_unwind(uuid::Uuid::now_v7).unwrap_or_else(|_| uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_is_deterministic() {
        assert_eq!(host_id("192.168.1.1"), "192_168_1_1");
        assert_eq!(host_id("192.168.1.1"), host_id("192.168.1.1"));
    }

    #[test]
    fn port_id_distinguishes_protocol() {
        assert_ne!(port_id(53, "tcp"), port_id(53, "udp"));
    }

    #[test]
    fn service_fingerprint_is_case_insensitive() {
        let a = service_fingerprint("http", "nginx", "1.24.0");
        let b = service_fingerprint("HTTP", "NGINX", "1.24.0");
        assert_eq!(a, b);
    }

    #[test]
    fn service_fingerprint_distinguishes_version() {
        let a = service_fingerprint("http", "nginx", "1.24.0");
        let b = service_fingerprint("http", "nginx", "1.25.0");
        assert_ne!(a, b);
    }

    #[test]
    fn city_ids_nest_under_region_and_country() {
        let c = city_id("US", "California", "San Francisco");
        let r = region_id("US", "California");
        assert!(c.starts_with(&r));
    }
}
