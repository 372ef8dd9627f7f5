//! Reference table of protocol versions and cipher suites the prober offers one at a time.

use fleetaudit_core::CipherQuality::{self, Acceptable, Broken, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    Ssl30,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

use ProtocolVersion::*;

impl ProtocolVersion {
    /// Probe order: most commonly accepted first, so non-TLS ports are recognised early.
    pub const PROBE_ORDER: [ProtocolVersion; 5] = [Tls12, Tls13, Tls11, Tls10, Ssl30];

    pub fn label(&self) -> &'static str {
        match self {
            Ssl30 => "VersionSSL30",
            Tls10 => "VersionTLS10",
            Tls11 => "VersionTLS11",
            Tls12 => "VersionTLS12",
            Tls13 => "VersionTLS13",
        }
    }

    pub fn wire(&self) -> u16 {
        match self {
            Ssl30 => 0x0300,
            Tls10 => 0x0301,
            Tls11 => 0x0302,
            Tls12 => 0x0303,
            Tls13 => 0x0304,
        }
    }

    /// Version written into the ClientHello body; TLS 1.3 is negotiated by extension.
    pub fn legacy_wire(&self) -> u16 {
        self.wire().min(0x0303)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub quality: CipherQuality,
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

const fn suite(id: u16, name: &'static str, quality: CipherQuality, min: ProtocolVersion, max: ProtocolVersion) -> CipherSuite {
    CipherSuite { id, name, quality, min, max }
}

pub static CIPHER_SUITES: &[CipherSuite] = &[
    // TLS 1.3
    suite(0x1301, "TLS_AES_128_GCM_SHA256", Acceptable, Tls13, Tls13),
    suite(0x1302, "TLS_AES_256_GCM_SHA384", Acceptable, Tls13, Tls13),
    suite(0x1303, "TLS_CHACHA20_POLY1305_SHA256", Acceptable, Tls13, Tls13),
    suite(0x1304, "TLS_AES_128_CCM_SHA256", Acceptable, Tls13, Tls13),
    suite(0x1305, "TLS_AES_128_CCM_8_SHA256", Weak, Tls13, Tls13),
    // TLS 1.2 AEAD
    suite(0xC02B, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", Acceptable, Tls12, Tls12),
    suite(0xC02C, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", Acceptable, Tls12, Tls12),
    suite(0xC02F, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", Acceptable, Tls12, Tls12),
    suite(0xC030, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", Acceptable, Tls12, Tls12),
    suite(0xCCA8, "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256", Acceptable, Tls12, Tls12),
    suite(0xCCA9, "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256", Acceptable, Tls12, Tls12),
    suite(0x009E, "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256", Acceptable, Tls12, Tls12),
    suite(0x009F, "TLS_DHE_RSA_WITH_AES_256_GCM_SHA384", Acceptable, Tls12, Tls12),
    suite(0xCCAA, "TLS_DHE_RSA_WITH_CHACHA20_POLY1305_SHA256", Acceptable, Tls12, Tls12),
    suite(0x009C, "TLS_RSA_WITH_AES_128_GCM_SHA256", Weak, Tls12, Tls12),
    suite(0x009D, "TLS_RSA_WITH_AES_256_GCM_SHA384", Weak, Tls12, Tls12),
    // TLS 1.2 CBC with SHA-2 MACs
    suite(0xC023, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0xC024, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384", Weak, Tls12, Tls12),
    suite(0xC027, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0xC028, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384", Weak, Tls12, Tls12),
    suite(0x0067, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0x006B, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0x003C, "TLS_RSA_WITH_AES_128_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0x003D, "TLS_RSA_WITH_AES_256_CBC_SHA256", Weak, Tls12, Tls12),
    suite(0x003B, "TLS_RSA_WITH_NULL_SHA256", Broken, Tls12, Tls12),
    // CBC-SHA suites usable from SSLv3/TLS 1.0 up
    suite(0xC009, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA", Weak, Tls10, Tls12),
    suite(0xC00A, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA", Weak, Tls10, Tls12),
    suite(0xC013, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", Weak, Tls10, Tls12),
    suite(0xC014, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA", Weak, Tls10, Tls12),
    suite(0x0033, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x0039, "TLS_DHE_RSA_WITH_AES_256_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x002F, "TLS_RSA_WITH_AES_128_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x0035, "TLS_RSA_WITH_AES_256_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x0041, "TLS_RSA_WITH_CAMELLIA_128_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x0084, "TLS_RSA_WITH_CAMELLIA_256_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x0096, "TLS_RSA_WITH_SEED_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0xC012, "TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA", Weak, Tls10, Tls12),
    suite(0x0016, "TLS_DHE_RSA_WITH_3DES_EDE_CBC_SHA", Weak, Ssl30, Tls12),
    suite(0x000A, "TLS_RSA_WITH_3DES_EDE_CBC_SHA", Weak, Ssl30, Tls12),
    // broken: RC4, single DES, export grade, anonymous, NULL
    suite(0xC011, "TLS_ECDHE_RSA_WITH_RC4_128_SHA", Broken, Tls10, Tls12),
    suite(0xC007, "TLS_ECDHE_ECDSA_WITH_RC4_128_SHA", Broken, Tls10, Tls12),
    suite(0x0005, "TLS_RSA_WITH_RC4_128_SHA", Broken, Ssl30, Tls12),
    suite(0x0004, "TLS_RSA_WITH_RC4_128_MD5", Broken, Ssl30, Tls12),
    suite(0x0009, "TLS_RSA_WITH_DES_CBC_SHA", Broken, Ssl30, Tls11),
    suite(0x0015, "TLS_DHE_RSA_WITH_DES_CBC_SHA", Broken, Ssl30, Tls11),
    suite(0x0003, "TLS_RSA_EXPORT_WITH_RC4_40_MD5", Broken, Ssl30, Tls10),
    suite(0x0008, "TLS_RSA_EXPORT_WITH_DES40_CBC_SHA", Broken, Ssl30, Tls10),
    suite(0x0014, "TLS_DHE_RSA_EXPORT_WITH_DES40_CBC_SHA", Broken, Ssl30, Tls10),
    suite(0x0018, "TLS_DH_anon_WITH_RC4_128_MD5", Broken, Ssl30, Tls12),
    suite(0x0034, "TLS_DH_anon_WITH_AES_128_CBC_SHA", Broken, Ssl30, Tls12),
    suite(0xC018, "TLS_ECDH_anon_WITH_AES_128_CBC_SHA", Broken, Tls10, Tls12),
    suite(0xC010, "TLS_ECDHE_RSA_WITH_NULL_SHA", Broken, Tls10, Tls12),
    suite(0x0002, "TLS_RSA_WITH_NULL_SHA", Broken, Ssl30, Tls12),
    suite(0x0001, "TLS_RSA_WITH_NULL_MD5", Broken, Ssl30, Tls12),
];

/// Suites defined for the given protocol version.
pub fn suites_for(version: ProtocolVersion) -> impl Iterator<Item = &'static CipherSuite> {
    CIPHER_SUITES.iter().filter(move |s| s.min <= version && version <= s.max)
}

pub fn lookup(id: u16) -> Option<&'static CipherSuite> {
    CIPHER_SUITES.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_and_names_are_unique() {
        let ids: HashSet<u16> = CIPHER_SUITES.iter().map(|s| s.id).collect();
        let names: HashSet<&str> = CIPHER_SUITES.iter().map(|s| s.name).collect();
        assert_eq!(ids.len(), CIPHER_SUITES.len());
        assert_eq!(names.len(), CIPHER_SUITES.len());
    }

    #[test]
    fn tls13_only_offers_tls13_suites() {
        let ids: Vec<u16> = suites_for(Tls13).map(|s| s.id).collect();
        assert_eq!(ids, vec![0x1301, 0x1302, 0x1303, 0x1304, 0x1305]);
        assert!(suites_for(Tls12).all(|s| s.id >> 8 != 0x13));
    }

    #[test]
    fn sslv3_excludes_aead_and_ecdhe() {
        assert!(suites_for(Ssl30).all(|s| !s.name.contains("GCM") && !s.name.contains("ECDHE")));
        assert!(suites_for(Ssl30).any(|s| s.id == 0x0005));
    }

    #[test]
    fn classification() {
        assert_eq!(lookup(0xC02F).map(|s| s.quality), Some(Acceptable));
        assert_eq!(lookup(0x000A).map(|s| s.quality), Some(Weak));
        assert_eq!(lookup(0x0004).map(|s| s.quality), Some(Broken));
        assert!(lookup(0xFFFF).is_none());
    }

    #[test]
    fn labels() {
        assert_eq!(Ssl30.label(), "VersionSSL30");
        assert_eq!(Tls13.legacy_wire(), 0x0303);
        assert_eq!(Tls11.legacy_wire(), 0x0302);
    }
}
