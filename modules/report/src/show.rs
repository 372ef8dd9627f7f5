//! Flat inventory listing of a snapshot, one row per process port.

use crate::ViolationReport;
use fleetaudit_core::{Snapshot, TlsInformation};
use time::format_description::well_known::Rfc3339;

pub const SHOW_TITLE: &str = "Inventory:";

pub fn inventory(snapshot: &Snapshot) -> ViolationReport {
    let mut report = ViolationReport::new(
        SHOW_TITLE,
        &["Identity", "Address", "Process", "PID", "User", "Port", "State", "TLS"],
    );
    for host in &snapshot.hosts {
        for process in &host.processes {
            for port in &process.ports {
                report.push(vec![
                    host.identity().to_string(),
                    host.address.clone(),
                    process.command_name.clone(),
                    process.pid.to_string(),
                    process.user.clone(),
                    format!("{}/{}", port.number, port.protocol),
                    port.state.clone(),
                    port.tls.as_ref().map(tls_summary).unwrap_or_default(),
                ]);
            }
        }
    }
    report
}

/// `✓ (size: 2048, expires: ..., subject: ...) (VersionTLS12: [NAME - quality ...])` for TLS
/// endpoints, `✗` otherwise.
pub fn tls_summary(tls: &TlsInformation) -> String {
    if let Some(err) = &tls.scan_error {
        return format!("? ({err})");
    }
    if !tls.presence {
        return "✗".to_string();
    }
    let mut out = String::from("✓");
    match &tls.certificate {
        Some(cert) => {
            let expires = cert.expiration.format(&Rfc3339).unwrap_or_default();
            out.push_str(&format!(" (size: {}, expires: {expires}, subject: {})", cert.bits, cert.subject));
        }
        None => out.push_str(" (no certificate information found; maybe mutual tls?)"),
    }
    if tls.mutual {
        out.push_str(" (mutual)");
    }
    for (version, ciphers) in &tls.ciphers {
        let list: Vec<String> = ciphers.iter().map(|c| format!("{} - {}", c.name, c.quality.as_str())).collect();
        out.push_str(&format!(" ({version}: [{}])", list.join(" ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetaudit_core::{
        AcceptedCipher, Certificate, CertificateSubject, CipherQuality, HostResult, Port, Process, Transport, LISTEN,
    };
    use time::macros::datetime;

    #[test]
    fn one_row_per_port() {
        let mut host = HostResult::new("router/0", "10.0.0.7");
        host.processes = vec![Process {
            command_name: "gorouter".into(),
            pid: 4242,
            user: "vcap".into(),
            ports: vec![
                Port::new(Transport::Tcp, "0.0.0.0", 80, LISTEN).with_tls(TlsInformation::default()),
                Port::new(Transport::Udp, "0.0.0.0", 8125, ""),
            ],
            ..Default::default()
        }];
        let report = inventory(&Snapshot::new(vec![host]));
        assert_eq!(
            report.rows,
            vec![
                vec!["router/0", "10.0.0.7", "gorouter", "4242", "vcap", "80/tcp", "LISTEN", "✗"],
                vec!["router/0", "10.0.0.7", "gorouter", "4242", "vcap", "8125/udp", "", ""],
            ]
        );
    }

    #[test]
    fn summary_carries_certificate_and_ciphers() {
        let mut tls = TlsInformation {
            presence: true,
            certificate: Some(Certificate {
                bits: 2048,
                expiration: datetime!(2027-01-01 0:00 UTC),
                subject: CertificateSubject { common_name: "router".into(), ..Default::default() },
            }),
            ..Default::default()
        };
        tls.ciphers.insert(
            "VersionTLS12".into(),
            vec![
                AcceptedCipher::new("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", CipherQuality::Acceptable),
                AcceptedCipher::new("TLS_RSA_WITH_RC4_128_SHA", CipherQuality::Broken),
            ],
        );
        assert_eq!(
            tls_summary(&tls),
            "✓ (size: 2048, expires: 2027-01-01T00:00:00Z, subject: /C=/ST=/L=/O=/CN=router) \
             (VersionTLS12: [TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 - acceptable TLS_RSA_WITH_RC4_128_SHA - broken])"
        );
    }

    #[test]
    fn summary_without_certificate() {
        let tls = TlsInformation { presence: true, mutual: true, ..Default::default() };
        assert_eq!(tls_summary(&tls), "✓ (no certificate information found; maybe mutual tls?) (mutual)");
        assert_eq!(tls_summary(&TlsInformation::failed("timed out")), "? (timed out)");
    }
}
