//! HTTPS 证书：优先读取配置的证书与私钥，否则生成内存中的自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use std::io;
use std::net::IpAddr;
use tokio::fs;
use tracing::{info, warn};

/// 构建 Rustls 配置。
pub async fn build_rustls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).await?;
            let key = fs::read(key_path).await?;
            info!(cert = cert_path, "loaded tls certificate");
            RustlsConfig::from_pem(cert, key).await
        }
        (None, None) => {
            let (cert, key) = self_signed_pem(host)?;
            warn!(%host, "no tls certificate configured, using a self-signed one");
            RustlsConfig::from_pem(cert, key).await
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tls cert and key must be configured together",
        )),
    }
}

fn self_signed_pem(host: IpAddr) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(names).map_err(|err| io::Error::other(err.to_string()))?;
    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_certificate_is_pem() {
        let (cert, key) = self_signed_pem("127.0.0.1".parse().expect("ip")).expect("generate");
        assert!(String::from_utf8(cert).expect("utf8").contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8(key).expect("utf8").contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn half_configured_tls_is_rejected() {
        let result = build_rustls_config(Some("cert.pem"), None, "127.0.0.1".parse().expect("ip")).await;
        assert!(matches!(result, Err(err) if err.kind() == io::ErrorKind::InvalidInput));
    }
}
