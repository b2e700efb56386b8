//! IMAP connection plumbing
//!
//! TLS on 993 with `AUTHENTICATE XOAUTH2`. The session type alias saves
//! writing the full generic stack everywhere: a TLS-encrypted TCP stream
//! wrapped in the tokio compat layer.

use async_imap::Session;
use async_native_tls::TlsStream;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::OneboxError;

pub type ImapSession = Session<TlsStream<TcpStream>>;

/// How long a best-effort LOGOUT may take before the socket is dropped.
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(2);

/// SASL XOAUTH2 initial response. async-imap base64-encodes on the wire,
/// so `process` returns the raw `user=...\x01auth=Bearer ...\x01\x01` form.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Derive the IMAP host for an address when no fixed host is configured.
pub fn derive_host(email: &str) -> String {
    match email.rsplit('@').next() {
        Some(domain) if !domain.is_empty() => format!("imap.{}", domain),
        _ => email.to_string(),
    }
}

/// Open an IMAPS session and authenticate with a bearer token.
pub async fn connect(
    host: &str,
    port: u16,
    email: &str,
    access_token: &str,
    timeout: Duration,
) -> Result<ImapSession, OneboxError> {
    info!(host = %host, port = port, account = %email, "Connecting to IMAP server");

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| OneboxError::Network(format!("connect to {}:{} timed out", host, port)))?
        .map_err(|e| OneboxError::Network(format!("TCP connection failed: {}", e)))?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tokio::time::timeout(timeout, tls.connect(host, tcp))
        .await
        .map_err(|_| OneboxError::Network("TLS handshake timed out".to_string()))?
        .map_err(|e| OneboxError::Network(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let authenticator = XOAuth2 {
        user: email.to_string(),
        access_token: access_token.to_string(),
    };

    let session = client
        .authenticate("XOAUTH2", authenticator)
        .await
        .map_err(|(e, _)| map_auth_error(e))?;

    debug!(account = %email, "IMAP session established");
    Ok(session)
}

// AUTHENTICATE failures are authorization problems (bad/expired token);
// anything else on that path is a transport or protocol fault.
fn map_auth_error(err: async_imap::error::Error) -> OneboxError {
    match err {
        async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
            OneboxError::Unauthorized
        }
        async_imap::error::Error::Io(e) => OneboxError::Network(e.to_string()),
        other => OneboxError::Protocol(other.to_string()),
    }
}

/// Log out without letting a slow server hold up a stop.
pub async fn logout_quietly(mut session: ImapSession, account: &str) {
    match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
        Ok(Ok(())) => debug!(account = %account, "IMAP logout complete"),
        Ok(Err(e)) => debug!(account = %account, error = %e, "IMAP logout failed"),
        Err(_) => debug!(account = %account, "IMAP logout timed out, dropping connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_response_has_sasl_shape() {
        let mut auth = XOAuth2 {
            user: "a@x.com".to_string(),
            access_token: "tok123".to_string(),
        };
        let response = async_imap::Authenticator::process(&mut auth, b"");
        assert_eq!(response, "user=a@x.com\x01auth=Bearer tok123\x01\x01");
    }

    #[test]
    fn host_derivation_uses_address_domain() {
        assert_eq!(derive_host("a@gmail.com"), "imap.gmail.com");
        assert_eq!(derive_host("user@fastmail.com"), "imap.fastmail.com");
        assert_eq!(derive_host("not-an-address"), "not-an-address");
    }
}
