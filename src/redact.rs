//! Secret masking for log output.
//!
//! Every byte written by the tracing subscriber passes through
//! [`RedactingWriter`], which replaces registered secrets (the active WPS
//! PIN, any psk/passphrase value spotted in a message) with a fixed mask
//! before the line reaches the sink.

use std::io::{self, Write};
use std::sync::{LazyLock, RwLock};

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

const MASK: &str = "********";

static PATTERNS: LazyLock<RwLock<Vec<String>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

static PSK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[ \t]psk[ \t]+("?[^" \t']+"?)"#).unwrap());
static PASSPHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"passphrase=("?[^" \t']+"?)"#).unwrap());

/// Register a secret so it never appears in any log line.
pub fn register_secret(secret: &str) {
    if secret.is_empty() {
        return;
    }
    let mut patterns = PATTERNS.write().unwrap();
    if !patterns.iter().any(|p| p == secret) {
        patterns.push(secret.to_string());
    }
}

/// Drop all registered secrets (test support).
#[cfg(test)]
pub fn clear_secrets() {
    PATTERNS.write().unwrap().clear();
}

/// Mask every registered secret in `msg`, learning psk/passphrase values
/// on the fly.
pub fn apply(msg: &str) -> String {
    for re in [&*PSK_RE, &*PASSPHRASE_RE] {
        if let Some(caps) = re.captures(msg) {
            register_secret(caps[1].trim_matches('"'));
        }
    }
    let patterns = PATTERNS.read().unwrap();
    let mut out = msg.to_string();
    for pattern in patterns.iter() {
        out = out.replace(pattern, MASK);
    }
    out
}

/// An [`io::Write`] wrapper applying [`apply`] to each chunk.
pub struct RedactingWriter<W> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(apply(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter installing [`RedactingWriter`] over any sink.
pub struct RedactingMakeWriter<M>(pub M);

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.0.make_writer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn registered_secret_is_masked() {
        clear_secrets();
        register_secret("93430999");
        assert_eq!(apply("wps_pin aa:bb 93430999"), "wps_pin aa:bb ********");
    }

    #[test]
    #[serial]
    fn passphrase_is_learned_and_masked() {
        clear_secrets();
        let masked = apply("network 0 passphrase=\"hunter2\" flags=[P2P]");
        assert!(!masked.contains("hunter2"), "got: {masked}");
    }

    #[test]
    #[serial]
    fn psk_value_is_learned() {
        clear_secrets();
        let masked = apply("set_network 0 psk \"topsecret\"");
        assert!(!masked.contains("topsecret"), "got: {masked}");
        // Once learned, the bare value is masked everywhere.
        assert!(!apply("echo topsecret").contains("topsecret"));
    }

    #[test]
    #[serial]
    fn empty_secret_is_ignored() {
        clear_secrets();
        register_secret("");
        assert_eq!(apply("plain line"), "plain line");
    }
}
