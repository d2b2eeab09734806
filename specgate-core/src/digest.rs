//! Digest helpers shared by session ids, time-series keys and the
//! WebSocket handshake.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ring::digest;

/// base64 of sha256(data).
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(digest::digest(&digest::SHA256, data).as_ref())
}

/// URL-safe unpadded base64 of sha256 over each part in order.
pub fn sha256_url_base64(parts: &[&[u8]]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    URL_SAFE_NO_PAD.encode(ctx.finish().as_ref())
}

/// base64 of sha1(data), as required by the RFC 6455 accept key.
pub fn sha1_base64(data: &[u8]) -> String {
    STANDARD.encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // sha256("") is well known
        assert_eq!(
            sha256_base64(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn sha1_websocket_accept_vector() {
        // The example handshake from RFC 6455 section 1.3
        let key = "dGhlIHNhbXBsZSBub25jZQ==258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
        assert_eq!(sha1_base64(key.as_bytes()), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn url_base64_has_no_padding() {
        let id = sha256_url_base64(&[b"peer".as_slice(), b"now".as_slice(), b"rand".as_slice()]);
        assert!(!id.contains('='));
        assert!(!id.contains('+'));
        assert!(!id.contains('/'));
    }
}
