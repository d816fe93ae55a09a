//! Converting binary data to a `data:` URL.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Encode binary data as standard Base64.
pub fn base64_encode(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // Some sources indicate that the Base64 data should be percent-encoded, but
    // in practice this breaks several vision APIs.
    format!("data:{};base64,{}", mime_type, base64_encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_data_urls() {
        assert_eq!(data_url("image/png", b"hi"), "data:image/png;base64,aGk=");
    }
}
