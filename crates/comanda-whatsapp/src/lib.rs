//! WhatsApp Web transport for Comanda — pure Rust via `whatsapp-rust`.
//!
//! Speaks the WhatsApp Web protocol (Noise handshake + Signal encryption).
//! Pairing works like WhatsApp Web: scan a QR code from a linked phone.
//! The session is persisted to `{data_dir}/whatsapp_session/session.db`.

pub mod store;
pub mod transport;

pub use transport::WhatsAppTransport;

use comanda_core::error::ComandaError;

/// Normalize a customer phone number into a WhatsApp JID string.
///
/// Accepts anything an operator might paste: `+52 1 55 1234 5678`,
/// `52-1-5512345678`, or an already-formed JID. Non-digits are stripped
/// unless the value already carries a server part.
pub fn to_jid(number: &str) -> String {
    if number.contains('@') {
        return number.to_string();
    }
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}@s.whatsapp.net")
}

/// Extract the bare phone number from a JID string.
pub fn jid_user(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Split a long message into chunks that respect WhatsApp's 4096-char limit.
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Byte offset must land on a char boundary before we can slice.
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len smaller than one char; emit the whole char anyway.
            end = start + text[start..].chars().next().map_or(1, |c| c.len_utf8());
        }
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|i| start + i + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }

    chunks
}

/// Render pairing QR data as a unicode string for terminal display.
pub fn generate_qr_terminal(qr_data: &str) -> Result<String, ComandaError> {
    use qrcode::QrCode;

    let code = QrCode::new(qr_data.as_bytes())
        .map_err(|e| ComandaError::Transport(format!("QR generation failed: {e}")))?;

    let string = code
        .render::<char>()
        .quiet_zone(false)
        .module_dimensions(2, 1)
        .build();

    Ok(string)
}
