//! Outbound reply sanitization for the messaging channel.
//!
//! The upstream agent speaks markdown; WhatsApp uses single-asterisk bold
//! and renders `**` literally, so emphasis markers are flattened before a
//! reply goes out.

/// Flatten markdown emphasis to WhatsApp formatting.
///
/// `**bold**` becomes `*bold*`; already-native `*bold*` passes through.
pub fn flatten_emphasis(text: &str) -> String {
    text.replace("**", "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_double_asterisks() {
        assert_eq!(
            flatten_emphasis("our **special** today"),
            "our *special* today"
        );
    }

    #[test]
    fn test_native_formatting_passes_through() {
        assert_eq!(flatten_emphasis("*bold* and _italic_"), "*bold* and _italic_");
    }

    #[test]
    fn test_plain_text_unchanged() {
        let plain = "Hamburguesa clásica $15.000";
        assert_eq!(flatten_emphasis(plain), plain);
    }
}
