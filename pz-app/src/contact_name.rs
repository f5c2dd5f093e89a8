/// Turns a raw WhatsApp profile name into a first name safe to greet with.
///
/// Returns an empty string when nothing usable remains (emoji-only names,
/// single letters, non-Latin scripts); callers greet generically then.
pub fn sanitize_contact_name(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !is_emoji_or_symbol(*c)).collect();
    let trimmed = stripped.trim();

    if trimmed.chars().count() < 2 || !trimmed.chars().any(is_latin_letter) {
        return String::new();
    }

    let Some(first) = trimmed.split_whitespace().next() else {
        return String::new();
    };

    let mut chars = first.chars();
    match chars.next() {
        Some(head) => head
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn is_emoji_or_symbol(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF
            | 0x2600..=0x27BF
            | 0x2300..=0x23FF
            | 0x2B00..=0x2BFF
            | 0x2190..=0x21FF
            | 0x3030
            | 0x303D
            | 0x3297
            | 0x3299
            | 0xFE00..=0xFE0F
            | 0x200D
            | 0x20E3
            | 0xE000..=0xF8FF
            | 0xE0020..=0xE007F
    )
}

fn is_latin_letter(c: char) -> bool {
    c.is_ascii_alphabetic() || (('\u{00C0}'..='\u{024F}').contains(&c) && c != '×' && c != '÷')
}

#[cfg(test)]
mod tests {
    use super::sanitize_contact_name;

    #[test]
    fn emoji_only_names_are_dropped() {
        assert_eq!(sanitize_contact_name("🔥🔥🔥"), "");
        assert_eq!(sanitize_contact_name("❤️"), "");
        assert_eq!(sanitize_contact_name(""), "");
    }

    #[test]
    fn first_name_is_capitalized() {
        assert_eq!(sanitize_contact_name("joão"), "João");
        assert_eq!(sanitize_contact_name("Maria Clara"), "Maria");
        assert_eq!(sanitize_contact_name("CARLOS EDUARDO"), "Carlos");
        assert_eq!(sanitize_contact_name("  🔥 ana paula 🔥 "), "Ana");
    }

    #[test]
    fn short_or_non_latin_names_are_dropped() {
        assert_eq!(sanitize_contact_name("J"), "");
        assert_eq!(sanitize_contact_name("🚗 J"), "");
        assert_eq!(sanitize_contact_name("123"), "");
        assert_eq!(sanitize_contact_name("Дмитрий"), "");
    }
}
