use chrono::{DateTime, Utc};
use rand::Rng;

/// Upper-case alphanumerics without 0/O and 1/I/L
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub fn random_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Last-resort code once random candidates keep colliding
pub fn with_timestamp_suffix(code: &str, now: DateTime<Utc>) -> String {
    format!("{}{}", code, to_base36(now.timestamp_millis().max(0) as u64))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_random_code_uses_unambiguous_alphabet() {
        for _ in 0..100 {
            let code = random_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
            assert!(!code.contains('O') && !code.contains('0') && !code.contains('I'));
        }
    }

    #[test]
    fn test_base36_suffix() {
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
        let at = Utc.timestamp_millis_opt(36 * 36).unwrap();
        assert_eq!(with_timestamp_suffix("ABC", at), "ABC100");
    }
}
