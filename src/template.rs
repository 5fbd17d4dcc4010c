//! Filename templating for raw-blob archiving.
//!
//! Substitutions: `%t` start timestamp (`YYYYMMDDThhmmss`), `%f` fingerprint
//! as upper-case hex, `%n` monotonic counter, `%%` a literal percent. Any
//! other `%` sequence is copied through unchanged.

use chrono::NaiveDateTime;

use crate::codec::bin2hex;

pub fn expand(
    template: &str,
    datetime: &NaiveDateTime,
    fingerprint: &[u8],
    counter: u32,
) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push_str(&datetime.format("%Y%m%dT%H%M%S").to_string()),
            Some('f') => out.push_str(&bin2hex(fingerprint)),
            Some('n') => out.push_str(&format!("{counter:03}")),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn substitutions() {
        let name = expand("%t-%n-%f.bin", &dt(), &[0xde, 0xad], 7);
        assert_eq!(name, "20240601T103000-007-DEAD.bin");
    }

    #[test]
    fn literal_percent_and_unknown() {
        assert_eq!(expand("a%%b%q", &dt(), &[], 0), "a%b%q");
        assert_eq!(expand("tail%", &dt(), &[], 0), "tail%");
    }
}
