//! Random value generators used for fabricated hardware identities.

use chrono::{Days, NaiveDate};
use rand::Rng;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SERIAL_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Second hex digit of the first MAC octet. Keeps the address unicast, which
/// VirtualBox host-only adapters insist on.
const MAC_SECOND_NIBBLE: &[u8] = b"02468ace";

/// Window for fabricated BIOS release dates.
const BIOS_DATE_EPOCH: (i32, u32, u32) = (2008, 1, 1);
const BIOS_DATE_SPAN_DAYS: u64 = 2500;

fn pick<R: Rng + ?Sized>(rng: &mut R, charset: &[u8]) -> char {
    charset[rng.random_range(0..charset.len())] as char
}

/// Random ASCII letters, `min..=max` characters long (`max` defaults to `min`).
pub fn random_string(min: usize, max: Option<usize>) -> String {
    let mut rng = rand::rng();
    let max = max.unwrap_or(min).max(min);
    let count = rng.random_range(min..=max);
    (0..count).map(|_| pick(&mut rng, LETTERS)).collect()
}

/// Uppercase alphanumeric serial number; 8 to 20 characters when no length is given.
pub fn random_serial(length: Option<usize>) -> String {
    let mut rng = rand::rng();
    let length = length.unwrap_or_else(|| rng.random_range(8..=20));
    (0..length).map(|_| pick(&mut rng, SERIAL_CHARS)).collect()
}

/// Random MAC address in `xx:xx:xx:xx:xx:xx` form.
pub fn random_mac() -> String {
    let mut rng = rand::rng();
    let mut nibbles: Vec<char> = (0..12)
        .map(|_| {
            char::from_digit(rng.random_range(0..16u32), 16).unwrap_or('0')
        })
        .collect();
    nibbles[1] = pick(&mut rng, MAC_SECOND_NIBBLE);

    nibbles
        .chunks(2)
        .map(|octet| octet.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Random v4 UUID, used for SMBIOS system UUIDs.
pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random BIOS release date in `MM/DD/YYYY` form.
pub fn random_bios_date() -> String {
    let mut rng = rand::rng();
    let (y, m, d) = BIOS_DATE_EPOCH;
    let offset = rng.random_range(0..BIOS_DATE_SPAN_DAYS);
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.checked_add_days(Days::new(offset)))
        .map(|date| date.format("%m/%d/%Y").to_string())
        .unwrap_or_else(|| format!("{:02}/{:02}/{}", m, d, y))
}

/// Check that a MAC address is six colon-separated lowercase-or-uppercase hex octets.
pub fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string_bounds() {
        for _ in 0..200 {
            let s = random_string(4, Some(8));
            assert!((4..=8).contains(&s.len()), "bad length: {}", s);
            assert!(s.chars().all(|c| c.is_ascii_alphabetic()));
        }
        assert_eq!(random_string(5, None).len(), 5);
    }

    #[test]
    fn test_random_serial_charset_and_length() {
        for _ in 0..200 {
            let s = random_serial(None);
            assert!((8..=20).contains(&s.len()));
            assert!(
                s.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            );
        }
        assert_eq!(random_serial(Some(12)).len(), 12);
    }

    #[test]
    fn test_random_mac_shape_and_unicast_nibble() {
        for _ in 0..500 {
            let mac = random_mac();
            assert!(is_valid_mac(&mac), "malformed mac: {}", mac);
            assert_eq!(mac.len(), 17);
            let second = mac.chars().nth(1).unwrap();
            assert!("02468ace".contains(second), "bad second nibble: {}", mac);
            assert_eq!(mac, mac.to_lowercase());
        }
    }

    #[test]
    fn test_is_valid_mac_rejects_malformed() {
        assert!(is_valid_mac("08:00:27:AB:cd:01"));
        assert!(!is_valid_mac("080027abcd01"));
        assert!(!is_valid_mac("08:00:27:ab:cd"));
        assert!(!is_valid_mac("08:00:27:ab:cd:zz"));
        assert!(!is_valid_mac("8:00:27:ab:cd:01"));
    }

    #[test]
    fn test_bios_date_format() {
        for _ in 0..100 {
            let date = random_bios_date();
            let parsed = NaiveDate::parse_from_str(&date, "%m/%d/%Y").unwrap();
            assert!(parsed.format("%Y").to_string().parse::<i32>().unwrap() >= 2008);
        }
    }

    #[test]
    fn test_serials_differ() {
        assert_ne!(random_serial(Some(20)), random_serial(Some(20)));
        assert_ne!(random_uuid(), random_uuid());
    }
}
