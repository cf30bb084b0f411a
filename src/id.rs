//! Correlation identifier generation
//!
//! Identifiers have the shape `<name-prefix><symbol><yyMMdd><random>`.
//! The prefix is the caller's node name cut to five characters and the
//! random tail fills the requested length from a 62-character alphabet.

use rand::Rng;

const ALPHANUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Maximum number of name characters kept in the prefix
pub const NAME_PREFIX_LEN: usize = 5;

/// Length of the `yyMMdd` date stamp
const DATE_LEN: i64 = 6;

/// Length of ids produced by [`generate_xtid`]
pub const XTID_LEN: i64 = 22;

/// Random alphanumeric string of `size` characters; empty when `size < 1`
pub fn nano_id(size: i64) -> String {
    if size < 1 {
        return String::new();
    }
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| ALPHANUM[rng.gen_range(0..ALPHANUM.len())] as char)
        .collect()
}

/// Generate a correlation identifier of `length` characters.
///
/// - `length <= 0` yields `nano_id(length)`, which is always empty.
/// - When `length` cannot hold the date stamp the result is empty.
/// - When `length` holds the date but not the full prefix, the result is
///   `name + symbol + date` and may be shorter than requested.
pub fn generate_internal_tid(name: &str, symbol: &str, length: i64) -> String {
    if length <= 0 {
        return nano_id(length);
    }

    let prefix: String = name.chars().take(NAME_PREFIX_LEN).collect();
    let digits_non_date = length - DATE_LEN;
    if digits_non_date <= 0 {
        return String::new();
    }

    let date = chrono::Local::now().format("%y%m%d").to_string();
    let fixed = (prefix.chars().count() + symbol.chars().count()) as i64;
    let random = digits_non_date - fixed;

    if random > 0 {
        format!("{}{}{}{}", prefix, symbol, date, nano_id(random))
    } else {
        format!("{}{}{}", prefix, symbol, date)
    }
}

/// 22-character transaction id for `node`, separated by `-`
pub fn generate_xtid(node: &str) -> String {
    generate_internal_tid(node, "-", XTID_LEN)
}
