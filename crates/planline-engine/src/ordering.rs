//! Fractional-index sort keys.
//!
//! A key is a base-62 fraction written without the leading `0.`, using the
//! digits `0-9A-Za-z` (ASCII order equals digit order, so plain string
//! comparison orders keys). Keys never end in `0`, which guarantees another
//! key always exists below any key.
//!
//! `sort_key` is the canonical order of a sibling group. `display_order` is
//! derived from it: 1..N by physical position.

use planline_core::Task;

use crate::error::OrderingError;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = DIGITS.len();

fn digit_value(b: u8) -> Option<usize> {
    match b {
        b'0'..=b'9' => Some(usize::from(b - b'0')),
        b'A'..=b'Z' => Some(usize::from(b - b'A') + 10),
        b'a'..=b'z' => Some(usize::from(b - b'a') + 36),
        _ => None,
    }
}

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.ends_with('0') && key.bytes().all(|b| digit_value(b).is_some())
}

fn check_bounds(before: Option<&str>, after: Option<&str>) -> Result<(), OrderingError> {
    for key in before.into_iter().chain(after) {
        if !is_valid_key(key) {
            return Err(OrderingError::InvalidKey(key.to_string()));
        }
    }
    if let (Some(before), Some(after)) = (before, after) {
        if before >= after {
            return Err(OrderingError::OutOfOrder {
                before: before.to_string(),
                after: after.to_string(),
            });
        }
    }
    Ok(())
}

/// A key strictly between `before` and `after`. `None` is an open end.
pub fn generate_insert_key(
    before: Option<&str>,
    after: Option<&str>,
) -> Result<String, OrderingError> {
    check_bounds(before, after)?;
    Ok(midpoint(before, after))
}

/// `n` ascending keys strictly between `before` and `after`, spread by
/// repeated bisection so their length grows logarithmically.
pub fn generate_n_keys(
    before: Option<&str>,
    after: Option<&str>,
    n: usize,
) -> Result<Vec<String>, OrderingError> {
    check_bounds(before, after)?;
    let mut keys = Vec::with_capacity(n);
    spread(before, after, n, &mut keys);
    Ok(keys)
}

fn spread(lo: Option<&str>, hi: Option<&str>, n: usize, out: &mut Vec<String>) {
    if n == 0 {
        return;
    }
    let mid = midpoint(lo, hi);
    let left = n / 2;
    spread(lo, Some(mid.as_str()), left, out);
    let right_lo = mid.clone();
    out.push(mid);
    spread(Some(right_lo.as_str()), hi, n - left - 1, out);
}

fn midpoint(lo: Option<&str>, hi: Option<&str>) -> String {
    let lo = lo.unwrap_or("");
    match hi {
        Some(hi) => {
            let mut out = String::new();
            midpoint_into(lo.as_bytes(), Some(hi.as_bytes()), &mut out);
            out
        }
        None => increment(lo),
    }
}

// Appending bumps the first digit that can still grow instead of bisecting
// towards the open end, so runs of appends stay short.
fn increment(lo: &str) -> String {
    match lo.bytes().position(|b| b != b'z') {
        Some(i) => {
            let digit = digit_value(lo.as_bytes()[i]).unwrap_or(0);
            let mut out = lo[..i].to_string();
            out.push(char::from(DIGITS[digit + 1]));
            out
        }
        None => format!("{lo}V"),
    }
}

// Bounds are valid and lo < hi.
fn midpoint_into(lo: &[u8], hi: Option<&[u8]>, out: &mut String) {
    if let Some(hi) = hi {
        // Shared prefix, reading missing `lo` digits as zero.
        let mut n = 0;
        while n < hi.len() && lo.get(n).copied().unwrap_or(b'0') == hi[n] {
            n += 1;
        }
        if n > 0 {
            out.extend(hi[..n].iter().map(|&b| char::from(b)));
            let lo_rest = lo.get(n..).unwrap_or(&[]);
            midpoint_into(lo_rest, Some(&hi[n..]), out);
            return;
        }
    }

    let digit_lo = lo.first().and_then(|&b| digit_value(b)).unwrap_or(0);
    let digit_hi = hi.map_or(BASE, |h| h.first().and_then(|&b| digit_value(b)).unwrap_or(0));

    if digit_hi - digit_lo > 1 {
        out.push(char::from(DIGITS[(digit_lo + digit_hi + 1) / 2]));
    } else if let Some(hi) = hi.filter(|h| h.len() > 1) {
        out.push(char::from(hi[0]));
    } else {
        out.push(char::from(DIGITS[digit_lo]));
        midpoint_into(lo.get(1..).unwrap_or(&[]), None, out);
    }
}

/// Health of one sibling group, in physical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupCheck {
    /// `display_order` reads exactly 1..N.
    pub display_order_consistent: bool,
    /// Every key is valid and keys strictly increase.
    pub keys_valid: bool,
}

impl GroupCheck {
    pub fn is_healthy(&self) -> bool {
        self.display_order_consistent && self.keys_valid
    }
}

pub fn check_group(siblings: &[&Task]) -> GroupCheck {
    let display_order_consistent = siblings
        .iter()
        .enumerate()
        .all(|(i, task)| task.display_order as usize == i + 1);
    let keys_valid = siblings.iter().all(|task| is_valid_key(&task.sort_key))
        && siblings.windows(2).all(|w| w[0].sort_key < w[1].sort_key);
    GroupCheck {
        display_order_consistent,
        keys_valid,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    /// 1..N by physical position.
    pub display_orders: Vec<u32>,
    /// Replacement keys in physical order, present only when the group's
    /// keys were broken.
    pub sort_keys: Option<Vec<String>>,
}

pub fn normalize_group(siblings: &[&Task]) -> Normalized {
    let display_orders = (1..=siblings.len()).map(|i| i as u32).collect();
    let sort_keys = (!check_group(siblings).keys_valid).then(|| {
        let mut keys = Vec::with_capacity(siblings.len());
        spread(None, None, siblings.len(), &mut keys);
        keys
    });
    Normalized {
        display_orders,
        sort_keys,
    }
}
