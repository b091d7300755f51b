//! Per-attribute similarity functions. Every function returns a score in
//! `[0, 1]` and is symmetric in its arguments.

use crate::domain::models::{GattCharacteristic, GattTree, NO_VALUE};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Service similarity above which a service match earns the bonus.
pub const GOOD_SERVICE_MATCH: f64 = 0.8;
const GOOD_SERVICE_BONUS: f64 = 1.1;

/// A comparable attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Gatt(Arc<GattTree>),
}

impl AttributeValue {
    /// Short human-readable rendering.
    pub fn display(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(number) => number.to_string(),
            Self::Gatt(tree) => format!(
                "{} services, {} characteristics",
                tree.services.len(),
                tree.characteristics.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    Exact,
    Text,
    Numeric,
    Hex,
    Uuids,
    GattServices,
}

impl Similarity {
    /// Scores two values. Values of a shape the function does not handle score 0.
    pub fn score(self, a: &AttributeValue, b: &AttributeValue) -> f64 {
        use AttributeValue::*;

        match (self, a, b) {
            (Self::Exact, a, b) => exact(a, b),
            (Self::Text, Text(a), Text(b)) => text(a, b),
            (Self::Numeric, Number(a), Number(b)) => numeric(*a, *b),
            (Self::Hex, Text(a), Text(b)) => hex(a, b),
            (Self::Uuids, Text(a), Text(b)) => uuids(a, b),
            (Self::GattServices, Gatt(a), Gatt(b)) => gatt_services(a, b),
            _ => 0.0,
        }
    }
}

fn is_no_value(value: &str) -> bool {
    value.is_empty() || value == NO_VALUE
}

pub fn exact<T: PartialEq>(a: &T, b: &T) -> f64 {
    if a == b {
        1.0
    } else {
        0.0
    }
}

/// Matching-blocks ratio `2M / (|a| + |b|)` over characters.
///
/// Operands are put in a fixed order first: the greedy block search is not
/// symmetric on its own.
pub fn text(a: &str, b: &str) -> f64 {
    if is_no_value(a) || is_no_value(b) {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let first: Vec<char> = first.chars().collect();
    let second: Vec<char> = second.chars().collect();
    let matched = matching_characters(&first, &second);
    2.0 * matched as f64 / (first.len() + second.len()) as f64
}

fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut positions: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, ch) in b.iter().enumerate() {
        positions.entry(*ch).or_default().push(j);
    }

    let mut matched = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((a_lo, a_hi, b_lo, b_hi)) = queue.pop() {
        let (i, j, size) = longest_match(a, &positions, a_lo, a_hi, b_lo, b_hi);
        if size == 0 {
            continue;
        }
        matched += size;
        if a_lo < i && b_lo < j {
            queue.push((a_lo, i, b_lo, j));
        }
        if i + size < a_hi && j + size < b_hi {
            queue.push((i + size, a_hi, j + size, b_hi));
        }
    }
    matched
}

/// Longest common block of `a[a_lo..a_hi]` and `b[b_lo..b_hi]`, earliest in `a` on ties.
fn longest_match(
    a: &[char],
    positions: &HashMap<char, Vec<usize>>,
    a_lo: usize,
    a_hi: usize,
    b_lo: usize,
    b_hi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (a_lo, b_lo, 0);
    let mut run_at: HashMap<usize, usize> = HashMap::new();

    for (i, ch) in a.iter().enumerate().take(a_hi).skip(a_lo) {
        let mut next_run: HashMap<usize, usize> = HashMap::new();
        if let Some(js) = positions.get(ch) {
            for &j in js {
                if j < b_lo {
                    continue;
                }
                if j >= b_hi {
                    break;
                }
                let previous = if j > 0 {
                    run_at.get(&(j - 1)).copied().unwrap_or(0)
                } else {
                    0
                };
                let size = previous + 1;
                next_run.insert(j, size);
                if size > best_size {
                    best_i = i + 1 - size;
                    best_j = j + 1 - size;
                    best_size = size;
                }
            }
        }
        run_at = next_run;
    }
    (best_i, best_j, best_size)
}

pub fn numeric(a: f64, b: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    if a == 0.0 || b == 0.0 {
        return 0.0;
    }
    let score = 1.0 - (a - b).abs() / a.abs().max(b.abs());
    score.clamp(0.0, 1.0)
}

/// Bitwise agreement of two hex strings. Non-hex characters (separators)
/// are skipped.
pub fn hex(a: &str, b: &str) -> f64 {
    if is_no_value(a) || is_no_value(b) {
        return 0.0;
    }
    let (left, right) = (hex_bytes(a), hex_bytes(b));
    if left.is_empty() && right.is_empty() {
        return exact(&a, &b);
    }
    binary(&left, &right)
}

fn hex_bytes(value: &str) -> Vec<u8> {
    let digits: Vec<u8> = value
        .chars()
        .filter_map(|ch| ch.to_digit(16))
        .map(|d| d as u8)
        .collect();
    digits
        .chunks(2)
        .map(|pair| match pair {
            [high, low] => high << 4 | low,
            [high] => high << 4,
            _ => 0,
        })
        .collect()
}

/// Fraction of equal bits, the shorter input right-padded with zero bytes.
pub fn binary(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let len = a.len().max(b.len());
    let total_bits = (len * 8) as f64;
    let equal_bits: u32 = (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            8 - (x ^ y).count_ones()
        })
        .sum();
    f64::from(equal_bits) / total_bits
}

fn uuid_set(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(|uuid| uuid.trim().to_ascii_lowercase())
        .filter(|uuid| !uuid.is_empty())
        .collect()
}

/// Mean of the Jaccard index and the overlap coefficient, so a superset of
/// the shorter list scores close to 1.
pub fn uuids(a: &str, b: &str) -> f64 {
    if is_no_value(a) || is_no_value(b) {
        return 0.0;
    }
    let a = uuid_set(a);
    let b = uuid_set(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    let jaccard = shared / union;
    let overlap = shared / a.len().min(b.len()) as f64;
    ((jaccard + overlap) / 2.0).min(1.0)
}

fn characteristic_score(a: &GattCharacteristic, b: &GattCharacteristic) -> f64 {
    if a.uuid != b.uuid {
        return 0.0;
    }
    // Unread values on both sides agree.
    if a.value == b.value {
        1.0
    } else if a.description == b.description {
        0.9
    } else {
        0.5
    }
}

/// Structural similarity of two GATT snapshots.
pub fn gatt_services(a: &GattTree, b: &GattTree) -> f64 {
    let service_count = a.services.len().max(b.services.len());
    if service_count == 0 {
        return 0.0;
    }

    let mut total = 0.0;
    for service in &a.services {
        let Some(other) = b.service(service.handle) else {
            continue;
        };
        if other.uuid != service.uuid || other.description != service.description {
            continue;
        }

        let ours: Vec<&GattCharacteristic> = a.characteristics_of(service.handle).collect();
        let theirs: HashMap<u16, &GattCharacteristic> = b
            .characteristics_of(other.handle)
            .map(|c| (c.handle, c))
            .collect();
        let char_count = ours.len().max(theirs.len());

        let mut service_score = if char_count == 0 {
            1.0
        } else {
            let hits: f64 = ours
                .iter()
                .filter_map(|c| theirs.get(&c.handle).map(|o| characteristic_score(c, o)))
                .sum();
            hits / char_count as f64
        };
        if service_score > GOOD_SERVICE_MATCH {
            service_score = (service_score * GOOD_SERVICE_BONUS).min(1.0);
        }
        total += service_score;
    }

    (total / service_count as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{GattService, GattValue};
    use std::collections::BTreeSet;

    fn characteristic(handle: u16, service: u16, uuid: &str, value: Option<&str>) -> GattCharacteristic {
        GattCharacteristic {
            uuid: uuid.to_string(),
            description: format!("char {}", uuid),
            handle,
            service_handle: service,
            properties: BTreeSet::from(["read".to_string()]),
            value: value.map(|v| GattValue::Text(v.to_string())),
        }
    }

    fn tree(battery: &str) -> GattTree {
        GattTree {
            services: vec![
                GattService {
                    uuid: "1800".into(),
                    description: "Generic Access Profile".into(),
                    handle: 1,
                },
                GattService {
                    uuid: "180f".into(),
                    description: "Battery Service".into(),
                    handle: 10,
                },
            ],
            characteristics: vec![
                characteristic(2, 1, "2a00", Some("Pixel 7")),
                characteristic(4, 1, "2a01", Some("0000")),
                characteristic(11, 10, "2a19", Some(battery)),
            ],
            descriptors: Vec::new(),
        }
    }

    #[test]
    fn test_text_ratio() {
        assert!((text("abcd", "bcde") - 0.75).abs() < 1e-9);
        assert_eq!(text("Pixel 7", "Pixel 7"), 1.0);
        assert_eq!(text("", "abc"), 0.0);
        assert_eq!(text(NO_VALUE, NO_VALUE), 0.0);
        assert_eq!(text("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_text_is_symmetric() {
        let pairs = [
            ("tide", "diet"),
            ("Galaxy Buds", "Buds Galaxy"),
            ("abxcd", "abcd"),
            ("aaab", "abaa"),
        ];
        for (a, b) in pairs {
            assert_eq!(text(a, b), text(b, a), "{} / {}", a, b);
        }
    }

    #[test]
    fn test_numeric() {
        assert_eq!(numeric(0.0, 0.0), 1.0);
        assert_eq!(numeric(0.0, 5.0), 0.0);
        assert!((numeric(50.0, 100.0) - 0.5).abs() < 1e-9);
        assert_eq!(numeric(-4.0, 4.0), 0.0);
        assert_eq!(numeric(100.0, 50.0), numeric(50.0, 100.0));
    }

    #[test]
    fn test_hex_bit_agreement() {
        assert_eq!(hex("ff00", "ff00"), 1.0);
        assert_eq!(hex("ff", "00"), 0.0);
        // 0x0f vs 0x0e differ in one bit; the missing byte pads to 0x00
        assert!((hex("0f", "0e00") - 15.0 / 16.0).abs() < 1e-9);
        assert_eq!(hex("0f", "0e00"), hex("0e00", "0f"));
        assert_eq!(hex("", "ff"), 0.0);
        assert_eq!(hex("0102,1205", "0102,1205"), 1.0);
        assert_eq!(hex("zz", "zz"), 1.0);
        assert_eq!(hex("zz", "yy"), 0.0);
    }

    #[test]
    fn test_uuids() {
        assert_eq!(uuids("a,b", "b,a"), 1.0);
        assert_eq!(uuids("a", "b"), 0.0);
        // subset: jaccard 1/2, overlap 1
        assert!((uuids("a", "a,b") - 0.75).abs() < 1e-9);
        assert_eq!(uuids("a,b,c", "c,d"), uuids("c,d", "a,b,c"));
        assert_eq!(uuids(NO_VALUE, "a"), 0.0);
    }

    #[test]
    fn test_gatt_services_identity_and_partial() {
        let a = tree("64");
        assert_eq!(gatt_services(&a, &a), 1.0);

        // battery value differs: 0.9 for the char, boosted to 0.99
        let b = tree("12");
        let score = gatt_services(&a, &b);
        assert!((score - (1.0 + 0.99) / 2.0).abs() < 1e-9, "{}", score);
        assert_eq!(score, gatt_services(&b, &a));

        assert_eq!(gatt_services(&GattTree::default(), &GattTree::default()), 0.0);
        assert_eq!(gatt_services(&a, &GattTree::default()), 0.0);
    }

    #[test]
    fn test_unread_characteristics_match_themselves() {
        let mut notify_only = characteristic(11, 10, "2a19", None);
        notify_only.properties = BTreeSet::from(["notify".to_string()]);
        let tree = GattTree {
            services: vec![GattService {
                uuid: "180f".into(),
                description: "Battery Service".into(),
                handle: 10,
            }],
            characteristics: vec![notify_only],
            descriptors: Vec::new(),
        };
        assert_eq!(gatt_services(&tree, &tree), 1.0);

        let mut read = tree.clone();
        read.characteristics[0].value = Some(GattValue::Hex("64".into()));
        assert!(gatt_services(&tree, &read) < 1.0);
    }

    #[test]
    fn test_empty_service_counts_as_match() {
        let tree = GattTree {
            services: vec![GattService {
                uuid: "1801".into(),
                description: "Generic Attribute Profile".into(),
                handle: 5,
            }],
            ..Default::default()
        };
        assert_eq!(gatt_services(&tree, &tree), 1.0);
    }

    #[test]
    fn test_score_dispatch() {
        let a = AttributeValue::Text("AA:BB".into());
        let b = AttributeValue::Number(3.0);
        assert_eq!(Similarity::Exact.score(&a, &a), 1.0);
        assert_eq!(Similarity::Text.score(&a, &b), 0.0);
        assert_eq!(Similarity::Numeric.score(&b, &b), 1.0);
    }
}
