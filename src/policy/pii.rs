//! Rule-based PII detection
//!
//! Pattern detectors for email, phone, government-ID (SSN-like), credit
//! card (Luhn-validated 13-19 digits), and IP address. Each detector
//! reports a count and redacted examples; the aggregate risk score weights
//! kinds by sensitivity and caps at 1.0.
//!
//! An ML-based detector can be layered on top via [`PiiScan::merge`]: its
//! findings are merged into the rule-based scan, never replacing it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::PiiFlags;

/// PII kind identifiers, used in flags, penalties, and consent records
pub mod kinds {
    /// Email address
    pub const EMAIL: &str = "email";
    /// Phone number
    pub const PHONE: &str = "phone";
    /// Government id (SSN-like pattern)
    pub const GOVERNMENT_ID: &str = "government_id";
    /// Credit card number (Luhn-valid)
    pub const CREDIT_CARD: &str = "credit_card";
    /// IP address
    pub const IP_ADDRESS: &str = "ip_address";
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap()
});

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d{1,2}[\s.\-]?\(?\d{3}\)?[\s.\-]?\d{3}[\s.\-]?\d{4}\b").unwrap()
});

static GOVERNMENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

static CARD_CANDIDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ \-]?){13,19}\b").unwrap());

static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

/// Result of scanning one text
#[derive(Debug, Clone, Default)]
pub struct PiiScan {
    /// Detected kinds with occurrence counts
    pub flags: PiiFlags,
    /// Redacted examples per kind, for audit detail
    pub examples: Vec<(String, String)>,
    /// Aggregate risk in [0, 1]
    pub risk_score: f32,
}

impl PiiScan {
    /// Whether anything was detected
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }

    /// Merge another scan in (e.g. from an additional ML detector).
    /// Counts add, examples append, risk is recomputed from the union.
    pub fn merge(&mut self, other: PiiScan) {
        self.flags.merge(&other.flags);
        self.examples.extend(other.examples);
        self.risk_score = risk_score(&self.flags);
    }
}

/// Risk weight for one kind
fn kind_weight(kind: &str) -> f32 {
    match kind {
        kinds::GOVERNMENT_ID => 0.5,
        kinds::CREDIT_CARD => 0.4,
        kinds::EMAIL | kinds::PHONE => 0.1,
        kinds::IP_ADDRESS => 0.05,
        _ => 0.1,
    }
}

/// Aggregate weighted risk for a flag set, capped at 1.0
pub fn risk_score(flags: &PiiFlags) -> f32 {
    flags
        .kinds()
        .iter()
        .map(|kind| kind_weight(kind))
        .sum::<f32>()
        .min(1.0)
}

fn redact(sample: &str) -> String {
    let visible: String = sample.chars().take(2).collect();
    format!("{visible}{}", "*".repeat(sample.chars().count().saturating_sub(2).min(8)))
}

fn luhn_valid(digits: &[u8]) -> bool {
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let mut sum = 0u32;
    let mut double = false;
    for &d in digits.iter().rev() {
        let mut value = d as u32;
        if double {
            value *= 2;
            if value > 9 {
                value -= 9;
            }
        }
        sum += value;
        double = !double;
    }
    sum % 10 == 0
}

fn valid_ip(candidate: &str) -> bool {
    candidate
        .split('.')
        .all(|octet| octet.parse::<u16>().map(|v| v <= 255).unwrap_or(false))
}

/// Scan a text with all rule-based detectors
pub fn scan_text(text: &str) -> PiiScan {
    let mut scan = PiiScan::default();

    let mut record = |kind: &str, matches: Vec<&str>| {
        if matches.is_empty() {
            return;
        }
        scan.flags.record(kind, matches.len() as u32);
        if let Some(first) = matches.first() {
            scan.examples.push((kind.to_string(), redact(first)));
        }
    };

    record(
        kinds::EMAIL,
        EMAIL_RE.find_iter(text).map(|m| m.as_str()).collect(),
    );

    // Government ids first so an SSN is not also counted as a phone number
    let government: Vec<&str> = GOVERNMENT_ID_RE.find_iter(text).map(|m| m.as_str()).collect();
    record(kinds::GOVERNMENT_ID, government.clone());

    let phones: Vec<&str> = PHONE_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|candidate| !government.iter().any(|g| candidate.contains(g) || g.contains(candidate)))
        .collect();
    record(kinds::PHONE, phones);

    let cards: Vec<&str> = CARD_CANDIDATE_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|candidate| {
            let digits: Vec<u8> = candidate
                .chars()
                .filter(|c| c.is_ascii_digit())
                .map(|c| c as u8 - b'0')
                .collect();
            luhn_valid(&digits)
        })
        .collect();
    record(kinds::CREDIT_CARD, cards);

    record(
        kinds::IP_ADDRESS,
        IP_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|c| valid_ip(c))
            .collect(),
    );

    scan.risk_score = risk_score(&scan.flags);
    scan
}
