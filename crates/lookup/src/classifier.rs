//! Query classification
//!
//! Turns a raw analyst input into a typed, normalized query. Rules run in a
//! fixed priority order and the first match wins; later matches are kept as
//! `alternatives` so ambiguous inputs can be surfaced.
//!
//! Classification never fails: anything unmatched is `unknown` with the
//! trimmed input as its value.

use intelforge_common::db::models::QueryType;
use serde::Serialize;
use std::net::IpAddr;

/// Outcome of classifying one raw value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub query_type: QueryType,
    pub normalized: String,
    /// Lower-priority types the input also satisfied
    pub alternatives: Vec<QueryType>,
}

impl Classification {
    pub fn is_ambiguous(&self) -> bool {
        !self.alternatives.is_empty()
    }
}

type Rule = fn(&str) -> Option<String>;

/// Priority order. Checksum-validated document ids beat the generic
/// digit-run phone rule; email beats username and domain.
const RULES: &[(QueryType, Rule)] = &[
    (QueryType::Email, normalize_email),
    (QueryType::Ip, normalize_ip),
    (QueryType::DocumentId, normalize_document_id),
    (QueryType::Phone, normalize_phone),
    (QueryType::Domain, normalize_domain),
    (QueryType::Username, normalize_username),
];

/// Classify a raw input. Total and deterministic.
pub fn classify(raw: &str) -> Classification {
    let value = raw.trim();

    let mut matches = RULES
        .iter()
        .filter_map(|(query_type, rule)| rule(value).map(|normalized| (*query_type, normalized)));

    match matches.next() {
        Some((query_type, normalized)) => Classification {
            query_type,
            normalized,
            alternatives: matches.map(|(t, _)| t).collect(),
        },
        None => Classification {
            query_type: QueryType::Unknown,
            normalized: value.to_string(),
            alternatives: Vec::new(),
        },
    }
}

fn digits(value: &str) -> Vec<u32> {
    value.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn digit_string(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn normalize_email(value: &str) -> Option<String> {
    let (local, domain) = value.rsplit_once('@')?;
    if local.is_empty() || local.len() > 64 || local.contains('@') {
        return None;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return None;
    }
    let local_ok = local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    if !local_ok {
        return None;
    }
    let domain = normalize_domain(domain)?;
    Some(format!("{}@{}", local.to_ascii_lowercase(), domain))
}

fn normalize_ip(value: &str) -> Option<String> {
    let value = value.trim_start_matches('[').trim_end_matches(']');
    value.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn normalize_document_id(value: &str) -> Option<String> {
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '/' | ' '));
    if !allowed {
        return None;
    }

    let d = digits(value);
    let valid = match d.len() {
        11 => cpf_is_valid(&d),
        14 => cnpj_is_valid(&d),
        _ => false,
    };
    valid.then(|| digit_string(value))
}

/// Personal taxpayer number: two mod-11 check digits over descending weights
fn cpf_is_valid(d: &[u32]) -> bool {
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }
    let check = |len: usize| {
        let sum: u32 = d[..len]
            .iter()
            .enumerate()
            .map(|(i, &x)| x * (len as u32 + 1 - i as u32))
            .sum();
        (sum * 10) % 11 % 10
    };
    check(9) == d[9] && check(10) == d[10]
}

/// Company taxpayer number: weighted mod-11 with cycling 2..=9 weights
fn cnpj_is_valid(d: &[u32]) -> bool {
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }
    let check = |len: usize| {
        let sum: u32 = d[..len]
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &x)| x * (2 + (i as u32 % 8)))
            .sum();
        match sum % 11 {
            r if r < 2 => 0,
            r => 11 - r,
        }
    };
    check(12) == d[12] && check(13) == d[13]
}

fn normalize_phone(value: &str) -> Option<String> {
    let body = value.strip_prefix('+').unwrap_or(value);
    let allowed = body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.'));
    if !allowed || !body.starts_with(|c: char| c.is_ascii_digit() || c == '(') {
        return None;
    }

    let normalized = digit_string(body);
    (8..=15).contains(&normalized.len()).then_some(normalized)
}

fn normalize_domain(value: &str) -> Option<String> {
    let value = value.strip_suffix('.').unwrap_or(value).to_ascii_lowercase();
    if value.is_empty() || value.len() > 253 {
        return None;
    }

    let labels: Vec<&str> = value.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());

    (labels_ok && tld_ok).then_some(value)
}

fn normalize_username(value: &str) -> Option<String> {
    let handle = value.strip_prefix('@').unwrap_or(value);
    let ok = (3..=32).contains(&handle.len())
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    ok.then(|| handle.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_wins_and_lowercases() {
        let c = classify("  Test@Example.COM ");
        assert_eq!(c.query_type, QueryType::Email);
        assert_eq!(c.normalized, "test@example.com");
        assert!(!c.is_ambiguous());
    }

    #[test]
    fn test_formatted_cpf_is_document_id() {
        let c = classify("123.456.789-09");
        assert_eq!(c.query_type, QueryType::DocumentId);
        assert_eq!(c.normalized, "12345678909");
    }

    #[test]
    fn test_bare_cpf_beats_phone() {
        let c = classify("12345678909");
        assert_eq!(c.query_type, QueryType::DocumentId);
        assert_eq!(c.alternatives, vec![QueryType::Phone, QueryType::Username]);
    }

    #[test]
    fn test_bad_checksum_falls_through_to_phone() {
        let c = classify("123.456.789-00");
        assert_eq!(c.query_type, QueryType::Phone);
        assert_eq!(c.normalized, "12345678900");
    }

    #[test]
    fn test_repeated_digit_cpf_rejected() {
        assert_eq!(classify("111.111.111-11").query_type, QueryType::Phone);
    }

    #[test]
    fn test_cnpj() {
        let c = classify("11.222.333/0001-81");
        assert_eq!(c.query_type, QueryType::DocumentId);
        assert_eq!(c.normalized, "11222333000181");

        assert_ne!(classify("11.222.333/0001-82").query_type, QueryType::DocumentId);
    }

    #[test]
    fn test_phone_strips_formatting() {
        let c = classify("+1 (555) 123-4567");
        assert_eq!(c.query_type, QueryType::Phone);
        assert_eq!(c.normalized, "15551234567");

        assert_eq!(classify("+15551234567").normalized, "15551234567");
        assert_eq!(classify("1234567").query_type, QueryType::Username);
    }

    #[test]
    fn test_ip_v4_and_v6() {
        assert_eq!(classify("8.8.8.8").query_type, QueryType::Ip);

        let c = classify("2001:DB8::0001");
        assert_eq!(c.query_type, QueryType::Ip);
        assert_eq!(c.normalized, "2001:db8::1");
    }

    #[test]
    fn test_domain() {
        let c = classify("Sub.Example.co.uk.");
        assert_eq!(c.query_type, QueryType::Domain);
        assert_eq!(c.normalized, "sub.example.co.uk");
        assert_eq!(classify("-bad.com").query_type, QueryType::Unknown);
    }

    #[test]
    fn test_username() {
        let c = classify("@john_doe");
        assert_eq!(c.query_type, QueryType::Username);
        assert_eq!(c.normalized, "john_doe");
        assert_eq!(classify("ab").query_type, QueryType::Unknown);
    }

    #[test]
    fn test_unknown_keeps_trimmed_value() {
        let c = classify("  what is this?  ");
        assert_eq!(c.query_type, QueryType::Unknown);
        assert_eq!(c.normalized, "what is this?");

        assert_eq!(classify("").query_type, QueryType::Unknown);
    }

    #[test]
    fn test_deterministic() {
        for input in ["a@b.io", "8.8.4.4", "12345678909", "example.org", "???"] {
            assert_eq!(classify(input), classify(input));
        }
    }
}
