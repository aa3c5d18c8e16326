//! Parsers for `lxc list --format csv` output. Anything that does not look
//! like a well-formed row is skipped.

use std::net::Ipv4Addr;

use crate::models::{ContainerAddress, ContainerListing, RunState};

/// Splits CSV text into records, honouring quoted fields (which may span
/// lines and contain `""` escapes). Blank lines produce no record.
pub fn csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        if !(record.len() == 1 && record[0].trim().is_empty()) {
            records.push(record);
        }
    }
    records
}

/// First IPv4 in an address column such as `10.166.3.85 (eth0)`.
pub fn first_ipv4(field: &str) -> Option<Ipv4Addr> {
    field
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|token| token.trim_matches(|c| c == '(' || c == ')' || c == '"'))
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

/// Names from `-c n`.
pub fn parse_names(stdout: &str) -> Vec<String> {
    csv_records(stdout)
        .into_iter()
        .filter_map(|record| record.into_iter().next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// `(name, address)` pairs from `-c n4`.
pub fn parse_addresses(stdout: &str) -> Vec<(String, Option<ContainerAddress>)> {
    csv_records(stdout)
        .into_iter()
        .filter_map(|record| {
            let name = record.first()?.trim().to_string();
            if name.is_empty() {
                return None;
            }
            let address = record
                .get(1)
                .and_then(|field| first_ipv4(field))
                .map(ContainerAddress::from);
            Some((name, address))
        })
        .collect()
}

/// Rows from `-c ns4` whose name starts with `prefix`.
pub fn parse_listing(stdout: &str, prefix: &str) -> Vec<ContainerListing> {
    csv_records(stdout)
        .into_iter()
        .filter_map(|record| {
            let name = record.first()?.trim().to_string();
            if name.is_empty() || !name.starts_with(prefix) {
                return None;
            }
            let run_state = RunState::from(record.get(1).cloned().unwrap_or_default());
            let address = record
                .get(2)
                .and_then(|field| first_ipv4(field))
                .map(ContainerAddress::from);
            Some(ContainerListing {
                name,
                run_state,
                address,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_NS4: &str = "ginto-sandbox-alice,RUNNING,10.166.3.85 (eth0)\n\
ginto-sandbox-bob,STOPPED,\n\
unrelated,RUNNING,10.166.3.2 (eth0)\n\
ginto-sandbox-multi,RUNNING,\"10.166.3.90 (eth0)\n172.17.0.1 (docker0)\"\n";

    #[test]
    fn listing_filters_prefix_and_parses_addresses() {
        let rows = parse_listing(LIST_NS4, "ginto-sandbox-");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "ginto-sandbox-alice");
        assert_eq!(rows[0].run_state, RunState::Running);
        assert_eq!(
            rows[0].address,
            Some(Ipv4Addr::new(10, 166, 3, 85).into())
        );
        assert_eq!(rows[1].run_state, RunState::Stopped);
        assert_eq!(rows[1].address, None);
        assert_eq!(
            rows[2].address,
            Some(Ipv4Addr::new(10, 166, 3, 90).into())
        );
    }

    #[test]
    fn addresses_tolerate_garbage() {
        let out = "ginto-sandbox-alice,not-an-ip\n,,,\n\n\"unterminated";
        let rows = parse_addresses(out);
        assert_eq!(rows[0], ("ginto-sandbox-alice".to_string(), None));
        assert!(rows.iter().all(|(_, addr)| addr.is_none()));
    }

    #[test]
    fn names_skip_blank_lines() {
        let out = "\nginto-sandbox-a\r\n\r\nginto-sandbox-b\n";
        assert_eq!(parse_names(out), vec!["ginto-sandbox-a", "ginto-sandbox-b"]);
    }

    #[test]
    fn first_ipv4_skips_ipv6_and_interface_names() {
        assert_eq!(
            first_ipv4("fd42::1 (eth0) 10.0.3.5 (eth0)"),
            Some(Ipv4Addr::new(10, 0, 3, 5))
        );
        assert_eq!(first_ipv4(""), None);
        assert_eq!(first_ipv4("(eth0)"), None);
    }

    #[test]
    fn quoted_fields_keep_escaped_quotes() {
        let records = csv_records("a,\"b \"\"c\"\"\",d\n");
        assert_eq!(records, vec![vec!["a", "b \"c\"", "d"]]);
    }
}
