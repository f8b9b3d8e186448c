//! Sorted IP-range containers backing the bypass-country routing decision.
//!
//! The dataset is two line-oriented files (`startIP endIP` per line, `#`
//! comments). Ranges are assumed non-overlapping; lookups binary-search the
//! table sorted by range start.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range<T> {
    start: T,
    end: T,
}

/// Process-wide membership table for the configured country's address space.
///
/// Readers never block each other; a reload replaces the whole table under
/// the write lock.
pub struct RangeTable {
    v4: RwLock<Vec<Range<u32>>>,
    v6: RwLock<Vec<Range<u128>>>,
}

impl RangeTable {
    pub fn new() -> Self {
        Self {
            v4: RwLock::new(Vec::new()),
            v6: RwLock::new(Vec::new()),
        }
    }

    /// Replace the IPv4 table from file contents. Returns the number of
    /// ranges loaded; malformed lines and inverted ranges are skipped.
    pub fn load_v4(&self, data: &str) -> usize {
        let ranges = parse_ranges(data, |s| s.parse::<Ipv4Addr>().ok().map(u32::from));
        let count = ranges.len();
        *self.v4.write().expect("range table lock poisoned") = ranges;
        count
    }

    /// Replace the IPv6 table from file contents.
    pub fn load_v6(&self, data: &str) -> usize {
        let ranges = parse_ranges(data, |s| s.parse::<Ipv6Addr>().ok().map(u128::from));
        let count = ranges.len();
        *self.v6.write().expect("range table lock poisoned") = ranges;
        count
    }

    /// Whether `ip` falls inside any loaded range. IPv4-mapped IPv6
    /// addresses are tested against the IPv4 table.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.contains_v4(v4),
                None => lookup(&self.v6.read().expect("range table lock poisoned"), v6.into()),
            },
        }
    }

    fn contains_v4(&self, ip: Ipv4Addr) -> bool {
        lookup(&self.v4.read().expect("range table lock poisoned"), ip.into())
    }

    pub fn len(&self) -> (usize, usize) {
        (
            self.v4.read().expect("range table lock poisoned").len(),
            self.v6.read().expect("range table lock poisoned").len(),
        )
    }
}

fn parse_ranges<T, F>(data: &str, parse_ip: F) -> Vec<Range<T>>
where
    T: Copy + Ord,
    F: Fn(&str) -> Option<T>,
{
    let mut ranges: Vec<Range<T>> = data
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let start = parse_ip(fields.next()?)?;
            let end = parse_ip(fields.next()?)?;
            (start <= end).then_some(Range { start, end })
        })
        .collect();
    ranges.sort_by_key(|r| r.start);
    ranges
}

fn lookup<T: Copy + Ord>(ranges: &[Range<T>], ip: T) -> bool {
    let idx = ranges.partition_point(|r| r.start <= ip);
    idx > 0 && ip <= ranges[idx - 1].end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_v4(data: &str) -> RangeTable {
        let table = RangeTable::new();
        table.load_v4(data);
        table
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn loads_and_sorts_unordered_input() {
        let table = table_v4("10.0.0.0 10.0.0.255\n1.0.1.0 1.0.1.255\n");
        assert_eq!(table.len().0, 2);
        assert!(table.contains(ip("1.0.1.10")));
        assert!(table.contains(ip("10.0.0.1")));
        assert!(!table.contains(ip("8.8.8.8")));
    }

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let data = "# header\n\n1.0.1.0 1.0.1.255\nnot-an-ip 1.2.3.4\n1.2.3.4\n";
        let table = table_v4(data);
        assert_eq!(table.len().0, 1);
        assert!(table.contains(ip("1.0.1.255")));
    }

    #[test]
    fn drops_inverted_ranges() {
        let table = table_v4("1.0.1.255 1.0.1.0\n");
        assert_eq!(table.len().0, 0);
        assert!(!table.contains(ip("1.0.1.10")));
    }

    #[test]
    fn single_address_range_matches_exactly() {
        let table = table_v4("192.0.2.7 192.0.2.7\n");
        assert!(table.contains(ip("192.0.2.7")));
        assert!(!table.contains(ip("192.0.2.6")));
        assert!(!table.contains(ip("192.0.2.8")));
    }

    #[test]
    fn range_boundaries_are_inclusive() {
        let table = table_v4("1.0.1.0 1.0.1.255\n");
        assert!(table.contains(ip("1.0.1.0")));
        assert!(table.contains(ip("1.0.1.255")));
        assert!(!table.contains(ip("1.0.0.255")));
        assert!(!table.contains(ip("1.0.2.0")));
    }

    #[test]
    fn adding_a_covering_range_never_loses_a_hit() {
        let narrow = table_v4("1.0.1.0 1.0.1.255\n");
        let wide = table_v4("1.0.1.0 1.0.1.255\n1.0.0.0 1.0.255.255\n");
        for probe in ["1.0.1.0", "1.0.1.128", "1.0.1.255"] {
            assert!(narrow.contains(ip(probe)));
            assert!(wide.contains(ip(probe)));
        }
    }

    #[test]
    fn ipv6_ranges() {
        let table = RangeTable::new();
        table.load_v6("2001:db8:: 2001:db8::ffff\n");
        assert!(table.contains(ip("2001:db8::1")));
        assert!(table.contains(ip("2001:db8::ffff")));
        assert!(!table.contains(ip("2001:db8::1:0")));
        assert!(!table.contains(ip("2001:db7::1")));
    }

    #[test]
    fn ipv4_mapped_ipv6_uses_the_v4_table() {
        let table = table_v4("1.0.1.0 1.0.1.255\n");
        assert!(table.contains(ip("::ffff:1.0.1.10")));
    }

    #[test]
    fn empty_table_matches_nothing() {
        let table = RangeTable::new();
        assert!(!table.contains(ip("1.0.1.10")));
        assert!(!table.contains(ip("2001:db8::1")));
    }

    #[test]
    fn reload_replaces_the_table() {
        let table = table_v4("1.0.1.0 1.0.1.255\n");
        table.load_v4("8.8.8.0 8.8.8.255\n");
        assert!(!table.contains(ip("1.0.1.10")));
        assert!(table.contains(ip("8.8.8.8")));
    }
}
