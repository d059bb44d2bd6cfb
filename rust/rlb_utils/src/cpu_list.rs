// SPDX-License-Identifier: GPL-2.0
use crate::NR_CPU_IDS;
use std::collections::HashSet;

/// Upper bound on the number of entries a single list may expand to.
pub const MAX_CPU_LIST: usize = 4096;

/// Parse a CPU list such as `0-3,8,10-11`.
///
/// Order of first appearance is preserved and duplicates are dropped, so the
/// result can double as an ordered slot-to-core mapping. The keyword `all`
/// expands to every possible CPU id on this host.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    if optarg.trim() == "all" {
        return Ok((0..*NR_CPU_IDS).collect());
    }

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in CPU list".to_string());
    }

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str.trim().parse::<usize>().map_err(|_| "Invalid range start")?;
            let end = end_str.trim().parse::<usize>().map_err(|_| "Invalid range end")?;
            if start > end {
                return Err(format!("Invalid CPU range: {}-{}", start, end));
            }
            for i in start..=end {
                if cpus.len() >= MAX_CPU_LIST {
                    return Err(format!("Too many CPUs specified (max {})", MAX_CPU_LIST));
                }
                if seen.insert(i) {
                    cpus.push(i);
                }
            }
        } else {
            let cpu = token.parse::<usize>().map_err(|_| format!("Invalid CPU: {}", token))?;
            if cpus.len() >= MAX_CPU_LIST {
                return Err(format!("Too many CPUs specified (max {})", MAX_CPU_LIST));
            }
            if seen.insert(cpu) {
                cpus.push(cpu);
            }
        }
    }

    if cpus.is_empty() {
        return Err("Empty CPU list".to_string());
    }

    Ok(cpus)
}

/// Parse the kernel's `/sys/devices/system/cpu/{possible,online}` format.
pub(crate) fn parse_sysfs_range(content: &str) -> Option<usize> {
    content
        .trim()
        .split(',')
        .filter_map(|tok| {
            let tok = tok.trim();
            match tok.split_once('-') {
                Some((_, end)) => end.parse::<usize>().ok(),
                None => tok.parse::<usize>().ok(),
            }
        })
        .max()
        .map(|max| max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cpu() {
        let v = parse_cpu_list("3").unwrap();
        assert_eq!(v, vec![3]);
    }

    #[test]
    fn parses_range_and_single() {
        let v = parse_cpu_list("0-2,5").unwrap();
        assert_eq!(v, vec![0, 1, 2, 5]);
    }

    #[test]
    fn keeps_first_seen_order() {
        let v = parse_cpu_list("6,4,2,0,4").unwrap();
        assert_eq!(v, vec![6, 4, 2, 0]);
    }

    #[test]
    fn rejects_bad_chars() {
        assert!(parse_cpu_list("0-2,a").is_err());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list(" , ").is_err());
    }

    #[test]
    fn sysfs_range() {
        assert_eq!(parse_sysfs_range("0-7\n"), Some(8));
        assert_eq!(parse_sysfs_range("0,2-3"), Some(4));
        assert_eq!(parse_sysfs_range(""), None);
    }
}
