//! Counting of kernel cpu-list strings.
//!
//! Files like `cpuset.effective_cpus` describe cpu sets as a
//! comma-separated list of single indices and `a-b` ranges, e.g.
//! `"0-2,5"`. Only the number of cpus matters here, not their identity.

/// Counts the cpus in a kernel cpu-list string.
///
/// Returns `Some(0)` for an empty list and `None` when any element fails
/// to parse or a range is inverted; callers treat `None` as "no usable
/// value" and log it.
pub fn count_cpu_list(list: &str) -> Option<u32> {
    let list = list.trim();
    if list.is_empty() {
        return Some(0);
    }

    let mut count: u32 = 0;
    for part in list.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().ok()?;
                let end: u32 = end.trim().parse().ok()?;
                if end < start {
                    return None;
                }
                count += end - start + 1;
            }
            None => {
                part.parse::<u32>().ok()?;
                count += 1;
            }
        }
    }

    Some(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_single_and_range() {
        assert_eq!(count_cpu_list("0"), Some(1));
        assert_eq!(count_cpu_list("0-2"), Some(3));
        assert_eq!(count_cpu_list("0-2,5"), Some(4));
        assert_eq!(count_cpu_list("0,2,4-7,9"), Some(7));
    }

    #[test]
    fn test_count_empty_list_is_zero() {
        assert_eq!(count_cpu_list(""), Some(0));
        assert_eq!(count_cpu_list("  \n"), Some(0));
    }

    #[test]
    fn test_count_tolerates_whitespace() {
        assert_eq!(count_cpu_list("0-2,5\n"), Some(4));
        assert_eq!(count_cpu_list(" 0 , 2 "), Some(2));
    }

    #[test]
    fn test_malformed_lists_are_rejected() {
        assert_eq!(count_cpu_list("a"), None);
        assert_eq!(count_cpu_list("0-"), None);
        assert_eq!(count_cpu_list("-2"), None);
        assert_eq!(count_cpu_list("3-1"), None);
        assert_eq!(count_cpu_list("0,,2"), None);
    }
}
