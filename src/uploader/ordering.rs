// Ordering of newly enqueued files
//
// Folder uploads of magazine pages arrive in arbitrary filesystem order;
// the page number embedded in the file name restores reading order.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

use super::file_handle::FileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingHint {
    #[default]
    InsertionOrder,
    PageNumber,
}

fn page_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)page_(\d+)\.").expect("static regex"))
}

/// Page number from names like `page_12.png`.
pub fn extract_page_number(file_name: &str) -> Option<u64> {
    page_pattern()
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn compare_by_page(a: &str, b: &str) -> Ordering {
    match (extract_page_number(a), extract_page_number(b)) {
        (Some(pa), Some(pb)) => pa.cmp(&pb).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Numbered pages first in ascending order, then everything else by name.
pub fn sort_by_page_number(files: &mut [FileHandle]) {
    files.sort_by(|a, b| compare_by_page(a.name(), b.name()));
}

pub fn apply_ordering(mut files: Vec<FileHandle>, hint: OrderingHint) -> Vec<FileHandle> {
    if hint == OrderingHint::PageNumber {
        sort_by_page_number(&mut files);
    }
    files
}
