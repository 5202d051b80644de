//! Best-effort summaries of tool report files.
//!
//! Tools write long text reports; after a report is produced we pick out the few lines a person
//! actually wants to see. A report that lacks the expected markers is not an error: the summary
//! just says so.

use camino::Utf8Path;
use regex::Regex;
use tracing::warn;

/// Something that can pull a summary out of the text of a report.
pub trait Summarize {
    /// A heading for the summary.
    fn title(&self) -> &str;

    /// The interesting lines of `report`, or `None` if the markers are absent.
    fn summarize(&self, report: &str) -> Option<Vec<String>>;
}

/// Pick out every line that contains a fixed marker, like `Total path delay:`.
pub struct MarkerLines {
    pub title: String,
    pub marker: String,
}

impl MarkerLines {
    pub fn new(title: &str, marker: &str) -> Self {
        Self {
            title: title.to_string(),
            marker: marker.to_string(),
        }
    }
}

impl Summarize for MarkerLines {
    fn title(&self) -> &str {
        &self.title
    }

    fn summarize(&self, report: &str) -> Option<Vec<String>> {
        let lines: Vec<String> = report
            .lines()
            .filter(|line| line.contains(&self.marker))
            .map(|line| line.trim().to_string())
            .collect();
        (!lines.is_empty()).then_some(lines)
    }
}

/// Collect cell counts for cells whose names match a pattern.
///
/// Both the `NAME COUNT` and `COUNT NAME` column orders are recognized, since synthesis tools have
/// printed their statistics both ways.
pub struct CellCounts {
    pub title: String,
    pub pattern: Regex,
}

impl CellCounts {
    pub fn new(title: &str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            title: title.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }

    /// Find the counts. When a cell appears more than once (per-module statistics followed by
    /// hierarchy totals), the last count wins.
    pub fn counts(&self, report: &str) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = vec![];
        for line in report.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            let (name, count) = match words.as_slice() {
                [name, count] if count.parse::<u64>().is_ok() => (*name, *count),
                [count, name] if count.parse::<u64>().is_ok() => (*name, *count),
                _ => continue,
            };
            if !self.pattern.is_match(name) {
                continue;
            }
            let Ok(count) = count.parse() else { continue };
            match counts.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = count,
                None => counts.push((name.to_string(), count)),
            }
        }
        counts
    }
}

impl Summarize for CellCounts {
    fn title(&self) -> &str {
        &self.title
    }

    fn summarize(&self, report: &str) -> Option<Vec<String>> {
        let counts = self.counts(report);
        if counts.is_empty() {
            return None;
        }
        let width = counts.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        Some(
            counts
                .into_iter()
                .map(|(name, count)| format!("{:width$}  {}", name, count, width = width))
                .collect(),
        )
    }
}

/// Summarize the report at `path`, falling back to a placeholder line if the file is unreadable
/// or has no markers.
pub fn summarize_file(summary: &dyn Summarize, path: &Utf8Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => summary
            .summarize(&text)
            .unwrap_or_else(|| vec![format!("(no summary available in {})", path)]),
        Err(err) => {
            warn!("could not read report {}: {}", path, err);
            vec![format!("(report {} could not be read)", path)]
        }
    }
}

/// Print a summary to stdout.
pub fn print_summary(summary: &dyn Summarize, path: &Utf8Path) {
    println!("{}:", summary.title());
    for line in summarize_file(summary, path) {
        println!("  {}", line);
    }
}
