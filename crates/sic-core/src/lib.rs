//! Core domain model and section classification for UK SIC 2007 codes.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sic-core";

/// Section id and title used when a code cannot be placed in any section.
pub const UNCLASSIFIED: &str = "Unclassified";

/// Column order of the intermediate CSV file.
pub const CSV_HEADER: [&str; 4] = ["sic_code", "description", "section", "section_title"];

/// Inclusive code interval owned by one top-level section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRange {
    pub id: &'static str,
    pub min_code: u64,
    pub max_code: u64,
    pub title: &'static str,
}

impl SectionRange {
    const fn new(id: &'static str, min_code: u64, max_code: u64, title: &'static str) -> Self {
        Self {
            id,
            min_code,
            max_code,
            title,
        }
    }

    pub fn contains(&self, code: u64) -> bool {
        self.min_code <= code && code <= self.max_code
    }
}

/// UK SIC 2007 sections in declaration order. Classification is first match
/// wins, so the order here is load-bearing. Boundaries are kept exactly as
/// published, including the gaps between some sections.
pub const SECTION_RANGES: [SectionRange; 21] = [
    SectionRange::new("Section A", 1110, 3220, "Agriculture, Forestry and Fishing"),
    SectionRange::new("Section B", 5101, 9900, "Mining and Quarrying"),
    SectionRange::new("Section C", 10110, 33200, "Manufacturing"),
    SectionRange::new(
        "Section D",
        35110,
        35300,
        "Electricity, Gas, Steam and Air Conditioning Supply",
    ),
    SectionRange::new(
        "Section E",
        36000,
        39000,
        "Water Supply, Sewerage, Waste Management and Remediation Activities",
    ),
    SectionRange::new("Section F", 41100, 43999, "Construction"),
    SectionRange::new(
        "Section G",
        45111,
        47990,
        "Wholesale and Retail Trade; Repair of Motor Vehicles and Motorcycles",
    ),
    SectionRange::new("Section H", 49100, 53202, "Transportation and Storage"),
    SectionRange::new("Section I", 55100, 56302, "Accommodation and Food Service Activities"),
    SectionRange::new("Section J", 58110, 63990, "Information and Communication"),
    SectionRange::new("Section K", 64110, 66300, "Financial and Insurance Activities"),
    SectionRange::new("Section L", 68100, 68320, "Real Estate Activities"),
    SectionRange::new(
        "Section M",
        69101,
        75000,
        "Professional, Scientific and Technical Activities",
    ),
    SectionRange::new(
        "Section N",
        77110,
        82990,
        "Administrative and Support Service Activities",
    ),
    SectionRange::new(
        "Section O",
        84110,
        84300,
        "Public Administration and Defence; Compulsory Social Security",
    ),
    SectionRange::new("Section P", 85100, 85600, "Education"),
    SectionRange::new("Section Q", 86101, 88990, "Human Health and Social Work Activities"),
    SectionRange::new("Section R", 90010, 93290, "Arts, Entertainment and Recreation"),
    SectionRange::new("Section S", 94110, 96090, "Other Service Activities"),
    SectionRange::new("Section T", 97000, 98200, "Activities of Households as Employers"),
    SectionRange::new(
        "Section U",
        99000,
        99999,
        "Activities of Extraterritorial Organisations and Bodies",
    ),
];

/// Resolved section for a single code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub id: &'static str,
    pub title: &'static str,
}

impl Section {
    pub const UNCLASSIFIED: Section = Section {
        id: UNCLASSIFIED,
        title: UNCLASSIFIED,
    };

    pub fn is_unclassified(&self) -> bool {
        self.id == UNCLASSIFIED
    }
}

impl From<&SectionRange> for Section {
    fn from(range: &SectionRange) -> Self {
        Self {
            id: range.id,
            title: range.title,
        }
    }
}

/// Parse a code as a plain run of ASCII digits. Signs, separators and
/// whitespace all make the code unparseable.
pub fn parse_code(code: &str) -> Option<u64> {
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

/// Place a code in its section. Never fails: anything unparseable or outside
/// every declared range resolves to [`Section::UNCLASSIFIED`].
pub fn classify(code: &str) -> Section {
    parse_code(code)
        .and_then(|n| SECTION_RANGES.iter().find(|range| range.contains(n)))
        .map(Section::from)
        .unwrap_or(Section::UNCLASSIFIED)
}

/// One row of the intermediate CSV and one row of the remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    #[serde(rename = "sic_code")]
    pub code: String,
    pub description: String,
    pub section: String,
    pub section_title: String,
}

impl ClassificationRecord {
    /// Build a record from a source row, resolving its section.
    pub fn classified(code: impl Into<String>, description: impl Into<String>) -> Self {
        let code = code.into();
        let section = classify(&code);
        Self {
            code,
            description: description.into(),
            section: section.id.to_string(),
            section_title: section.title.to_string(),
        }
    }
}

/// Per-section record counts, kept in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SectionTally {
    entries: Vec<(String, usize)>,
}

impl SectionTally {
    pub fn record(&mut self, section: &str) {
        match self.entries.iter_mut().find(|(id, _)| id == section) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((section.to_string(), 1)),
        }
    }

    pub fn count(&self, section: &str) -> usize {
        self.entries
            .iter()
            .find(|(id, _)| id == section)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, count)| count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(id, count)| (id.as_str(), *count))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> FromIterator<&'a ClassificationRecord> for SectionTally {
    fn from_iter<I: IntoIterator<Item = &'a ClassificationRecord>>(iter: I) -> Self {
        let mut tally = SectionTally::default();
        for record in iter {
            tally.record(&record.section);
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_examples_classify() {
        let a = classify("1110");
        assert_eq!(a.id, "Section A");
        assert_eq!(a.title, "Agriculture, Forestry and Fishing");
        assert_eq!(classify("99999").id, "Section U");
        assert_eq!(classify("ABC"), Section::UNCLASSIFIED);
    }

    #[test]
    fn every_range_is_inclusive_at_both_bounds() {
        for range in &SECTION_RANGES {
            for code in [range.min_code, range.max_code, (range.min_code + range.max_code) / 2] {
                let section = classify(&code.to_string());
                assert_eq!(section.id, range.id, "code {code}");
                assert_eq!(section.title, range.title, "code {code}");
            }
        }
    }

    #[test]
    fn codes_in_gaps_and_outside_all_ranges_are_unclassified() {
        for code in ["0", "1109", "3221", "4000", "5100", "9901", "34000", "35301", "40000", "84301", "98201", "98999", "100000"] {
            assert!(classify(code).is_unclassified(), "code {code}");
        }
    }

    #[test]
    fn malformed_codes_are_unclassified() {
        for code in ["", " ", "01110 ", " 1110", "+1110", "-5", "1,110", "11.10", "1110a", "٣٣٣", "99999999999999999999999999"] {
            assert_eq!(classify(code), Section::UNCLASSIFIED, "code {code:?}");
        }
    }

    #[test]
    fn leading_zeros_are_plain_digits() {
        assert_eq!(parse_code("01110"), Some(1110));
        assert_eq!(classify("01110").id, "Section A");
        assert_eq!(classify("05101").id, "Section B");
    }

    #[test]
    fn declaration_order_is_preserved() {
        let ids: Vec<_> = SECTION_RANGES.iter().map(|r| r.id).collect();
        let expected: Vec<_> = ('A'..='U').map(|c| format!("Section {c}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn classified_record_carries_section_title() {
        let record = ClassificationRecord::classified("62012", "Business and domestic software development");
        assert_eq!(record.section, "Section J");
        assert_eq!(record.section_title, "Information and Communication");

        let odd = ClassificationRecord::classified("None", "Dormant Company");
        assert_eq!(odd.section, UNCLASSIFIED);
        assert_eq!(odd.section_title, UNCLASSIFIED);
    }

    #[test]
    fn tally_keeps_first_seen_order() {
        let records = [
            ClassificationRecord::classified("62012", "a"),
            ClassificationRecord::classified("01110", "b"),
            ClassificationRecord::classified("62020", "c"),
            ClassificationRecord::classified("x", "d"),
        ];
        let tally: SectionTally = records.iter().collect();
        let order: Vec<_> = tally.iter().collect();
        assert_eq!(
            order,
            vec![("Section J", 2), ("Section A", 1), (UNCLASSIFIED, 1)]
        );
        assert_eq!(tally.total(), 4);
        assert_eq!(tally.count("Section Z"), 0);
    }
}
