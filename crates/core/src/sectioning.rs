use crate::error::IngestError;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SectioningOptions {
    /// Lines matching this pattern open a new section.
    pub heading_regex: String,
    /// Longer lines are never headings.
    pub max_heading_chars: usize,
    /// Treat short all-caps lines as headings.
    pub uppercase_headings: bool,
}

impl Default for SectioningOptions {
    fn default() -> Self {
        Self {
            heading_regex: r"^\s*\d+(?:\.\d+)*\.?(?:\([a-zA-Z0-9]+\))?\s+[A-Z][^.!?]*$".to_string(),
            max_heading_chars: 80,
            uppercase_headings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub index: u32,
    pub title: String,
    pub text: String,
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Sectioner {
    heading: Regex,
    options: SectioningOptions,
}

impl Sectioner {
    pub fn new(options: SectioningOptions) -> Result<Self, IngestError> {
        Ok(Self {
            heading: Regex::new(&options.heading_regex)?,
            options,
        })
    }

    /// Splits one page into titled sections. Content before the first
    /// heading lands in a `Page N Introduction` section; sections with no
    /// body text are dropped.
    pub fn split_page(&self, page_number: u32, page_text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut title = format!("Page {page_number} Introduction");
        let mut body: Vec<&str> = Vec::new();

        for line in page_text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if self.is_heading(line) {
                if !body.is_empty() {
                    push_section(&mut sections, &title, &body);
                    body.clear();
                }
                title = normalize_whitespace(line);
            } else {
                body.push(line);
            }
        }

        if !body.is_empty() {
            push_section(&mut sections, &title, &body);
        }

        sections
    }

    fn is_heading(&self, line: &str) -> bool {
        if line.chars().count() > self.options.max_heading_chars {
            return false;
        }
        if self.heading.is_match(line) {
            return true;
        }
        self.options.uppercase_headings && is_uppercase_heading(line)
    }
}

fn push_section(sections: &mut Vec<Section>, title: &str, body: &[&str]) {
    let text = normalize_whitespace(&body.join(" "));
    if text.is_empty() {
        return;
    }
    sections.push(Section {
        index: sections.len() as u32,
        title: title.to_string(),
        text,
    });
}

fn is_uppercase_heading(line: &str) -> bool {
    let letters = line.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 3
        && line
            .chars()
            .filter(|c| c.is_alphabetic())
            .all(|c| c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sectioner() -> Sectioner {
        Sectioner::new(SectioningOptions::default()).expect("default regex compiles")
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof \u{a0}  spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn leading_text_gets_an_introduction_section() {
        let page = "Preface text here.\n2.1 Hydraulic Pressure\nKeep pressure below 200 bar.\nCheck seals weekly.";
        let sections = sectioner().split_page(4, page);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Page 4 Introduction");
        assert_eq!(sections[0].text, "Preface text here.");
        assert_eq!(sections[1].index, 1);
        assert_eq!(sections[1].title, "2.1 Hydraulic Pressure");
        assert_eq!(
            sections[1].text,
            "Keep pressure below 200 bar. Check seals weekly."
        );
    }

    #[test]
    fn consecutive_headings_collapse_into_the_last_title() {
        let page = "SAFETY\n3 Warnings\nNever open the valve under load.";
        let sections = sectioner().split_page(1, page);

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "3 Warnings");
    }

    #[test]
    fn sentences_starting_with_numbers_are_not_headings() {
        let page = "3 technicians inspected the pump.\nAll passed.";
        let sections = sectioner().split_page(2, page);

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Page 2 Introduction");
        assert!(sections[0].text.starts_with("3 technicians"));
    }

    #[test]
    fn invalid_heading_pattern_is_rejected() {
        let options = SectioningOptions {
            heading_regex: "(".to_string(),
            ..SectioningOptions::default()
        };
        assert!(matches!(
            Sectioner::new(options),
            Err(IngestError::RegexError(_))
        ));
    }
}
