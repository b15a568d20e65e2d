// Copyright (c) Facebook, Inc. and its affiliates.
//
// Section/key-value grammar shared by the workload and resource group
// configuration files:
//
//   # comment
//   ; comment
//   [section]
//   key = value   # trailing comment
//
use log::{debug, warn};

const COMMENT_MARKERS: &[char] = &['#', ';'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniEntry {
    pub line: usize,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub line: usize,
    pub name: String,
    pub entries: Vec<IniEntry>,
}

pub fn strip_inline_comment(value: &str) -> &str {
    match value.find(COMMENT_MARKERS) {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    }
}

/// Split `text` into sections in source order. Entries outside any section
/// and lines which are neither headers nor `key=value` pairs are dropped.
pub fn parse_sections(text: &str) -> Vec<IniSection> {
    let mut sections = Vec::<IniSection>::new();
    let mut cur: Option<IniSection> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_nr = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with(COMMENT_MARKERS) {
            continue;
        }

        if line.starts_with('[') {
            let name = match line.find(']') {
                Some(end) => line[1..end].trim(),
                None => {
                    warn!("config: line {}: unterminated section header {:?}", line_nr, line);
                    continue;
                }
            };
            if let Some(sect) = cur.take() {
                sections.push(sect);
            }
            if name.is_empty() {
                warn!("config: line {}: empty section name, skipping section", line_nr);
                continue;
            }
            cur = Some(IniSection {
                line: line_nr,
                name: name.to_string(),
                entries: vec![],
            });
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), strip_inline_comment(v)),
            None => {
                debug!("config: line {}: ignoring {:?}", line_nr, line);
                continue;
            }
        };

        match cur.as_mut() {
            Some(sect) => sect.entries.push(IniEntry {
                line: line_nr,
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => debug!(
                "config: line {}: {:?} outside of any section, ignoring",
                line_nr, key
            ),
        }
    }

    if let Some(sect) = cur.take() {
        sections.push(sect);
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections() {
        let text = "\
# leading comment
orphan=1
[first]
  a = 1
b=two words   # trailing
; another comment
garbage line
[ second ]
c=3;4
[]
d=lost
[third
";
        let sects = parse_sections(text);
        assert_eq!(sects.len(), 2);

        assert_eq!(sects[0].name, "first");
        assert_eq!(sects[0].line, 3);
        let kvs: Vec<(&str, &str)> = sects[0]
            .entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str()))
            .collect();
        assert_eq!(kvs, vec![("a", "1"), ("b", "two words")]);

        assert_eq!(sects[1].name, "second");
        assert_eq!(sects[1].entries.len(), 1);
        assert_eq!(sects[1].entries[0].value, "3");
        assert_eq!(sects[1].entries[0].line, 9);
    }

    #[test]
    fn test_strip_inline_comment() {
        assert_eq!(strip_inline_comment(" 4k # block"), "4k");
        assert_eq!(strip_inline_comment("randread;x"), "randread");
        assert_eq!(strip_inline_comment("  plain  "), "plain");
        assert_eq!(strip_inline_comment("# all comment"), "");
    }
}
