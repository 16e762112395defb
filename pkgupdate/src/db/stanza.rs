// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Key-value stanza format shared by the status database, package
//! control files and repository indices: `Field: value` lines,
//! continuation lines starting with a space, records separated by a
//! blank line.

use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

pub fn parse(content: &str) -> Result<Vec<Stanza>, Error> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::default();

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let (_, value) = current
                .fields
                .last_mut()
                .ok_or(Error::DanglingContinuation { line: index + 1 })?;
            value.push('\n');
            value.push_str(line.trim());
            continue;
        }

        let (field, value) = line
            .split_once(':')
            .ok_or(Error::MissingSeparator { line: index + 1 })?;
        current
            .fields
            .push((field.to_string(), value.trim().to_string()));
    }

    if !current.is_empty() {
        stanzas.push(current);
    }

    Ok(stanzas)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("line {line}: expected `Field: value`")]
    MissingSeparator { line: usize },
    #[error("line {line}: continuation line with no preceding field")]
    DanglingContinuation { line: usize },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_records_and_continuations() {
        let stanzas = parse(
            "Package: one\nConffiles:\n /etc/one.conf abcd\n /etc/two.conf ef01\n\nPackage: two\nVersion: 2\n",
        )
        .unwrap();

        assert_eq!(stanzas.len(), 2);
        assert_eq!(stanzas[0].get("Package"), Some("one"));
        assert_eq!(
            stanzas[0].get("Conffiles"),
            Some("\n/etc/one.conf abcd\n/etc/two.conf ef01")
        );
        assert_eq!(stanzas[1].get("Version"), Some("2"));
        assert_eq!(stanzas[1].get("Conffiles"), None);
    }

    #[test]
    fn rejects_unseparated_lines() {
        assert!(matches!(
            parse("garbage without separator\n"),
            Err(Error::MissingSeparator { line: 1 })
        ));
    }

    #[test]
    fn trailing_record_without_blank_line() {
        let stanzas = parse("Package: tail").unwrap();
        assert_eq!(stanzas.len(), 1);
    }
}
