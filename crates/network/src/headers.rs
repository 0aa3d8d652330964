//! Ordered header lists and the `key=value;key=value` spec format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key1=value1;key2=value2`.
    ///
    /// Each segment is split on its first `=`, so values may contain `=`.
    /// Empty segments are skipped; whitespace is kept verbatim.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut list = Self::new();
        for segment in spec.split(';') {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                TunnelError::HeaderSpec(format!("segment {:?} has no '='", segment))
            })?;
            list.try_push(key, value)?;
        }
        Ok(list)
    }

    /// Appends a pair, rejecting names and values that cannot go on the wire.
    pub fn try_push(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return Err(TunnelError::HeaderSpec("empty header name".to_string()));
        }
        if has_line_break(&key) || has_line_break(&value) {
            return Err(TunnelError::HeaderSpec(format!(
                "header {:?} contains a line break",
                key
            )));
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn to_spec(&self) -> String {
        self.to_string()
    }
}

pub(crate) fn has_line_break(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

impl FromStr for HeaderList {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for HeaderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
