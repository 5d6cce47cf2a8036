//! HTTP/1.1 header fields of an `Upgrade: h2c` request head
//!
//! Names are folded to lowercase on entry, which is the form HTTP/2
//! requires anyway, so lookups compare bytes directly.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Header fields in arrival order; repeated names are kept
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// Append a field, failing once the request carries more than
    /// `MAX_HEADERS` of them
    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        if self.fields.len() >= MAX_HEADERS {
            return Err(Error::InvalidHeader(format!(
                "more than {} header fields",
                MAX_HEADERS
            )));
        }
        self.fields
            .push((name.to_ascii_lowercase(), value.to_string()));
        Ok(())
    }

    fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, name: &str) -> usize {
        self.values(name).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether some value of `name` lists `token` among its comma-separated
    /// elements, as in `Connection: Upgrade, HTTP2-Settings`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name)
            .flat_map(|v| v.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields with lowercase names, in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split a `name: value` line, trimming optional whitespace
    pub fn parse_line(line: &str) -> Result<(&str, &str)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("no colon in {:?}", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::InvalidHeader(format!("bad field name in {:?}", line)));
        }
        Ok((name, value.trim()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}
