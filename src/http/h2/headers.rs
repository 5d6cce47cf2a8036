//! HTTP/2 header lists
//!
//! A header list is an ordered sequence of (name, value) byte strings.
//! Order matters for pseudo-headers, and repeated regular names are kept
//! as separate fields.

use super::error::{Error, Result};

/// Pseudo-headers a client may send (RFC 7540 Section 8.1.2.3)
const REQUEST_PSEUDO_HEADERS: &[&[u8]] = &[b":method", b":scheme", b":authority", b":path"];

/// Connection-specific fields that must not appear in HTTP/2 (RFC 7540 Section 8.1.2.2)
const CONNECTION_SPECIFIC_HEADERS: &[&[u8]] = &[
    b"connection",
    b"keep-alive",
    b"proxy-connection",
    b"transfer-encoding",
    b"upgrade",
];

/// Ordered list of header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(Vec<u8>, Vec<u8>)>,
}

impl HeaderList {
    /// Create an empty header list
    pub fn new() -> Self {
        HeaderList::default()
    }

    /// Build from decoded pairs, keeping their order
    pub fn from_pairs(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        HeaderList { fields }
    }

    /// Append a field
    pub fn push(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.fields
            .push((name.as_ref().to_vec(), value.as_ref().to_vec()));
    }

    /// Builder-style append
    pub fn with(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.push(name, value);
        self
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the list has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.iter()
            .find(|(n, _)| *n == name.as_bytes())
            .map(|(_, v)| v)
    }

    /// First value for `name` as UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All values for `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.iter()
            .filter(move |(n, _)| *n == name.as_bytes())
            .map(|(_, v)| v)
    }

    /// Fields that are not pseudo-headers
    pub fn regular(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.iter().filter(|(n, _)| !n.starts_with(b":"))
    }

    /// Borrowed pairs, as the HPACK encoder takes them
    pub fn as_pairs(&self) -> Vec<(&[u8], &[u8])> {
        self.iter().collect()
    }

    /// Total size as counted for SETTINGS_MAX_HEADER_LIST_SIZE
    /// (name + value + 32 per field)
    pub fn header_list_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(n, v)| n.len() + v.len() + 32)
            .sum()
    }

    /// Check the rules for a request header block
    pub fn validate_request(&self) -> Result<()> {
        let mut seen: Vec<&[u8]> = Vec::new();
        let mut regular_started = false;

        for (name, value) in self.iter() {
            check_name(name)?;

            if name.starts_with(b":") {
                if regular_started {
                    return Err(invalid(format!(
                        "pseudo-header {} after regular field",
                        show(name)
                    )));
                }
                if !REQUEST_PSEUDO_HEADERS.contains(&name) {
                    return Err(invalid(format!("unknown pseudo-header {}", show(name))));
                }
                if seen.contains(&name) {
                    return Err(invalid(format!("duplicate pseudo-header {}", show(name))));
                }
                if value.is_empty() && name != b":authority" {
                    return Err(invalid(format!("empty {}", show(name))));
                }
                seen.push(name);
            } else {
                regular_started = true;
                check_regular(name, value)?;
            }
        }

        let has = |pseudo: &[u8]| seen.contains(&pseudo);
        if !has(b":method") {
            return Err(invalid(":method missing".to_string()));
        }
        if self.get(":method") == Some(b"CONNECT".as_slice()) {
            if !has(b":authority") || has(b":scheme") || has(b":path") {
                return Err(invalid(
                    "CONNECT requires :authority and no :scheme or :path".to_string(),
                ));
            }
        } else if !has(b":scheme") || !has(b":path") {
            return Err(invalid(":scheme and :path are required".to_string()));
        }

        Ok(())
    }

    /// Check the rules for a trailer block
    pub fn validate_trailers(&self) -> Result<()> {
        for (name, value) in self.iter() {
            check_name(name)?;
            if name.starts_with(b":") {
                return Err(invalid(format!("pseudo-header {} in trailers", show(name))));
            }
            check_regular(name, value)?;
        }
        Ok(())
    }
}

impl From<Vec<(Vec<u8>, Vec<u8>)>> for HeaderList {
    fn from(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        HeaderList::from_pairs(fields)
    }
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b":" {
        return Err(invalid("empty header name".to_string()));
    }
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(invalid(format!("uppercase header name {}", show(name))));
    }
    Ok(())
}

fn check_regular(name: &[u8], value: &[u8]) -> Result<()> {
    if CONNECTION_SPECIFIC_HEADERS.contains(&name) {
        return Err(invalid(format!(
            "connection-specific header {}",
            show(name)
        )));
    }
    if name == b"te" && value != b"trailers" {
        return Err(invalid("te may only carry \"trailers\"".to_string()));
    }
    Ok(())
}

fn invalid(reason: String) -> Error {
    Error::InvalidHeader(reason)
}

fn show(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HeaderList {
        HeaderList::new()
            .with(":method", "GET")
            .with(":scheme", "https")
            .with(":authority", "example.com")
            .with(":path", "/")
    }

    #[test]
    fn test_order_and_duplicates_are_kept() {
        let headers = request().with("set-cookie", "a=1").with("set-cookie", "b=2");
        let cookies: Vec<&[u8]> = headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec![b"a=1".as_slice(), b"b=2".as_slice()]);
        assert_eq!(headers.regular().count(), 2);
        assert_eq!(headers.get_str(":path"), Some("/"));
    }

    #[test]
    fn test_valid_request() {
        request().validate_request().unwrap();
        request().with("te", "trailers").validate_request().unwrap();

        HeaderList::new()
            .with(":method", "CONNECT")
            .with(":authority", "example.com:443")
            .validate_request()
            .unwrap();
    }

    #[test]
    fn test_invalid_requests() {
        let cases = vec![
            // pseudo after regular
            HeaderList::new()
                .with(":method", "GET")
                .with("accept", "*/*")
                .with(":scheme", "https")
                .with(":path", "/"),
            // missing :path
            HeaderList::new().with(":method", "GET").with(":scheme", "https"),
            // unknown pseudo
            request().with(":status", "200"),
            // duplicate pseudo
            HeaderList::new()
                .with(":method", "GET")
                .with(":method", "GET")
                .with(":scheme", "https")
                .with(":path", "/"),
            // uppercase
            request().with("Accept", "*/*"),
            // connection-specific
            request().with("connection", "keep-alive"),
            request().with("te", "gzip"),
            // CONNECT with :path
            HeaderList::new()
                .with(":method", "CONNECT")
                .with(":authority", "example.com:443")
                .with(":path", "/"),
        ];

        for headers in cases {
            assert!(
                matches!(headers.validate_request(), Err(Error::InvalidHeader(_))),
                "accepted {:?}",
                headers
            );
        }
    }

    #[test]
    fn test_trailers() {
        HeaderList::new()
            .with("grpc-status", "0")
            .validate_trailers()
            .unwrap();
        assert!(HeaderList::new()
            .with(":status", "200")
            .validate_trailers()
            .is_err());
    }

    #[test]
    fn test_header_list_size() {
        let headers = HeaderList::new().with("a", "bc");
        assert_eq!(headers.header_list_size(), 35);
    }
}
