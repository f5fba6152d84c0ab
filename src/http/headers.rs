//! The header list: an ordered sequence of raw name/value pairs.
//!
//! Duplicates, ordering, and original casing are preserved on purpose —
//! an intermediary must be able to forward what it received byte-for-byte
//! (hop-by-hop fields excepted). Lookup is case-insensitive.

use std::collections::{HashMap, HashSet};

use bytes::{BufMut, Bytes, BytesMut};

/// Headers scoped to a single hop, per RFC 7230 §6.1. Stripped before a
/// message is sent and hidden from user visibility on receipt; the engine
/// inserts its own.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An ordered list of `(name, value)` header pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(Bytes, Bytes)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Appends a pair, copying the given bytes.
    pub fn push<N, V>(&mut self, name: N, value: V)
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.entries.push((
            Bytes::copy_from_slice(name.as_ref()),
            Bytes::copy_from_slice(value.as_ref()),
        ));
    }

    /// Appends a pair without copying.
    pub fn push_bytes(&mut self, name: Bytes, value: Bytes) {
        self.entries.push((name, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    /// The set of field names present, lowercased.
    pub fn names(&self) -> HashSet<String> {
        self.entries
            .iter()
            .map(|(n, _)| lower(n))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
    }

    /// Every raw (unsplit) value for `name`, in arrival order.
    pub fn raw(&self, name: &str) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_ref())
            .collect()
    }

    /// Every value for `name` (case-insensitive), with comma-separated
    /// list members split out and trimmed.
    ///
    /// Caveat: the split is naive about commas inside quoted strings, so
    /// this is not safe for fields like `Set-Cookie` whose values may
    /// contain them; use [`Headers::raw`] for those.
    pub fn get(&self, name: &str) -> Vec<String> {
        let mut values = Vec::new();

        for (n, v) in &self.entries {
            if !n.eq_ignore_ascii_case(name.as_bytes()) {
                continue;
            }
            for part in String::from_utf8_lossy(v).split(',') {
                let part = part.trim();
                if !part.is_empty() {
                    values.push(part.to_string());
                }
            }
        }

        values
    }

    /// Comma-split values keyed by lowercased name, skipping any name in
    /// `omit`. The quoted-string caveat of [`Headers::get`] applies.
    pub fn dict(&self, omit: &[&str]) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();

        for (n, v) in &self.entries {
            if omit.iter().any(|o| n.eq_ignore_ascii_case(o.as_bytes())) {
                continue;
            }
            let entry = map.entry(lower(n)).or_default();
            for part in String::from_utf8_lossy(v).split(',') {
                let part = part.trim();
                if !part.is_empty() {
                    entry.push(part.to_string());
                }
            }
        }

        map
    }

    /// Removes every occurrence of `name`, case-insensitively.
    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name.as_bytes()));
    }

    /// Lowercased, trimmed list members of `name` — the shape wanted for
    /// `Connection` and `Transfer-Encoding` token lists.
    pub(crate) fn token_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .into_iter()
            .map(|v| v.to_ascii_lowercase())
            .collect()
    }

    /// Strips the RFC 7230 §6.1 hop-by-hop set plus any field named by a
    /// `Connection` header in this list.
    pub fn strip_hop_by_hop(&mut self) {
        let mut named: HashSet<String> = self.token_list("connection").into_iter().collect();
        for hop in HOP_BY_HOP {
            named.insert((*hop).to_string());
        }

        self.entries.retain(|(n, _)| !named.contains(&lower(n)));
    }

    /// Extends the last entry's value with a folded continuation line:
    /// one space, then the folded text. Returns `false` when there is no
    /// entry to fold onto.
    pub(crate) fn fold_last(&mut self, folded: &[u8]) -> bool {
        let last = match self.entries.last_mut() {
            Some(last) => last,
            None => return false,
        };

        let mut value = BytesMut::with_capacity(last.1.len() + 1 + folded.len());
        value.extend_from_slice(&last.1);
        value.put_u8(b' ');
        value.extend_from_slice(folded);
        last.1 = value.freeze();

        true
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Headers {
        let mut headers = Headers::new();
        for (n, v) in iter {
            headers.push(n, v);
        }
        headers
    }
}

fn lower(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::Headers;

    fn sample() -> Headers {
        [
            ("Host", "example.com"),
            ("Accept", "text/html, text/plain"),
            ("accept", "application/json"),
            ("X-Custom", "One"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn lookup_is_case_insensitive_and_comma_splits() {
        let headers = sample();
        assert_eq!(
            headers.get("ACCEPT"),
            vec!["text/html", "text/plain", "application/json"]
        );
        assert_eq!(headers.get("host"), vec!["example.com"]);
        assert!(headers.get("missing").is_empty());
    }

    #[test]
    fn names_are_lowercased() {
        let names = sample().names();
        assert!(names.contains("host"));
        assert!(names.contains("accept"));
        assert!(names.contains("x-custom"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn dict_skips_omitted_names() {
        let dict = sample().dict(&["Accept"]);
        assert!(!dict.contains_key("accept"));
        assert_eq!(dict["host"], vec!["example.com"]);
    }

    #[test]
    fn raw_preserves_unsplit_values_in_order() {
        let headers = sample();
        let raw = headers.raw("Accept");
        assert_eq!(raw, vec![&b"text/html, text/plain"[..], &b"application/json"[..]]);
    }

    #[test]
    fn ordering_and_duplicates_survive() {
        let headers = sample();
        let names: Vec<&[u8]> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![&b"Host"[..], &b"Accept"[..], &b"accept"[..], &b"X-Custom"[..]]
        );
    }

    #[test]
    fn strip_hop_by_hop_takes_standard_set_and_connection_named() {
        let mut headers: Headers = [
            ("Connection", "keep-alive, X-Session"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("X-Session", "abc"),
            ("X-Keep", "yes"),
            ("TE", "trailers"),
        ]
        .into_iter()
        .collect();

        headers.strip_hop_by_hop();

        let names: Vec<&[u8]> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![&b"X-Keep"[..]]);
    }

    #[test]
    fn fold_appends_with_a_single_space() {
        let mut headers: Headers = [("X-Long", "first")].into_iter().collect();
        assert!(headers.fold_last(b"second part"));
        assert_eq!(headers.raw("X-Long"), vec![&b"first second part"[..]]);

        let mut empty = Headers::new();
        assert!(!empty.fold_last(b"orphan"));
    }
}
