//! Index of server-pushed streams nobody has claimed yet

use super::error::{Error, Result};
use super::frames::HeaderList;
use super::stream::{header_value, StreamId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushedStreamEntry {
    pub stream_id: StreamId,
    pub created: Instant,
}

/// URL -> unclaimed pushed stream
#[derive(Debug, Default)]
pub struct PushedStreamIndex {
    entries: HashMap<Url, PushedStreamEntry>,
}

impl PushedStreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.entries.contains_key(url)
    }

    pub fn get(&self, url: &Url) -> Option<&PushedStreamEntry> {
        self.entries.get(url)
    }

    /// Add an entry. Returns false, leaving the index unchanged, when the
    /// URL already has an unclaimed push.
    pub fn insert(&mut self, url: Url, stream_id: StreamId, created: Instant) -> bool {
        if self.entries.contains_key(&url) {
            return false;
        }
        self.entries.insert(url, PushedStreamEntry { stream_id, created });
        true
    }

    /// Claim the push for `url`
    pub fn remove(&mut self, url: &Url) -> Option<PushedStreamEntry> {
        self.entries.remove(url)
    }

    /// Drop the entry that points at `stream_id`, if any
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<Url> {
        let url = self
            .entries
            .iter()
            .find(|(_, entry)| entry.stream_id == stream_id)
            .map(|(url, _)| url.clone())?;
        self.entries.remove(&url);
        Some(url)
    }

    /// Remove entries created before `now - lifetime`, oldest first
    pub fn remove_expired(&mut self, now: Instant, lifetime: Duration) -> Vec<(Url, StreamId)> {
        let Some(cutoff) = now.checked_sub(lifetime) else {
            return Vec::new();
        };
        let mut expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.created < cutoff)
            .map(|(url, entry)| (url.clone(), entry.stream_id, entry.created))
            .collect();
        expired.sort_by_key(|(_, _, created)| *created);

        expired
            .into_iter()
            .map(|(url, stream_id, _)| {
                self.entries.remove(&url);
                (url, stream_id)
            })
            .collect()
    }

    pub fn clear(&mut self) -> Vec<(Url, StreamId)> {
        self.entries
            .drain()
            .map(|(url, entry)| (url, entry.stream_id))
            .collect()
    }
}

/// Absolute URL of a promised request, from its pseudo-headers
pub fn url_from_push_headers(headers: &HeaderList) -> Result<Url> {
    let scheme = header_value(headers, ":scheme");
    let authority = header_value(headers, ":authority");
    let path = header_value(headers, ":path");
    let (Some(scheme), Some(authority), Some(path)) = (scheme, authority, path) else {
        return Err(Error::InvalidUrl("push promise is missing pseudo-headers".to_string()));
    };
    if authority.is_empty() || !path.starts_with('/') {
        return Err(Error::InvalidUrl(format!("{}://{}{}", scheme, authority, path)));
    }
    Url::parse(&format!("{}://{}{}", scheme, authority, path)).map_err(|e| Error::InvalidUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut index = PushedStreamIndex::new();
        let now = Instant::now();
        assert!(index.insert(url("https://a.test/x.js"), 2, now));
        assert!(!index.insert(url("https://a.test/x.js"), 4, now));
        assert_eq!(index.get(&url("https://a.test/x.js")).map(|e| e.stream_id), Some(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_and_remove_stream() {
        let mut index = PushedStreamIndex::new();
        let now = Instant::now();
        index.insert(url("https://a.test/1"), 2, now);
        index.insert(url("https://a.test/2"), 4, now);

        assert_eq!(index.remove(&url("https://a.test/1")).map(|e| e.stream_id), Some(2));
        assert!(index.remove(&url("https://a.test/1")).is_none());
        assert_eq!(index.remove_stream(4), Some(url("https://a.test/2")));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_expired() {
        let mut index = PushedStreamIndex::new();
        let start = Instant::now();
        let lifetime = Duration::from_secs(300);
        index.insert(url("https://a.test/old"), 2, start);
        index.insert(url("https://a.test/new"), 4, start + Duration::from_secs(200));

        assert!(index.remove_expired(start + Duration::from_secs(300), lifetime).is_empty());

        let expired = index.remove_expired(start + Duration::from_secs(301), lifetime);
        assert_eq!(expired, vec![(url("https://a.test/old"), 2)]);
        assert!(index.contains(&url("https://a.test/new")));
    }

    #[test]
    fn test_url_from_push_headers() {
        let headers: HeaderList = vec![
            (":method".into(), "GET".into()),
            (":scheme".into(), "https".into()),
            (":authority".into(), "a.test".into()),
            (":path".into(), "/style.css?v=2".into()),
        ];
        assert_eq!(
            url_from_push_headers(&headers).unwrap(),
            url("https://a.test/style.css?v=2")
        );

        let missing: HeaderList = vec![(":scheme".into(), "https".into())];
        assert!(matches!(url_from_push_headers(&missing), Err(Error::InvalidUrl(_))));
    }
}
