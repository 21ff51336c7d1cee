//! Pagination over the aggregated, sorted capability list.
//!
//! Entries are flattened in `(upstream, original)` order; a cursor encodes
//! the next item's position as `base64(upstream + "|" + offset)` where
//! `offset` counts within that upstream's entries. Cursors are opaque to
//! clients and round-trip exactly.
//!
//! Cursors are not stable across a structural change of the upstream set:
//! a cursor naming an upstream that has since vanished resumes at the next
//! upstream in order, never duplicating surviving items.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::GatewayError;

/// Page size when the session does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Hard ceiling on requested page sizes.
pub const MAX_PAGE_SIZE: usize = 500;

/// Decoded cursor position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub upstream: String,
    pub offset: usize,
}

impl Cursor {
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}|{}", self.upstream, self.offset))
    }

    pub fn decode(raw: &str) -> Result<Cursor, GatewayError> {
        let bytes = BASE64
            .decode(raw)
            .map_err(|_| GatewayError::InvalidRequest("malformed cursor".into()))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| GatewayError::InvalidRequest("malformed cursor".into()))?;
        let (upstream, offset) = text
            .rsplit_once('|')
            .ok_or_else(|| GatewayError::InvalidRequest("malformed cursor".into()))?;
        let offset = offset
            .parse::<usize>()
            .map_err(|_| GatewayError::InvalidRequest("malformed cursor".into()))?;
        Ok(Cursor {
            upstream: upstream.to_string(),
            offset,
        })
    }
}

/// One page of an aggregated list.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Slice a page out of `entries`, which must already be sorted by
/// `(upstream, original)`. Each entry is `(upstream, original, item)`.
pub fn paginate<T>(
    entries: Vec<(String, String, T)>,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Page<T>, GatewayError> {
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let position = cursor.map(Cursor::decode).transpose()?;

    // Within-upstream offsets, computed in one pass over the sorted list.
    let mut offsets = Vec::with_capacity(entries.len());
    {
        let mut current: Option<&str> = None;
        let mut count = 0usize;
        for (upstream, _, _) in &entries {
            if current != Some(upstream.as_str()) {
                current = Some(upstream.as_str());
                count = 0;
            }
            offsets.push(count);
            count += 1;
        }
    }

    let start = match &position {
        None => 0,
        Some(cursor) => entries
            .iter()
            .zip(&offsets)
            .position(|((upstream, _, _), offset)| {
                upstream.as_str() > cursor.upstream.as_str()
                    || (upstream.as_str() == cursor.upstream.as_str() && *offset >= cursor.offset)
            })
            .unwrap_or(entries.len()),
    };

    let end = (start + limit).min(entries.len());
    let next_cursor = if end < entries.len() {
        Some(
            Cursor {
                upstream: entries[end].0.clone(),
                offset: offsets[end],
            }
            .encode(),
        )
    } else {
        None
    };

    let items = entries
        .into_iter()
        .skip(start)
        .take(end - start)
        .map(|(_, _, item)| item)
        .collect();

    Ok(Page { items, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(spec: &[(&str, &str)]) -> Vec<(String, String, String)> {
        spec.iter()
            .map(|(upstream, original)| {
                (
                    upstream.to_string(),
                    original.to_string(),
                    format!("{upstream}/{original}"),
                )
            })
            .collect()
    }

    #[test]
    fn cursor_round_trip() {
        let cursor = Cursor {
            upstream: "github".into(),
            offset: 42,
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn cursor_survives_pipes_in_upstream_names() {
        // rsplit keeps the offset intact even if a name contains '|'.
        let cursor = Cursor {
            upstream: "we|rd".into(),
            offset: 3,
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn invalid_cursors_are_rejected() {
        assert!(Cursor::decode("not-base64!!!").is_err());
        assert!(Cursor::decode(&BASE64.encode("no-pipe")).is_err());
        assert!(Cursor::decode(&BASE64.encode("a|not-a-number")).is_err());
    }

    #[test]
    fn walking_pages_yields_exactly_the_unpaginated_list() {
        let all = entries(&[
            ("a", "t1"),
            ("a", "t2"),
            ("a", "t3"),
            ("b", "t1"),
            ("c", "t1"),
            ("c", "t2"),
        ]);

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = paginate(all.clone(), cursor.as_deref(), 2).unwrap();
            collected.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let unpaginated: Vec<String> = all.into_iter().map(|(_, _, item)| item).collect();
        assert_eq!(collected, unpaginated);
    }

    #[test]
    fn no_next_cursor_when_everything_fits() {
        let page = paginate(entries(&[("a", "t1"), ("b", "t1")]), None, 100).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn cursor_into_vanished_upstream_resumes_at_next() {
        // Build a cursor pointing into "b", then drop "b" from the set.
        let before = entries(&[("a", "t1"), ("b", "t1"), ("b", "t2"), ("c", "t1")]);
        let page = paginate(before, None, 2).unwrap();
        let cursor = page.next_cursor.unwrap();

        let after = entries(&[("a", "t1"), ("c", "t1")]);
        let page = paginate(after, Some(&cursor), 2).unwrap();
        assert_eq!(page.items, vec!["c/t1".to_string()]);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn limit_is_clamped() {
        let all = entries(&[("a", "t1"), ("a", "t2")]);
        let page = paginate(all, None, 0).unwrap();
        assert_eq!(page.items.len(), 1);
    }
}
