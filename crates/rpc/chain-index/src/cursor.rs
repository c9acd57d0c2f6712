//! Cursor codec and the pagination protocol shared by every sequential list.
//!
//! Lists are ordered newest first by a 128-bit [`Ordinal`], unique within its
//! list. A [`Cursor`] is the opaque rendering of one ordinal. [`paginate`] walks any [`OrderedList`]:
//!
//! - `count > 0` returns up to `count` edges older than the cursor, or the
//!   newest edges without one;
//! - `count < 0` returns up to `|count|` edges newer than the cursor, or the
//!   oldest edges without one;
//! - `count == 0` returns an empty page with the boundary flags filled in.
//!
//! Edges are always returned newest first.

use std::fmt;

use alloy_primitives::hex;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, RepositoryResult};

/// Position of an element in a sequential list.
pub type Ordinal = u128;

/// Opaque position token in a sequential list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Encode a list ordinal.
    pub fn from_ordinal(ordinal: Ordinal) -> Self {
        Cursor(hex::encode_prefixed(ordinal.to_be_bytes()))
    }

    /// Decode the list ordinal; malformed tokens are invalid cursors.
    pub fn ordinal(&self) -> RepositoryResult<Ordinal> {
        let bytes = hex::decode(&self.0)
            .map_err(|_| RepositoryError::CursorInvalid(self.0.clone()))?;
        let raw: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| RepositoryError::CursorInvalid(self.0.clone()))?;
        Ok(Ordinal::from_be_bytes(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Cursor {
    fn from(value: String) -> Self {
        Cursor(value)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Cursor(value.to_string())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction of a list scan relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Smaller ordinals, returned in descending order.
    Older,
    /// Larger ordinals, returned in ascending order.
    Newer,
}

/// One bounded scan over a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    /// Exclusive start; `None` starts at the matching end of the list.
    pub anchor: Option<Ordinal>,
    pub direction: ScanDirection,
    pub limit: usize,
}

/// Source of a totally ordered list, typically a store query with filters.
pub trait OrderedList {
    /// Natural key of a list element.
    type Key;

    /// Read up to `range.limit` `(ordinal, key)` pairs strictly beyond the
    /// anchor, nearest first.
    fn scan(&self, range: ScanRange) -> RepositoryResult<Vec<(Ordinal, Self::Key)>>;

    /// Whether an element with this ordinal is present.
    fn contains(&self, ordinal: Ordinal) -> RepositoryResult<bool>;

    /// Number of elements in the list.
    fn total(&self) -> RepositoryResult<u64>;
}

/// Clamp the magnitude of a requested count, keeping its sign.
pub fn clamp_count(count: i32, max: u32) -> i32 {
    let max = max.min(i32::MAX as u32) as i32;
    count.clamp(-max, max)
}

/// Information about a page of edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Cursor of the first edge, `None` for an empty page.
    pub first: Option<Cursor>,
    /// Cursor of the last edge, `None` for an empty page.
    pub last: Option<Cursor>,
    /// Whether there is an older edge after the last one.
    pub has_next: bool,
    /// Whether there is a newer edge before the first one.
    pub has_previous: bool,
}

/// Single list element with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub cursor: Cursor,
    pub node: T,
}

/// Window of a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub edges: Vec<Edge<T>>,
    pub total_count: u64,
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    /// Nodes of the page, newest first.
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|edge| &edge.node)
    }

    /// Replace the node of every edge, keeping cursors and page info.
    pub fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        let edges = self
            .edges
            .into_iter()
            .map(|edge| {
                Ok(Edge {
                    cursor: edge.cursor,
                    node: f(edge.node)?,
                })
            })
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Page {
            edges,
            total_count: self.total_count,
            page_info: self.page_info,
        })
    }

    /// Replace the nodes with `nodes`, one per edge in order.
    pub fn with_nodes<U>(self, nodes: Vec<U>) -> RepositoryResult<Page<U>> {
        if nodes.len() != self.edges.len() {
            return Err(RepositoryError::Storage(format!(
                "page of {} edges resolved to {} nodes",
                self.edges.len(),
                nodes.len()
            )));
        }
        let mut nodes = nodes.into_iter();
        self.try_map(|_| {
            nodes
                .next()
                .ok_or_else(|| RepositoryError::Storage("page node missing".to_string()))
        })
    }
}

/// Load one page of `list` following the pagination protocol.
///
/// `count` is clamped to `max` before use. A cursor that does not resolve to
/// a present element fails with [`RepositoryError::CursorInvalid`].
pub fn paginate<L>(
    list: &L,
    cursor: Option<&Cursor>,
    count: i32,
    max: u32,
) -> RepositoryResult<Page<L::Key>>
where
    L: OrderedList + ?Sized,
{
    let count = clamp_count(count, max);

    let anchor = match cursor {
        Some(cursor) => {
            let ordinal = cursor.ordinal()?;
            if !list.contains(ordinal)? {
                return Err(RepositoryError::CursorInvalid(cursor.to_string()));
            }
            Some(ordinal)
        }
        None => None,
    };

    let total_count = list.total()?;

    if count == 0 {
        let has_next = match anchor {
            Some(_) => !list
                .scan(ScanRange {
                    anchor,
                    direction: ScanDirection::Older,
                    limit: 1,
                })?
                .is_empty(),
            None => total_count > 0,
        };
        return Ok(Page {
            edges: Vec::new(),
            total_count,
            page_info: PageInfo {
                first: None,
                last: None,
                has_next,
                has_previous: anchor.is_some(),
            },
        });
    }

    let direction = if count > 0 {
        ScanDirection::Older
    } else {
        ScanDirection::Newer
    };
    let limit = count.unsigned_abs() as usize;

    // one extra row tells whether the list continues past this page
    let mut rows = list.scan(ScanRange {
        anchor,
        direction,
        limit: limit + 1,
    })?;
    let more = rows.len() > limit;
    rows.truncate(limit);
    if direction == ScanDirection::Newer {
        rows.reverse();
    }

    let (has_next, has_previous) = match direction {
        ScanDirection::Older => (more, anchor.is_some()),
        ScanDirection::Newer => (anchor.is_some(), more),
    };

    let edges: Vec<Edge<L::Key>> = rows
        .into_iter()
        .map(|(ordinal, key)| Edge {
            cursor: Cursor::from_ordinal(ordinal),
            node: key,
        })
        .collect();

    Ok(Page {
        page_info: PageInfo {
            first: edges.first().map(|e| e.cursor.clone()),
            last: edges.last().map(|e| e.cursor.clone()),
            has_next,
            has_previous,
        },
        edges,
        total_count,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// In-memory list over sorted ordinals.
    pub(crate) struct VecList(pub Vec<Ordinal>);

    impl VecList {
        pub(crate) fn new(mut ordinals: Vec<Ordinal>) -> Self {
            ordinals.sort_unstable();
            ordinals.dedup();
            VecList(ordinals)
        }
    }

    impl OrderedList for VecList {
        type Key = Ordinal;

        fn scan(&self, range: ScanRange) -> RepositoryResult<Vec<(Ordinal, Ordinal)>> {
            let rows: Vec<(Ordinal, Ordinal)> = match range.direction {
                ScanDirection::Older => self
                    .0
                    .iter()
                    .rev()
                    .filter(|o| range.anchor.is_none_or(|a| **o < a))
                    .take(range.limit)
                    .map(|o| (*o, *o))
                    .collect(),
                ScanDirection::Newer => self
                    .0
                    .iter()
                    .filter(|o| range.anchor.is_none_or(|a| **o > a))
                    .take(range.limit)
                    .map(|o| (*o, *o))
                    .collect(),
            };
            Ok(rows)
        }

        fn contains(&self, ordinal: Ordinal) -> RepositoryResult<bool> {
            Ok(self.0.binary_search(&ordinal).is_ok())
        }

        fn total(&self) -> RepositoryResult<u64> {
            Ok(self.0.len() as u64)
        }
    }

    fn keys(page: &Page<Ordinal>) -> Vec<Ordinal> {
        page.nodes().copied().collect()
    }

    #[test]
    fn test_cursor_round_trips_ordinal() {
        let cursor = Cursor::from_ordinal(0x1234_5678_9abc);
        assert_eq!(cursor.ordinal().unwrap(), 0x1234_5678_9abc);

        let wide = (7u128 << 64) | (u128::from(u32::MAX) << 32) | 4096;
        assert_eq!(Cursor::from_ordinal(wide).ordinal().unwrap(), wide);
        assert!(cursor.as_str().starts_with("0x"));
    }

    #[test]
    fn test_malformed_cursor_is_invalid() {
        for raw in ["", "zz", "0x0102", "0x0102030405060708", "0x0102030405060708090a"] {
            let err = Cursor::from(raw).ordinal().unwrap_err();
            assert!(matches!(err, RepositoryError::CursorInvalid(_)), "{raw}");
        }
    }

    #[test]
    fn test_first_page_is_newest_first() {
        let list = VecList::new((1..=10).collect());
        let page = paginate(&list, None, 3, 250).unwrap();

        assert_eq!(keys(&page), vec![10, 9, 8]);
        assert_eq!(page.total_count, 10);
        assert!(page.page_info.has_next);
        assert!(!page.page_info.has_previous);
        assert_eq!(page.page_info.first, Some(Cursor::from_ordinal(10)));
        assert_eq!(page.page_info.last, Some(Cursor::from_ordinal(8)));
    }

    #[test]
    fn test_negative_count_without_cursor_starts_at_bottom() {
        let list = VecList::new((1..=10).collect());
        let page = paginate(&list, None, -3, 250).unwrap();

        assert_eq!(keys(&page), vec![3, 2, 1]);
        assert!(!page.page_info.has_next);
        assert!(page.page_info.has_previous);
    }

    #[test]
    fn test_negative_count_with_cursor_returns_newer_edges() {
        let list = VecList::new((1..=10).collect());
        let cursor = Cursor::from_ordinal(5);
        let page = paginate(&list, Some(&cursor), -2, 250).unwrap();

        assert_eq!(keys(&page), vec![7, 6]);
        assert!(page.page_info.has_next);
        assert!(page.page_info.has_previous);
    }

    #[test]
    fn test_zero_count_reports_boundaries() {
        let list = VecList::new((1..=4).collect());

        let page = paginate(&list, None, 0, 250).unwrap();
        assert!(page.edges.is_empty());
        assert!(page.page_info.has_next);
        assert!(!page.page_info.has_previous);
        assert_eq!(page.page_info.first, None);

        let bottom = Cursor::from_ordinal(1);
        let page = paginate(&list, Some(&bottom), 0, 250).unwrap();
        assert!(!page.page_info.has_next);
        assert!(page.page_info.has_previous);

        let empty = VecList::new(vec![]);
        let page = paginate(&empty, None, 0, 250).unwrap();
        assert!(!page.page_info.has_next);
        assert_eq!(page.total_count, 0);
    }

    #[test]
    fn test_count_is_clamped_silently() {
        let list = VecList::new((0..1000).collect());

        let page = paginate(&list, None, 10_000, 250).unwrap();
        assert_eq!(page.edges.len(), 250);

        let page = paginate(&list, None, -10_000, 250).unwrap();
        assert_eq!(page.edges.len(), 250);

        assert_eq!(clamp_count(i32::MIN, 250), -250);
        assert_eq!(clamp_count(-7, 250), -7);
    }

    #[test]
    fn test_cursor_of_missing_element_is_invalid() {
        let list = VecList::new(vec![2, 4, 6]);
        let stale = Cursor::from_ordinal(5);

        let err = paginate(&list, Some(&stale), 2, 250).unwrap_err();
        assert!(matches!(err, RepositoryError::CursorInvalid(_)));

        let err = paginate(&list, Some(&stale), 0, 250).unwrap_err();
        assert!(matches!(err, RepositoryError::CursorInvalid(_)));
    }

    #[test]
    fn test_page_try_map_keeps_cursors() {
        let list = VecList::new(vec![1, 2, 3]);
        let page = paginate(&list, None, 2, 250).unwrap();
        let mapped = page
            .clone()
            .try_map(|k| Ok::<_, RepositoryError>(k * 10))
            .unwrap();

        assert_eq!(mapped.nodes().copied().collect::<Vec<_>>(), vec![30, 20]);
        assert_eq!(mapped.page_info, page.page_info);
        assert_eq!(mapped.edges[0].cursor, page.edges[0].cursor);
    }

    proptest! {
        /// Forward traversal reconstructs the whole list, newest first.
        #[test]
        fn prop_forward_pages_cover_list(
            ordinals in proptest::collection::vec(0u128..10_000, 0..120),
            step in 1i32..40,
        ) {
            let list = VecList::new(ordinals);
            let mut expected = list.0.clone();
            expected.reverse();

            let mut seen = Vec::new();
            let mut cursor: Option<Cursor> = None;
            loop {
                let page = paginate(&list, cursor.as_ref(), step, 250).unwrap();
                prop_assert!(page.edges.len() <= step as usize);
                seen.extend(keys(&page));
                if !page.page_info.has_next {
                    break;
                }
                cursor = page.page_info.last.clone();
            }
            prop_assert_eq!(seen, expected);
        }

        /// Backward traversal reconstructs the whole list as well.
        #[test]
        fn prop_backward_pages_cover_list(
            ordinals in proptest::collection::vec(any::<u128>(), 0..120),
            step in 1i32..40,
        ) {
            let list = VecList::new(ordinals);
            let mut expected = list.0.clone();
            expected.reverse();

            let mut seen: Vec<Ordinal> = Vec::new();
            let mut cursor: Option<Cursor> = None;
            loop {
                let page = paginate(&list, cursor.as_ref(), -step, 250).unwrap();
                let mut chunk = keys(&page);
                chunk.extend(seen);
                seen = chunk;
                if !page.page_info.has_previous {
                    break;
                }
                cursor = page.page_info.first.clone();
            }
            prop_assert_eq!(seen, expected);
        }
    }
}
