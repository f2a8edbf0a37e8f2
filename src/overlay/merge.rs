//! The sorted-merge iterator behind `IsolatedTable::scan`: walks the
//! connection's overlay and the shared underlying table in lockstep,
//! ordering by the same byte key both sides sort on, letting the overlay
//! win on an exact key match and dropping overlay tombstones silently.
//!
//! Grounded on the teacher's `storage_engine.rs` merge between its
//! in-memory write buffer and its on-disk B-tree scan, generalized from a
//! hard-coded key type to any byte key plus a row payload.

use crate::error::Result;
use crate::row::Row;
use std::iter::Peekable;

/// One entry from the overlay's change set: `Some(row)` for an inserted or
/// updated row, `None` for a tombstoned (deleted) one.
pub type OverlayEntry = (Vec<u8>, Option<Row>);
pub type BaseEntry = (Vec<u8>, Row);

pub struct MergeIter<O, B>
where
    O: Iterator<Item = Result<OverlayEntry>>,
    B: Iterator<Item = Result<BaseEntry>>,
{
    overlay: Peekable<O>,
    base: Peekable<B>,
    descending: bool,
}

impl<O, B> MergeIter<O, B>
where
    O: Iterator<Item = Result<OverlayEntry>>,
    B: Iterator<Item = Result<BaseEntry>>,
{
    pub fn new(overlay: O, base: B, descending: bool) -> Self {
        Self { overlay: overlay.peekable(), base: base.peekable(), descending }
    }

    /// True if `a` should be taken before `b` given scan direction.
    fn a_first(&self, a: &[u8], b: &[u8]) -> bool {
        if self.descending {
            a > b
        } else {
            a < b
        }
    }
}

impl<O, B> Iterator for MergeIter<O, B>
where
    O: Iterator<Item = Result<OverlayEntry>>,
    B: Iterator<Item = Result<BaseEntry>>,
{
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let overlay_key = match self.overlay.peek() {
                Some(Ok((k, _))) => Some(k.clone()),
                Some(Err(_)) => {
                    let Some(Err(e)) = self.overlay.next() else { unreachable!() };
                    return Some(Err(e));
                }
                None => None,
            };
            let base_key = match self.base.peek() {
                Some(Ok((k, _))) => Some(k.clone()),
                Some(Err(_)) => {
                    let Some(Err(e)) = self.base.next() else { unreachable!() };
                    return Some(Err(e));
                }
                None => None,
            };

            match (overlay_key, base_key) {
                (None, None) => return None,
                (Some(_), None) => {
                    let (_, entry) = self.overlay.next().unwrap().unwrap();
                    if let Some(row) = entry {
                        return Some(Ok(row));
                    }
                    // tombstone with nothing underneath: skip
                }
                (None, Some(_)) => {
                    let (_, row) = self.base.next().unwrap().unwrap();
                    return Some(Ok(row));
                }
                (Some(ok), Some(bk)) => {
                    if ok == bk {
                        // overlay shadows the base row entirely, whether it
                        // is a replacement or a tombstone.
                        self.base.next();
                        let (_, entry) = self.overlay.next().unwrap().unwrap();
                        if let Some(row) = entry {
                            return Some(Ok(row));
                        }
                    } else if self.a_first(&ok, &bk) {
                        let (_, entry) = self.overlay.next().unwrap().unwrap();
                        if let Some(row) = entry {
                            return Some(Ok(row));
                        }
                    } else {
                        let (_, row) = self.base.next().unwrap().unwrap();
                        return Some(Ok(row));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(n: i64) -> Row {
        vec![Value::Integer(n)]
    }

    fn key(n: i64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn merges_disjoint_keys_in_order() {
        let overlay: Vec<Result<OverlayEntry>> = vec![Ok((key(2), Some(row(2))))];
        let base: Vec<Result<BaseEntry>> = vec![Ok((key(1), row(1))), Ok((key(3), row(3)))];
        let merged: Vec<Row> = MergeIter::new(overlay.into_iter(), base.into_iter(), false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged, vec![row(1), row(2), row(3)]);
    }

    #[test]
    fn overlay_replaces_base_on_key_match() {
        let overlay: Vec<Result<OverlayEntry>> = vec![Ok((key(1), Some(row(99))))];
        let base: Vec<Result<BaseEntry>> = vec![Ok((key(1), row(1)))];
        let merged: Vec<Row> = MergeIter::new(overlay.into_iter(), base.into_iter(), false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged, vec![row(99)]);
    }

    #[test]
    fn tombstone_suppresses_base_row() {
        let overlay: Vec<Result<OverlayEntry>> = vec![Ok((key(1), None))];
        let base: Vec<Result<BaseEntry>> = vec![Ok((key(1), row(1)))];
        let merged: Vec<Row> = MergeIter::new(overlay.into_iter(), base.into_iter(), false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn descending_order_respected() {
        let overlay: Vec<Result<OverlayEntry>> = vec![Ok((key(2), Some(row(2))))];
        let base: Vec<Result<BaseEntry>> = vec![Ok((key(3), row(3))), Ok((key(1), row(1)))];
        let merged: Vec<Row> = MergeIter::new(overlay.into_iter(), base.into_iter(), true)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged, vec![row(3), row(2), row(1)]);
    }
}
