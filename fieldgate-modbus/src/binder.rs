//! Cyclic cursor over a device's poll groups.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::snapshot::PointGroup;

#[derive(Debug, Default)]
pub struct PointBinder {
    groups: Vec<Arc<PointGroup>>,
    index: Mutex<usize>,
}

impl PointBinder {
    pub fn new(groups: Vec<PointGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            index: Mutex::new(0),
        }
    }

    /// The group at the cursor, advancing and wrapping past the end. `None`
    /// when there are no groups at all.
    pub fn next(&self) -> Option<Arc<PointGroup>> {
        if self.groups.is_empty() {
            return None;
        }
        let mut index = self.index.lock();
        let group = Arc::clone(&self.groups[*index]);
        *index = (*index + 1) % self.groups.len();
        Some(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(n: u8) -> Vec<PointGroup> {
        (1..=n).map(PointGroup::new).collect()
    }

    #[test]
    fn test_wraps_to_first_group() {
        let binder = PointBinder::new(groups(3));
        let seen: Vec<u8> = (0..4)
            .map(|_| binder.next().unwrap().function_code())
            .collect();
        assert_eq!(seen, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_empty_binder_never_panics() {
        let binder = PointBinder::new(Vec::new());
        for _ in 0..5 {
            assert!(binder.next().is_none());
        }
        assert!(binder.is_empty());
    }

    #[test]
    fn test_single_group_repeats() {
        let binder = PointBinder::new(groups(1));
        assert_eq!(binder.next().unwrap().function_code(), 1);
        assert_eq!(binder.next().unwrap().function_code(), 1);
        assert_eq!(binder.len(), 1);
    }
}
