//! Turns a device's flat point list into legal batch reads.
//!
//! Collection rules claim their address ranges first, in record order; an
//! address claimed by an earlier rule is gone for later ones. What is left is
//! split into runs of adjacent addresses. Every group stays within
//! [`MAX_READ_QUANTITY`] items, and the result is ordered by descending
//! priority, keeping the build order between equal priorities.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{MAX_READ_QUANTITY, is_read, item_width};
use crate::model::{CollectionRule, Point};
use crate::snapshot::PointGroup;

type AddressMap = BTreeMap<u16, Vec<Arc<Point>>>;

/// Build the ordered poll groups for one device.
pub fn schedule(points: &[Arc<Point>], rules: &[CollectionRule]) -> Vec<PointGroup> {
    let mut buckets = bucket(points);
    let mut groups = Vec::new();

    for rule in rules {
        if rule.start >= rule.end {
            debug!(
                "Ignoring collection rule '{}': start {} is not below end {}",
                rule.id, rule.start, rule.end
            );
            continue;
        }
        let Some(bucket) = buckets.get_mut(&rule.function_code) else {
            continue;
        };

        let claimed: Vec<u16> = bucket.range(rule.start..=rule.end).map(|(a, _)| *a).collect();
        let mut runs = Runs::new(rule.function_code);
        for address in claimed {
            if let Some(points) = bucket.remove(&address) {
                runs.push(address, points, false);
            }
        }
        groups.extend(runs.finish());
    }

    for (function_code, bucket) in buckets {
        let mut runs = Runs::new(function_code);
        for (address, points) in bucket {
            runs.push(address, points, true);
        }
        groups.extend(runs.finish());
    }

    groups.sort_by(|a, b| b.priority().cmp(&a.priority()));
    groups
}

/// Points keyed by function code, then address.
fn bucket(points: &[Arc<Point>]) -> BTreeMap<u8, AddressMap> {
    let mut buckets: BTreeMap<u8, AddressMap> = BTreeMap::new();
    for point in points {
        if !is_read(point.function_code) {
            warn!(
                "Point '{}' uses function code {:#04x}, which cannot be polled",
                point.tag, point.function_code
            );
            continue;
        }
        let extent = point.extent(item_width(point.function_code));
        if extent > MAX_READ_QUANTITY {
            warn!(
                "Point '{}' spans {} items, more than one read can return",
                point.tag, extent
            );
            continue;
        }
        buckets
            .entry(point.function_code)
            .or_default()
            .entry(point.address)
            .or_default()
            .push(Arc::clone(point));
    }
    buckets
}

/// Accumulates consecutive groups for one function code.
struct Runs {
    function_code: u8,
    current: PointGroup,
    done: Vec<PointGroup>,
}

impl Runs {
    fn new(function_code: u8) -> Self {
        Self {
            function_code,
            current: PointGroup::new(function_code),
            done: Vec::new(),
        }
    }

    /// Add an address; `split_on_gap` starts a new group when the address is
    /// not adjacent to the current one.
    fn push(&mut self, address: u16, points: Vec<Arc<Point>>, split_on_gap: bool) {
        if !self.current.is_empty() {
            let width = item_width(self.function_code);
            let extent = points.iter().map(|p| p.extent(width)).max().unwrap_or(1);
            let last = address.saturating_add(extent - 1).max(self.current.end());
            let quantity = u32::from(last) - u32::from(self.current.start()) + 1;
            let gap = address > self.current.end().saturating_add(1);

            if quantity > u32::from(MAX_READ_QUANTITY) || (split_on_gap && gap) {
                let full = std::mem::replace(&mut self.current, PointGroup::new(self.function_code));
                self.done.push(full);
            }
        }
        self.current.insert(address, points);
    }

    fn finish(mut self) -> Vec<PointGroup> {
        if !self.current.is_empty() {
            self.done.push(self.current);
        }
        self.done
    }
}
