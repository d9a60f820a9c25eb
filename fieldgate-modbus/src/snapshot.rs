//! Point groups: the unit of one poll request/response cycle.

use fieldgate_common::TelemetryValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::codec::item_width;
use crate::decoder::PointDecoder;
use crate::error::DecodeError;
use crate::model::Point;

/// Function code, address span and the points read by one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGroup {
    function_code: u8,
    start: u16,
    /// Last address covered, including the extent of wide points.
    end: u16,
    priority: u8,
    size: usize,
    points: BTreeMap<u16, Vec<Arc<Point>>>,
}

impl PointGroup {
    pub fn new(function_code: u8) -> Self {
        Self {
            function_code,
            start: 0,
            end: 0,
            priority: 0,
            size: 0,
            points: BTreeMap::new(),
        }
    }

    /// Add the points sitting at `address`.
    pub fn insert(&mut self, address: u16, points: Vec<Arc<Point>>) {
        if points.is_empty() {
            return;
        }
        let width = item_width(self.function_code);
        let extent = points.iter().map(|p| p.extent(width)).max().unwrap_or(1);
        let last = address.saturating_add(extent - 1);

        if self.points.is_empty() {
            self.start = address;
            self.end = last;
        } else {
            self.start = self.start.min(address);
            self.end = self.end.max(last);
        }
        self.priority = points
            .iter()
            .map(|p| p.priority)
            .fold(self.priority, u8::max);
        self.size += points.len();
        self.points.entry(address).or_default().extend(points);
    }

    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Items to request: `end - start + 1`, or 0 when empty. Wider than the
    /// address type since a group may span the whole address space.
    pub fn quantity(&self) -> u32 {
        if self.points.is_empty() {
            0
        } else {
            u32::from(self.end) - u32::from(self.start) + 1
        }
    }

    /// Highest priority among member points.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Number of member points.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.points.keys().copied()
    }

    pub fn points(&self) -> impl Iterator<Item = &Arc<Point>> {
        self.points.values().flatten()
    }

    /// Decode every member point from a response payload into `{tag: value}`.
    ///
    /// The first point that fails to decode fails the whole group.
    pub fn parse(
        &self,
        payload: &[u8],
        item_width: usize,
        decoder: &PointDecoder,
    ) -> Result<HashMap<String, TelemetryValue>, DecodeError> {
        let mut values = HashMap::with_capacity(self.size);
        for (address, points) in &self.points {
            let offset = (*address - self.start) as usize * item_width;
            for point in points {
                let window = payload.get(offset..).unwrap_or_default();
                let value = decoder
                    .decode(point, window, item_width)
                    .map_err(|e| match e {
                        DecodeError::InsufficientData {
                            needed, available, ..
                        } => DecodeError::InsufficientData {
                            offset,
                            needed,
                            available,
                        },
                        other => other,
                    })?;
                values.insert(point.tag.clone(), value);
            }
        }
        Ok(values)
    }
}
