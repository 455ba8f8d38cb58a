use smallvec::{smallvec, SmallVec};

// ---

/// A closed interval `[min, max]` over f64, including the infinities.
///
/// The empty range is encoded as an inverted pair (`min > max`), so `min` and
/// `max` carry no meaning while [`Self::is_empty`] returns true.
///
/// `max = +∞` is the conventional "open top" sentinel used by the slice
/// planner for requests with no upper revision bound.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RevisionRange {
    pub min: f64,
    pub max: f64,
}

impl RevisionRange {
    pub const EMPTY: Self = Self {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    #[inline]
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn point(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !(self.min <= self.max)
    }

    /// Extends the range so that it contains `value`.
    pub fn add_value(&mut self, value: f64) {
        if self.is_empty() {
            *self = Self::point(value);
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        !self.is_empty() && self.min <= value && value <= self.max
    }

    /// `max - min`, or 0 for the empty range.
    #[inline]
    pub fn duration(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.max - self.min
        }
    }

    /// `[max(a.min, b.min), min(a.max, b.max)]`; empty if either operand is
    /// empty or the bounds cross.
    pub fn intersection(&self, other: &Self) -> Self {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        if min <= max {
            Self { min, max }
        } else {
            Self::EMPTY
        }
    }

    /// `self \ other`, as 0, 1 or 2 ranges.
    ///
    /// When `other` lies strictly inside `self` the two results meet at
    /// `other`'s boundary points; neither is collapsed even if `other` is a
    /// single point.
    pub fn difference(&self, other: &Self) -> SmallVec<[Self; 2]> {
        if self.is_empty() {
            return smallvec![];
        }
        if other.is_empty() {
            return smallvec![*self];
        }

        let mut result = SmallVec::new();
        if self.min < other.min {
            result.push(Self {
                min: self.min,
                max: self.max.min(other.min),
            });
        }
        if self.max > other.max {
            result.push(Self {
                min: self.min.max(other.max),
                max: self.max,
            });
        }
        result
    }

    /// Merges `self` into a sorted list of disjoint ranges, coalescing any
    /// ranges that overlap or touch it. Keeps the list sorted by `min`.
    ///
    /// Idempotent: merging a range already contained in the list is a no-op.
    pub fn merge_into_array(self, ranges: &mut Vec<Self>) {
        if self.is_empty() {
            return;
        }

        let mut merged = self;
        let mut placed = false;
        let mut result = Vec::with_capacity(ranges.len() + 1);
        for range in ranges.drain(..) {
            if range.max < merged.min {
                result.push(range);
            } else if range.min > merged.max {
                if !placed {
                    result.push(merged);
                    placed = true;
                }
                result.push(range);
            } else {
                merged.min = merged.min.min(range.min);
                merged.max = merged.max.max(range.max);
            }
        }
        if !placed {
            result.push(merged);
        }
        *ranges = result;
    }
}

impl Default for RevisionRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("[∅]")
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

// --- Serialization ---

// JSON has no representation for the infinities, so infinite bounds are
// simply omitted: `{}` is the empty range, a missing `min` reads back as -∞
// and a missing `max` as +∞.

impl serde::Serialize for RevisionRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct as _;

        let mut state = serializer.serialize_struct("RevisionRange", 2)?;
        if !self.is_empty() && self.min.is_finite() {
            state.serialize_field("min", &self.min)?;
        } else {
            state.skip_field("min")?;
        }
        if !self.is_empty() && self.max.is_finite() {
            state.serialize_field("max", &self.max)?;
        } else {
            state.skip_field("max")?;
        }
        state.end()
    }
}

impl<'de> serde::Deserialize<'de> for RevisionRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Bounds {
            #[serde(default)]
            min: Option<f64>,
            #[serde(default)]
            max: Option<f64>,
        }

        let bounds = Bounds::deserialize(deserializer)?;
        Ok(match (bounds.min, bounds.max) {
            (None, None) => Self::EMPTY,
            (min, max) => Self {
                min: min.unwrap_or(f64::NEG_INFINITY),
                max: max.unwrap_or(f64::INFINITY),
            },
        })
    }
}

// ---
