use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::identity::columns;
use crate::planner::PlannedSlice;
use crate::slice::TimeseriesSlice;

// ---

/// The in-flight face of one live request: enough for other requests against
/// the same store to find and borrow its slices.
pub struct RequestState {
    store_name: String,
    statistic: String,

    /// Empty until planning completes; peers looking earlier simply find
    /// nothing to borrow.
    slices: Mutex<Vec<Arc<TimeseriesSlice>>>,
}

impl RequestState {
    pub fn new(store_name: impl Into<String>, statistic: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store_name: store_name.into(),
            statistic: statistic.into(),
            slices: Mutex::new(Vec::new()),
        })
    }

    pub fn set_slices(&self, slices: Vec<Arc<TimeseriesSlice>>) {
        *self.slices.lock() = slices;
    }

    pub fn slices(&self) -> Vec<Arc<TimeseriesSlice>> {
        self.slices.lock().clone()
    }
}

// ---

/// Registry of live requests, keyed by persistent store name. Holds weak
/// references only: a request that finishes (or is abandoned) mid-coalesce
/// disappears on the next lookup, while any slice already borrowed from it
/// stays usable through its own `Arc`.
#[derive(Default)]
pub struct InflightRegistry {
    requests: Mutex<ahash::HashMap<String, Vec<Weak<RequestState>>>>,
}

/// Deregisters its request when dropped.
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    state: Arc<RequestState>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.state);
    }
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, state: Arc<RequestState>) -> InflightGuard {
        self.requests
            .lock()
            .entry(state.store_name.clone())
            .or_default()
            .push(Arc::downgrade(&state));
        InflightGuard {
            registry: Arc::clone(self),
            state,
        }
    }

    fn deregister(&self, state: &Arc<RequestState>) {
        let mut requests = self.requests.lock();
        if let Some(live) = requests.get_mut(&state.store_name) {
            live.retain(|entry| {
                entry
                    .upgrade()
                    .is_some_and(|peer| !Arc::ptr_eq(&peer, state))
            });
            if live.is_empty() {
                requests.remove(&state.store_name);
            }
        }
    }

    /// Other live requests against the same store.
    fn peers(&self, state: &Arc<RequestState>) -> Vec<Arc<RequestState>> {
        let requests = self.requests.lock();
        requests
            .get(&state.store_name)
            .map(|live| {
                live.iter()
                    .filter_map(Weak::upgrade)
                    .filter(|peer| !Arc::ptr_eq(peer, state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Prunes `planned` against the slices of every matching live peer.
    ///
    /// A peer slice whose range covers a planned slice takes over the columns
    /// both carry; a peer slice fetching the same columns for part of the
    /// range shrinks the planned slice to the uncovered gap. Either way the
    /// peer slice joins the returned **borrowed** set,
    /// whose responses the request consumes alongside its own. Planned slices
    /// reduced to bare `revision` are dropped.
    pub fn coalesce(
        &self,
        state: &Arc<RequestState>,
        planned: Vec<PlannedSlice>,
    ) -> (Vec<PlannedSlice>, Vec<Arc<TimeseriesSlice>>) {
        let peer_slices: Vec<Arc<TimeseriesSlice>> = self
            .peers(state)
            .iter()
            .flat_map(|peer| peer.slices())
            .filter(|slice| slice.statistic == state.statistic)
            .collect();

        let mut borrowed: Vec<Arc<TimeseriesSlice>> = Vec::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<PlannedSlice> = planned.into();

        'queue: while let Some(mut slice) = queue.pop_front() {
            for peer_slice in &peer_slices {
                let shared: Vec<String> = slice
                    .columns
                    .iter()
                    .filter(|column| {
                        *column != columns::REVISION && peer_slice.columns.contains(*column)
                    })
                    .cloned()
                    .collect();
                if shared.is_empty() {
                    continue;
                }

                let overlap = peer_slice.revision_range.intersection(&slice.revision_range);
                if overlap.is_empty() {
                    continue;
                }

                if overlap.duration() >= slice.revision_range.duration() {
                    // The peer fetch spans this slice entirely: the shared
                    // columns come from the peer instead.
                    for column in &shared {
                        slice.columns.remove(column);
                    }
                    borrow(&mut borrowed, peer_slice);
                    log::debug!(
                        "borrowing covering slice {} from peer, {} columns left",
                        peer_slice.revision_range,
                        slice.columns.len()
                    );
                    if slice.columns.iter().all(|column| column == columns::REVISION) {
                        continue 'queue;
                    }
                } else if overlap.duration() > 0.0 && slice.columns == peer_slice.columns {
                    // The peer fetches exactly the same columns for part of
                    // the range: fetch only the uncovered gap. A bare
                    // boundary-point overlap is not worth borrowing (and
                    // subtracting it would leave the slice unchanged).
                    for gap in slice.revision_range.difference(&peer_slice.revision_range) {
                        queue.push_back(PlannedSlice {
                            revision_range: gap,
                            columns: slice.columns.clone(),
                        });
                    }
                    borrow(&mut borrowed, peer_slice);
                    log::debug!(
                        "borrowing overlapping slice {} from peer",
                        peer_slice.revision_range
                    );
                    continue 'queue;
                }
            }
            result.push(slice);
        }

        (result, borrowed)
    }
}

fn borrow(borrowed: &mut Vec<Arc<TimeseriesSlice>>, slice: &Arc<TimeseriesSlice>) {
    if !borrowed.iter().any(|existing| Arc::ptr_eq(existing, slice)) {
        borrowed.push(Arc::clone(slice));
    }
}

// ---
