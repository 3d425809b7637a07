use itertools::Itertools;
use log::debug;
use nalgebra::DMatrix;

use crate::{
    observation::SingleDifference,
    prelude::{Error, SV},
};

/// [SatelliteSet] is the ordered set of satellites the estimation
/// currently runs on. The first element is the differencing reference
/// (pivot), the remaining members follow in ascending PRN order and
/// define the double difference state ordering: state index `i` maps
/// to the i-th non reference member.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteSet {
    inner: Vec<SV>,
}

/// Classification of one epoch's satellite set against the previous
/// one, as returned by [SatelliteSet::diff]. Purely descriptive: the
/// manager applies it to the filter and the hypothesis pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDiff {
    /// Previous pivot.
    pub old_reference: SV,

    /// New pivot.
    pub new_reference: SV,

    /// True when the pivot changed, which requires re-expressing
    /// every retained ambiguity.
    pub reference_changed: bool,

    /// Previous non reference satellites still in sight.
    pub kept: Vec<SV>,

    /// Previous non reference satellites that went out of sight.
    pub dropped: Vec<SV>,

    /// Satellites in sight now that were absent last epoch.
    pub added: Vec<SV>,

    /// True when the previous pivot itself went out of sight.
    pub reference_dropped: bool,
}

impl SetDiff {
    /// True when nothing changed and both filter and pool carry over.
    pub fn is_noop(&self) -> bool {
        !self.reference_changed && self.dropped.is_empty() && self.added.is_empty()
    }

    /// True when the set membership itself changed (not only the pivot).
    pub fn membership_changed(&self) -> bool {
        !self.dropped.is_empty() || !self.added.is_empty() || self.reference_dropped
    }
}

impl SatelliteSet {
    /// Builds the epoch's [SatelliteSet] from the proposed single
    /// differences. The previous pivot is retained whenever still in
    /// sight (minimizes state churn); otherwise the highest satellite
    /// wins, ties broken by lowest PRN. At least 2 satellites are
    /// required to form any double difference.
    pub fn select(
        previous: Option<&Self>,
        sdiffs: &[SingleDifference],
    ) -> Result<Self, Error> {
        if sdiffs.len() < 2 {
            return Err(Error::InsufficientSatellites {
                required: 2,
                found: sdiffs.len(),
            });
        }

        let reference = previous
            .map(|prev| prev.reference())
            .filter(|sv| sdiffs.iter().any(|sd| sd.sv == *sv))
            .unwrap_or_else(|| Self::best_reference(sdiffs));

        let mut inner = Vec::with_capacity(sdiffs.len());
        inner.push(reference);

        inner.extend(
            sdiffs
                .iter()
                .map(|sd| sd.sv)
                .filter(|sv| *sv != reference)
                .sorted_by_key(|sv| sv.prn)
                .dedup(),
        );

        Ok(Self { inner })
    }

    /// Highest satellite in sight, ties broken by lowest PRN.
    /// Satellites with unknown elevation rank below any with one.
    fn best_reference(sdiffs: &[SingleDifference]) -> SV {
        let mut best = &sdiffs[0];
        for sd in sdiffs.iter().skip(1) {
            let best_elev = best.elevation_deg.unwrap_or(-90.0);
            let elev = sd.elevation_deg.unwrap_or(-90.0);
            if elev > best_elev || (elev == best_elev && sd.sv.prn < best.sv.prn) {
                best = sd;
            }
        }
        best.sv
    }

    /// Current pivot.
    pub fn reference(&self) -> SV {
        self.inner[0]
    }

    /// Total number of satellites (pivot included).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Double difference state dimension: one per non reference member.
    pub fn num_dd(&self) -> usize {
        self.inner.len() - 1
    }

    pub fn contains(&self, sv: SV) -> bool {
        self.inner.contains(&sv)
    }

    /// All members, pivot first.
    pub fn iter(&self) -> impl Iterator<Item = SV> + '_ {
        self.inner.iter().copied()
    }

    /// Non reference members, in state order.
    pub fn dd_sats(&self) -> impl Iterator<Item = SV> + '_ {
        self.inner.iter().skip(1).copied()
    }

    /// State index of this non reference satellite, if any.
    pub fn dd_index(&self, sv: SV) -> Option<usize> {
        self.inner.iter().skip(1).position(|s| *s == sv)
    }

    /// Classifies `new` against self: who stayed, who left, who rose,
    /// and whether the pivot moved. Does not mutate anything.
    pub fn diff(&self, new: &Self) -> SetDiff {
        let diff = SetDiff {
            old_reference: self.reference(),
            new_reference: new.reference(),
            reference_changed: self.reference() != new.reference(),
            reference_dropped: !new.contains(self.reference()),
            kept: self.dd_sats().filter(|sv| new.contains(*sv)).collect(),
            dropped: self.dd_sats().filter(|sv| !new.contains(*sv)).collect(),
            added: new.iter().filter(|sv| !self.contains(*sv)).collect(),
        };

        if !diff.is_noop() {
            debug!(
                "set change: ref {} -> {}, dropped {:?}, added {:?}",
                diff.old_reference, diff.new_reference, diff.dropped, diff.added
            );
        }

        diff
    }

    /// Linear map from this set's double difference basis onto `new`'s.
    /// Returns the (possibly rectangular) row difference operator and
    /// the new state indexes that have no counterpart in self and must
    /// be seeded fresh. When the new pivot was never a member of self,
    /// no retained ambiguity can be re-expressed and every index comes
    /// back fresh.
    pub fn dd_transform(&self, new: &Self) -> (DMatrix<f64>, Vec<usize>) {
        let (n_old, n_new) = (self.num_dd(), new.num_dd());
        let mut mapping = DMatrix::<f64>::zeros(n_new, n_old);
        let mut fresh = Vec::new();

        let new_ref = new.reference();

        if new_ref == self.reference() {
            for (k, sv) in new.dd_sats().enumerate() {
                match self.dd_index(sv) {
                    Some(j) => mapping[(k, j)] = 1.0,
                    None => fresh.push(k),
                }
            }
        } else if let Some(pivot) = self.dd_index(new_ref) {
            for (k, sv) in new.dd_sats().enumerate() {
                if sv == self.reference() {
                    mapping[(k, pivot)] = -1.0;
                } else if let Some(j) = self.dd_index(sv) {
                    mapping[(k, j)] = 1.0;
                    mapping[(k, pivot)] -= 1.0;
                } else {
                    fresh.push(k);
                }
            }
        } else {
            fresh = (0..n_new).collect();
        }

        (mapping, fresh)
    }
}

impl std::fmt::Display for SatelliteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ref={} [{}]",
            self.reference(),
            self.dd_sats().map(|sv| sv.to_string()).join(", ")
        )
    }
}
