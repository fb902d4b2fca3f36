//! Standard and conservative completeness scores over one deduction ledger.
//!
//! Both scores start at the same fixed baseline and lose the deductions of
//! the *latest* record per section. The ledger is append-only; superseding a
//! section means appending a newer record for it.
//!
//! Invariants are checked at write time:
//! - deductions are never negative, so clearing a section can only raise a score;
//! - a record's conservative deduction is at least its standard deduction, so
//!   the conservative total never exceeds the standard total.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Points, ScoreInvariantError, SectionCode};

/// One deduction entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionRecord {
    /// Position in the ledger, starting at zero.
    pub sequence: u64,
    /// Section the deduction applies to.
    pub section: SectionCode,
    /// Points deducted from the standard score.
    pub standard_delta: Points,
    /// Points deducted from the conservative score.
    pub conservative_delta: Points,
    /// Why the deduction applies.
    pub rationale: String,
}

/// Both running totals at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreTotals {
    /// Standard score.
    pub standard: Points,
    /// Conservative score.
    pub conservative: Points,
}

impl ScoreTotals {
    /// `|standard - conservative|`.
    pub fn variance(self) -> Points {
        self.standard.abs_diff(self.conservative)
    }
}

/// Variance compared against the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarianceCheck {
    /// Totals the variance was computed from.
    pub totals: ScoreTotals,
    /// `|standard - conservative|`.
    pub variance: Points,
    /// Maximum allowed variance.
    pub threshold: Points,
}

impl VarianceCheck {
    /// Compares `totals` against `threshold`.
    pub fn new(totals: ScoreTotals, threshold: Points) -> Self {
        Self {
            totals,
            variance: totals.variance(),
            threshold,
        }
    }

    /// Returns `true` if the variance is above the threshold.
    pub fn exceeded(&self) -> bool {
        self.variance > self.threshold
    }
}

/// Append-only deduction log with a fixed maximum baseline.
///
/// Totals are recomputed with checked arithmetic on every insert and cached,
/// so a ledger whose sums would overflow can never be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreLedger {
    baseline: Points,
    records: Vec<DeductionRecord>,
    totals: ScoreTotals,
}

impl ScoreLedger {
    /// Creates an empty ledger; both scores start at `baseline`.
    pub fn new(baseline: Points) -> Self {
        Self {
            baseline,
            records: Vec::new(),
            totals: ScoreTotals {
                standard: baseline,
                conservative: baseline,
            },
        }
    }

    /// Fixed maximum both scores are measured against.
    pub fn baseline(&self) -> Points {
        self.baseline
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[DeductionRecord] {
        &self.records
    }

    /// Appends a deduction, superseding any earlier record for `section`.
    ///
    /// Fails with [`ScoreInvariantError`] if a delta is negative, if the
    /// conservative delta is smaller than the standard one, if the resulting
    /// conservative total would exceed the standard total, or if the totals
    /// would overflow. The ledger is unchanged on failure.
    pub fn record_deduction(
        &mut self,
        section: SectionCode,
        standard_delta: Points,
        conservative_delta: Points,
        rationale: impl Into<String>,
    ) -> Result<&DeductionRecord, ScoreInvariantError> {
        let record = DeductionRecord {
            sequence: self.records.len() as u64,
            section,
            standard_delta,
            conservative_delta,
            rationale: rationale.into(),
        };
        let Some(projected) = totals_of(self.baseline, self.records.iter().chain([&record])) else {
            return Err(ScoreInvariantError {
                section: record.section.to_string(),
                message: "score totals out of range".to_string(),
                standard: self.totals.standard,
                conservative: self.totals.conservative,
            });
        };
        let violation = |message: &str| ScoreInvariantError {
            section: record.section.to_string(),
            message: message.to_string(),
            standard: projected.standard,
            conservative: projected.conservative,
        };

        if standard_delta.is_negative() || conservative_delta.is_negative() {
            return Err(violation("deductions must not be negative"));
        }
        if conservative_delta < standard_delta {
            return Err(violation(
                "conservative deduction is smaller than standard deduction",
            ));
        }
        if projected.conservative > projected.standard {
            return Err(violation("conservative score exceeds standard score"));
        }

        debug!(
            section = %record.section,
            standard = %standard_delta,
            conservative = %conservative_delta,
            "deduction recorded"
        );
        let index = self.records.len();
        self.records.push(record);
        self.totals = projected;
        Ok(&self.records[index])
    }

    /// Sums the latest record per section against the baseline.
    pub fn current_totals(&self) -> ScoreTotals {
        self.totals
    }

    /// `|standard - conservative|` of the current totals.
    pub fn variance(&self) -> Points {
        self.current_totals().variance()
    }

    /// Active (latest) record per section, ordered by section code.
    pub fn active(&self) -> BTreeMap<&SectionCode, &DeductionRecord> {
        latest_per_section(self.records.iter())
    }
}

fn latest_per_section<'a>(
    records: impl Iterator<Item = &'a DeductionRecord>,
) -> BTreeMap<&'a SectionCode, &'a DeductionRecord> {
    let mut active = BTreeMap::new();
    for r in records {
        active.insert(&r.section, r);
    }
    active
}

/// `None` if any sum overflows.
fn totals_of<'a>(
    baseline: Points,
    records: impl Iterator<Item = &'a DeductionRecord>,
) -> Option<ScoreTotals> {
    let active = latest_per_section(records);
    let mut standard = Points::ZERO;
    let mut conservative = Points::ZERO;
    for record in active.values() {
        standard = standard.checked_add(record.standard_delta)?;
        conservative = conservative.checked_add(record.conservative_delta)?;
    }
    Some(ScoreTotals {
        standard: baseline.checked_sub(standard)?,
        conservative: baseline.checked_sub(conservative)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(s: &str) -> SectionCode {
        SectionCode::new(s).unwrap()
    }

    #[test]
    fn totals_use_latest_record_per_section() {
        let mut ledger = ScoreLedger::new(Points::whole(500));
        ledger
            .record_deduction(section("A"), Points::whole(4), Points::whole(6), "first pass")
            .unwrap();
        ledger
            .record_deduction(section("B"), Points::whole(3), Points::whole(7), "partial")
            .unwrap();
        ledger
            .record_deduction(section("A"), Points::whole(2), Points::whole(2), "fixed")
            .unwrap();

        let totals = ledger.current_totals();
        assert_eq!(totals.standard, Points::whole(495));
        assert_eq!(totals.conservative, Points::whole(491));
        assert_eq!(ledger.variance(), Points::whole(4));
        assert_eq!(ledger.records().len(), 3);
        assert_eq!(ledger.active().len(), 2);
    }

    #[test]
    fn variance_above_threshold_is_flagged() {
        let mut ledger = ScoreLedger::new(Points::whole(500));
        ledger
            .record_deduction(section("C"), Points::whole(7), Points::whole(13), "borderline items")
            .unwrap();
        let check = VarianceCheck::new(ledger.current_totals(), Points::whole(5));
        assert_eq!(check.totals.standard, Points::whole(493));
        assert_eq!(check.totals.conservative, Points::whole(487));
        assert_eq!(check.variance, Points::whole(6));
        assert!(check.exceeded());
        assert!(!VarianceCheck::new(ledger.current_totals(), Points::whole(6)).exceeded());
    }

    #[test]
    fn conservative_credit_beyond_standard_is_rejected() {
        let mut ledger = ScoreLedger::new(Points::whole(500));
        let err = ledger
            .record_deduction(section("D"), Points::whole(5), Points::whole(2), "lenient")
            .unwrap_err();
        assert_eq!(err.section, "D");
        assert!(ledger.records().is_empty(), "ledger unchanged on failure");
    }

    #[test]
    fn negative_deductions_are_rejected() {
        let mut ledger = ScoreLedger::new(Points::whole(500));
        let err = ledger
            .record_deduction(section("E"), Points::whole(-1), Points::whole(0), "bonus")
            .unwrap_err();
        assert!(err.message.contains("negative"));
    }

    #[test]
    fn clearing_a_section_never_lowers_either_score() {
        let mut ledger = ScoreLedger::new(Points::whole(500));
        ledger
            .record_deduction(section("A"), Points::whole(3), Points::whole(8), "gap")
            .unwrap();
        let before = ledger.current_totals();
        ledger
            .record_deduction(section("A"), Points::ZERO, Points::ZERO, "gap closed")
            .unwrap();
        let after = ledger.current_totals();
        assert!(after.standard >= before.standard);
        assert!(after.conservative >= before.conservative);
        assert_eq!(after.variance(), Points::ZERO);
    }

    #[test]
    fn overflowing_totals_are_rejected() {
        let huge = Points::from_f64(1e13).unwrap();
        let records: Vec<DeductionRecord> = (0..10_000u64)
            .map(|i| DeductionRecord {
                sequence: i,
                section: section(&format!("S{i}")),
                standard_delta: huge,
                conservative_delta: huge,
                rationale: "bulk".into(),
            })
            .collect();
        assert!(totals_of(Points::whole(500), records.iter()).is_none());

        let mut ledger = ScoreLedger::new(Points::whole(500));
        ledger.records = records[..9_000].to_vec();
        ledger.totals = totals_of(ledger.baseline, ledger.records.iter()).unwrap();
        let before = ledger.current_totals();

        let mut err = None;
        for i in 9_000..10_000 {
            if let Err(e) = ledger.record_deduction(section(&format!("S{i}")), huge, huge, "bulk") {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err.unwrap().message, "score totals out of range");
        assert!(ledger.current_totals().standard < before.standard);
        assert!(ledger.records().len() < 10_000);
    }
}
