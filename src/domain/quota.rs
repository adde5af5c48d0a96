//! Per-year sampling quotas used by the export.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::domain::errors::TaskError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearQuota {
    pub id: i64,
    pub start_year: i32,
    pub end_year: i32,
    /// Share of the stock this quota stands for. Carried into the export rows.
    pub stock_ratio: f64,
    pub sample_num: u32,
}

impl YearQuota {
    pub const fn years(&self) -> RangeInclusive<i32> {
        self.start_year..=self.end_year
    }

    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start_year <= other.end_year && other.start_year <= self.end_year
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewYearQuota {
    pub start_year: i32,
    pub end_year: i32,
    pub stock_ratio: f64,
    pub sample_num: u32,
}

impl NewYearQuota {
    pub fn validate(&self) -> Result<(), TaskError> {
        validate_fields(self.start_year, self.end_year, self.stock_ratio, self.sample_num)
    }
}

fn validate_fields(start_year: i32, end_year: i32, stock_ratio: f64, sample_num: u32) -> Result<(), TaskError> {
    if start_year > end_year {
        return Err(TaskError::precondition(format!(
            "quota start year {start_year} is after end year {end_year}"
        )));
    }
    if sample_num == 0 {
        return Err(TaskError::precondition("quota sample_num must be greater than zero"));
    }
    if !(0.0..=1.0).contains(&stock_ratio) {
        return Err(TaskError::precondition(format!(
            "quota stock_ratio {stock_ratio} must be within [0, 1]"
        )));
    }
    Ok(())
}

/// Checks every quota and rejects overlapping year ranges.
pub fn validate_quotas(quotas: &[YearQuota]) -> Result<(), TaskError> {
    for quota in quotas {
        validate_fields(quota.start_year, quota.end_year, quota.stock_ratio, quota.sample_num)?;
    }
    let mut sorted: Vec<&YearQuota> = quotas.iter().collect();
    sorted.sort_by_key(|q| (q.start_year, q.end_year));
    for pair in sorted.windows(2) {
        if pair[0].overlaps(pair[1]) {
            return Err(TaskError::precondition(format!(
                "quota {} ({}-{}) overlaps quota {} ({}-{})",
                pair[0].id, pair[0].start_year, pair[0].end_year, pair[1].id, pair[1].start_year, pair[1].end_year
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(id: i64, start_year: i32, end_year: i32) -> YearQuota {
        YearQuota {
            id,
            start_year,
            end_year,
            stock_ratio: 0.5,
            sample_num: 2,
        }
    }

    #[test]
    fn disjoint_quotas_pass() {
        assert!(validate_quotas(&[quota(1, 2015, 2017), quota(2, 2018, 2020), quota(3, 2010, 2010)]).is_ok());
        assert!(validate_quotas(&[]).is_ok());
    }

    #[test]
    fn overlapping_quotas_are_rejected() {
        let err = validate_quotas(&[quota(1, 2018, 2020), quota(2, 2020, 2022)]).unwrap_err();
        assert!(matches!(err, TaskError::PreconditionFailed(_)));
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(validate_quotas(&[quota(1, 2021, 2020)]).is_err());
    }

    #[test]
    fn new_quota_field_checks() {
        let ok = NewYearQuota {
            start_year: 2020,
            end_year: 2021,
            stock_ratio: 1.0,
            sample_num: 2,
        };
        assert!(ok.validate().is_ok());
        assert!(NewYearQuota { sample_num: 0, ..ok.clone() }.validate().is_err());
        assert!(NewYearQuota { stock_ratio: 1.5, ..ok }.validate().is_err());
    }

    #[test]
    fn years_cover_both_ends() {
        assert_eq!(quota(1, 2020, 2022).years().collect::<Vec<_>>(), vec![2020, 2021, 2022]);
    }
}
