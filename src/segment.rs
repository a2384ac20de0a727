//! Value segmentation: CLV deciles, RFM quintiles and campaign ROI
//!
//! All binning is equal-population over stable ranks: ties keep their input
//! order, so the same input always yields the same bin boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Number of CLV deciles
pub const DECILES: u8 = 10;

/// Number of bins per RFM dimension
pub const QUINTILES: u8 = 5;

/// RFM composite code of the lost cohort
pub const LOST_CODE: &str = "111";

/// A customer with a model prediction, ready for segmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCustomer {
    pub customer_id: i64,
    /// Predicted future value, never negative
    pub predicted_value: f64,
    /// Realised value, when known
    pub actual_value: Option<f64>,
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
    /// 1 (lowest predicted value) to 10 (highest)
    pub decile: Option<u8>,
    pub rfm: Option<RfmScore>,
}

impl ScoredCustomer {
    pub fn new(customer_id: i64, predicted_value: f64) -> Self {
        Self {
            customer_id,
            predicted_value: predicted_value.max(0.0),
            actual_value: None,
            recency: 0.0,
            frequency: 0.0,
            monetary: 0.0,
            decile: None,
            rfm: None,
        }
    }

    pub fn with_actual(mut self, actual: f64) -> Self {
        self.actual_value = Some(actual);
        self
    }

    pub fn with_rfm_features(mut self, recency: f64, frequency: f64, monetary: f64) -> Self {
        self.recency = recency;
        self.frequency = frequency;
        self.monetary = monetary;
        self
    }

    fn with_decile(mut self, decile: u8) -> Self {
        self.decile = Some(decile);
        self
    }

    fn with_rfm(mut self, rfm: RfmScore) -> Self {
        self.rfm = Some(rfm);
        self
    }
}

/// Equal-population bin (1..=q) for every value, ranked ascending.
///
/// Rank `r` (1-based) of `n` values lands in `max(1, ceil((r-1)*q/(n-1)))`;
/// a single value lands in bin 1.
pub fn equal_population_bins(values: &[f64], q: u8) -> Vec<u8> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut bins = vec![1u8; n];
    for (rank0, &idx) in order.iter().enumerate() {
        bins[idx] = rank_to_bin(rank0, n, q);
    }
    bins
}

fn rank_to_bin(rank0: usize, n: usize, q: u8) -> u8 {
    if n <= 1 || q <= 1 {
        return 1;
    }
    let q = usize::from(q);
    let bin = (rank0 * q).div_ceil(n - 1);
    bin.clamp(1, q) as u8
}

/// Bin cut-points frozen on a reference population.
///
/// A value takes the bin of the first reference value that is not below it;
/// values above the whole reference take the top bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileBinner {
    q: u8,
    sorted: Vec<f64>,
    bins: Vec<u8>,
}

impl QuantileBinner {
    pub fn fit(reference: &[f64], q: u8) -> Self {
        let mut sorted = reference.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let bins = (0..n).map(|rank0| rank_to_bin(rank0, n, q)).collect();
        Self { q, sorted, bins }
    }

    pub fn assign(&self, value: f64) -> u8 {
        if self.sorted.is_empty() {
            return 1;
        }
        let idx = self.sorted.partition_point(|v| v.total_cmp(&value).is_lt());
        self.bins.get(idx).copied().unwrap_or(self.q.max(1))
    }
}

/// Quintile scores; 5 is always the most valuable end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RfmScore {
    /// 5 = most recent
    pub recency: u8,
    /// 5 = most frequent
    pub frequency: u8,
    /// 5 = highest spend
    pub monetary: u8,
}

impl RfmScore {
    /// Concatenated digits, e.g. "545"
    pub fn code(&self) -> String {
        format!("{}{}{}", self.recency, self.frequency, self.monetary)
    }

    /// Lapsing customers with a strong purchase history
    pub fn is_at_risk(&self) -> bool {
        matches!(self.recency, 1 | 2) && (self.frequency >= 4 || self.monetary >= 4)
    }

    pub fn is_lost(&self) -> bool {
        self.code() == LOST_CODE
    }
}

/// Frozen RFM cut-points, fitted on a training population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmBinners {
    recency: QuantileBinner,
    frequency: QuantileBinner,
    monetary: QuantileBinner,
}

impl RfmBinners {
    pub fn fit(reference: &[ScoredCustomer]) -> Self {
        let column = |f: fn(&ScoredCustomer) -> f64| reference.iter().map(f).collect::<Vec<_>>();
        Self {
            recency: QuantileBinner::fit(&column(|c| c.recency), QUINTILES),
            frequency: QuantileBinner::fit(&column(|c| c.frequency), QUINTILES),
            monetary: QuantileBinner::fit(&column(|c| c.monetary), QUINTILES),
        }
    }

    pub fn score(&self, customer: &ScoredCustomer) -> RfmScore {
        RfmScore {
            recency: QUINTILES + 1 - self.recency.assign(customer.recency),
            frequency: self.frequency.assign(customer.frequency),
            monetary: self.monetary.assign(customer.monetary),
        }
    }
}

/// Per-decile profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecileProfile {
    pub decile: u8,
    pub customers: usize,
    pub mean_predicted: f64,
    /// `None` when no customer in the decile has a known actual value
    pub mean_actual: Option<f64>,
    pub mean_recency: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
}

/// Outcome of targeting the top decile with a retention campaign
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiSummary {
    pub targeted_count: usize,
    pub cost: f64,
    pub incremental_value: f64,
    pub profit: f64,
    pub roi_pct: f64,
}

/// Size and historical value of the at-risk and lost cohorts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub customers: usize,
    pub at_risk: usize,
    pub at_risk_share: f64,
    pub at_risk_monetary: f64,
    pub at_risk_monetary_share: f64,
    pub lost: usize,
    pub lost_monetary: f64,
    pub lost_monetary_share: f64,
}

/// Turns scored customers into deciles, RFM cohorts and ROI figures
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueSegmenter;

impl ValueSegmenter {
    pub fn new() -> Self {
        Self
    }

    /// Copy of `customers` with deciles of predicted value (10 = highest)
    pub fn assign_deciles(&self, customers: &[ScoredCustomer]) -> Vec<ScoredCustomer> {
        let predicted: Vec<f64> = customers.iter().map(|c| c.predicted_value).collect();
        let bins = equal_population_bins(&predicted, DECILES);
        customers
            .iter()
            .cloned()
            .zip(bins)
            .map(|(c, d)| c.with_decile(d))
            .collect()
    }

    /// Aggregate customers that carry a decile, ascending by decile
    pub fn decile_profile(&self, customers: &[ScoredCustomer]) -> Vec<DecileProfile> {
        let mut groups: BTreeMap<u8, Vec<&ScoredCustomer>> = BTreeMap::new();
        for c in customers {
            if let Some(d) = c.decile {
                groups.entry(d).or_default().push(c);
            }
        }

        groups
            .into_iter()
            .map(|(decile, members)| {
                let n = members.len() as f64;
                let mean =
                    |f: fn(&ScoredCustomer) -> f64| members.iter().map(|&c| f(c)).sum::<f64>() / n;
                let actuals: Vec<f64> = members.iter().filter_map(|c| c.actual_value).collect();
                DecileProfile {
                    decile,
                    customers: members.len(),
                    mean_predicted: mean(|c| c.predicted_value),
                    mean_actual: (!actuals.is_empty())
                        .then(|| actuals.iter().sum::<f64>() / actuals.len() as f64),
                    mean_recency: mean(|c| c.recency),
                    mean_frequency: mean(|c| c.frequency),
                    mean_monetary: mean(|c| c.monetary),
                }
            })
            .collect()
    }

    /// RFM quintiles ranked within `customers` themselves
    pub fn rfm_segments(&self, customers: &[ScoredCustomer]) -> Vec<ScoredCustomer> {
        let bins = |f: fn(&ScoredCustomer) -> f64| {
            let values: Vec<f64> = customers.iter().map(f).collect();
            equal_population_bins(&values, QUINTILES)
        };
        let (r, f, m) = (
            bins(|c| c.recency),
            bins(|c| c.frequency),
            bins(|c| c.monetary),
        );

        customers
            .iter()
            .enumerate()
            .map(|(i, c)| {
                c.clone().with_rfm(RfmScore {
                    recency: QUINTILES + 1 - r[i],
                    frequency: f[i],
                    monetary: m[i],
                })
            })
            .collect()
    }

    /// RFM scores with cut-points frozen on another population
    pub fn rfm_segments_with(
        &self,
        binners: &RfmBinners,
        customers: &[ScoredCustomer],
    ) -> Vec<ScoredCustomer> {
        customers
            .iter()
            .map(|c| c.clone().with_rfm(binners.score(c)))
            .collect()
    }

    /// Customers whose RFM score marks them at risk
    pub fn at_risk<'a>(&self, customers: &'a [ScoredCustomer]) -> Vec<&'a ScoredCustomer> {
        customers
            .iter()
            .filter(|c| c.rfm.is_some_and(|r| r.is_at_risk()))
            .collect()
    }

    /// Customers in the "111" cohort
    pub fn lost<'a>(&self, customers: &'a [ScoredCustomer]) -> Vec<&'a ScoredCustomer> {
        customers
            .iter()
            .filter(|c| c.rfm.is_some_and(|r| r.is_lost()))
            .collect()
    }

    pub fn risk_summary(&self, customers: &[ScoredCustomer]) -> RiskSummary {
        let at_risk = self.at_risk(customers);
        let total_monetary: f64 = customers.iter().map(|c| c.monetary).sum();
        let at_risk_monetary: f64 = at_risk.iter().map(|c| c.monetary).sum();
        let lost = self.lost(customers);
        let lost_monetary: f64 = lost.iter().map(|c| c.monetary).sum();
        let share = |part: f64, whole: f64| if whole != 0.0 { part / whole } else { 0.0 };

        let summary = RiskSummary {
            customers: customers.len(),
            at_risk: at_risk.len(),
            at_risk_share: share(at_risk.len() as f64, customers.len() as f64),
            at_risk_monetary,
            at_risk_monetary_share: share(at_risk_monetary, total_monetary),
            lost: lost.len(),
            lost_monetary,
            lost_monetary_share: share(lost_monetary, total_monetary),
        };
        info!(
            at_risk = summary.at_risk,
            lost = summary.lost,
            monetary_share = summary.at_risk_monetary_share,
            "Computed RFM risk cohorts"
        );
        summary
    }

    /// Simulate a campaign on decile 10.
    ///
    /// `roi_pct` is reported as 0 when the campaign costs nothing.
    pub fn simulate_roi(
        &self,
        customers: &[ScoredCustomer],
        cost_per_customer: f64,
        lift: f64,
    ) -> RoiSummary {
        let top: Vec<&ScoredCustomer> = customers
            .iter()
            .filter(|c| c.decile == Some(DECILES))
            .collect();

        let cost = top.len() as f64 * cost_per_customer;
        let incremental_value = top.iter().map(|c| c.predicted_value).sum::<f64>() * lift;
        let profit = incremental_value - cost;
        let roi_pct = if cost > 0.0 {
            profit / cost * 100.0
        } else {
            warn!(targeted = top.len(), "Campaign cost is zero; ROI reported as 0");
            0.0
        };

        RoiSummary {
            targeted_count: top.len(),
            cost,
            incremental_value,
            profit,
            roi_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn scored(values: &[f64]) -> Vec<ScoredCustomer> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| ScoredCustomer::new(i as i64 + 1, v))
            .collect()
    }

    #[rstest]
    #[case(10)]
    #[case(15)]
    #[case(23)]
    #[case(100)]
    #[case(101)]
    fn test_decile_sizes_differ_by_at_most_one(#[case] n: usize) {
        let values: Vec<f64> = (0..n).map(|i| ((i * 37) % 11) as f64).collect();
        let deciles = ValueSegmenter::new().assign_deciles(&scored(&values));

        let mut sizes = [0usize; 10];
        for c in &deciles {
            sizes[usize::from(c.decile.unwrap()) - 1] += 1;
        }
        let min = sizes.iter().min().unwrap();
        let max = sizes.iter().max().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
    }

    #[test]
    fn test_highest_mean_is_decile_ten() {
        let values: Vec<f64> = (0..50).map(|i| (i as f64 * 7.3) % 40.0).collect();
        let segmenter = ValueSegmenter::new();
        let profile = segmenter.decile_profile(&segmenter.assign_deciles(&scored(&values)));

        let best = profile
            .iter()
            .max_by(|a, b| a.mean_predicted.total_cmp(&b.mean_predicted))
            .unwrap();
        assert_eq!(best.decile, 10);
        assert_eq!(profile.len(), 10);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        // twenty identical predictions still spread over all deciles
        let deciles = ValueSegmenter::new().assign_deciles(&scored(&[0.0; 20]));
        let labels: Vec<u8> = deciles.iter().map(|c| c.decile.unwrap()).collect();
        assert_eq!(labels, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10]);
    }

    #[test]
    fn test_bin_formula_matches_small_populations() {
        assert_eq!(equal_population_bins(&[3.0], 10), vec![1]);
        assert_eq!(equal_population_bins(&[5.0, 1.0, 3.0], 10), vec![10, 1, 5]);
        assert_eq!(
            equal_population_bins(&[1.0, 2.0, 3.0, 4.0, 5.0], 5),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_frozen_binner_assigns_out_of_sample_values() {
        let binner = QuantileBinner::fit(&[10.0, 20.0, 30.0, 40.0, 50.0], 5);
        assert_eq!(binner.assign(5.0), 1);
        assert_eq!(binner.assign(30.0), 3);
        assert_eq!(binner.assign(31.0), 4);
        assert_eq!(binner.assign(500.0), 5);
    }

    #[test]
    fn test_rfm_scores_and_cohorts() {
        // recency, frequency, monetary
        let rows = [
            (300.0, 1.0, 10.0),  // stale, rare, small  -> 111
            (250.0, 9.0, 900.0), // stale, loyal        -> at risk
            (10.0, 5.0, 300.0),
            (20.0, 3.0, 200.0),
            (5.0, 8.0, 800.0),
        ];
        let customers: Vec<ScoredCustomer> = rows
            .iter()
            .enumerate()
            .map(|(i, &(r, f, m))| ScoredCustomer::new(i as i64, 0.0).with_rfm_features(r, f, m))
            .collect();

        let segmenter = ValueSegmenter::new();
        let scored = segmenter.rfm_segments(&customers);

        assert_eq!(scored[0].rfm.unwrap().code(), "111");
        assert_eq!(scored[1].rfm.unwrap().code(), "255");
        assert_eq!(scored[4].rfm.unwrap().recency, 5);

        let lost: Vec<i64> = segmenter.lost(&scored).iter().map(|c| c.customer_id).collect();
        let at_risk: Vec<i64> = segmenter.at_risk(&scored).iter().map(|c| c.customer_id).collect();
        assert_eq!(lost, vec![0]);
        // at-risk is evaluated on its own: it catches customer 1 which is not lost,
        // and does not contain the lost customer since F and M are low
        assert_eq!(at_risk, vec![1]);

        let summary = segmenter.risk_summary(&scored);
        assert_eq!(summary.at_risk, 1);
        assert_eq!(summary.lost, 1);
        assert_relative_eq!(summary.at_risk_share, 0.2);
        assert_relative_eq!(summary.at_risk_monetary_share, 900.0 / 2210.0);
        assert_relative_eq!(summary.lost_monetary, 10.0);
        assert_relative_eq!(summary.lost_monetary_share, 10.0 / 2210.0);
    }

    #[test]
    fn test_risk_summary_of_empty_population() {
        let summary = ValueSegmenter::new().risk_summary(&[]);
        assert_eq!(summary.customers, 0);
        assert_relative_eq!(summary.lost_monetary, 0.0);
        assert_relative_eq!(summary.lost_monetary_share, 0.0);
    }

    #[rstest]
    #[case(RfmScore { recency: 1, frequency: 4, monetary: 1 }, true)]
    #[case(RfmScore { recency: 2, frequency: 1, monetary: 5 }, true)]
    #[case(RfmScore { recency: 3, frequency: 5, monetary: 5 }, false)]
    #[case(RfmScore { recency: 1, frequency: 3, monetary: 3 }, false)]
    fn test_at_risk_predicate(#[case] score: RfmScore, #[case] expected: bool) {
        assert_eq!(score.is_at_risk(), expected);
    }

    #[test]
    fn test_roi_on_top_decile() {
        let values: Vec<f64> = (1..=20).map(|i| i as f64 * 10.0).collect();
        let segmenter = ValueSegmenter::new();
        let deciles = segmenter.assign_deciles(&scored(&values));

        let roi = segmenter.simulate_roi(&deciles, 2.0, 0.15);
        assert_eq!(roi.targeted_count, 2);
        assert_relative_eq!(roi.cost, 4.0);
        assert_relative_eq!(roi.incremental_value, (190.0 + 200.0) * 0.15);
        assert_relative_eq!(roi.profit, 58.5 - 4.0);
        assert_relative_eq!(roi.roi_pct, (58.5 - 4.0) / 4.0 * 100.0);
    }

    #[test]
    fn test_roi_with_zero_cost() {
        let segmenter = ValueSegmenter::new();
        let deciles = segmenter.assign_deciles(&scored(&[1.0, 2.0]));
        let roi = segmenter.simulate_roi(&deciles, 0.0, 0.15);
        assert_relative_eq!(roi.roi_pct, 0.0);
    }
}
