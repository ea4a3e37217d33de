//! Move cost model.
//!
//! Each relocation costs the value of its replica's move-cost class and a
//! primary/secondary swap costs `swap_cost`. The total cost of a
//! candidate solution inflates its score so that, between two equally
//! balanced solutions, the cheaper one wins.

use plb_core::PlbConfig;
use plb_state::MoveCostClass;

#[derive(Debug, Clone, PartialEq)]
pub struct MoveCostModel {
    pub zero: f64,
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub swap: f64,
    pub offset: f64,
    pub ignore_in_scoring: bool,
}

impl MoveCostModel {
    pub fn from_config(config: &PlbConfig) -> Self {
        Self {
            zero: config.move_cost_zero,
            low: config.move_cost_low,
            medium: config.move_cost_medium,
            high: config.move_cost_high,
            swap: config.swap_cost,
            offset: config.move_cost_offset,
            ignore_in_scoring: config.ignore_cost_in_scoring,
        }
    }

    pub fn value(&self, class: MoveCostClass) -> f64 {
        match class {
            MoveCostClass::Zero => self.zero,
            MoveCostClass::Low => self.low,
            MoveCostClass::Medium => self.medium,
            MoveCostClass::High => self.high,
        }
    }

    /// Energy of a solution with the given score and accumulated cost.
    pub fn energy(&self, score: f64, total_cost: f64) -> f64 {
        if self.ignore_in_scoring {
            score
        } else {
            score * (1.0 + total_cost / self.offset)
        }
    }
}

impl Default for MoveCostModel {
    fn default() -> Self {
        Self::from_config(&PlbConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_values_follow_config() {
        let model = MoveCostModel::default();
        assert_eq!(model.value(MoveCostClass::Zero), 0.0);
        assert_eq!(model.value(MoveCostClass::Low), 1.0);
        assert_eq!(model.value(MoveCostClass::Medium), 15.0);
        assert_eq!(model.value(MoveCostClass::High), 40.0);
    }

    #[test]
    fn cost_inflates_energy_unless_ignored() {
        let mut model = MoveCostModel::default();
        assert!((model.energy(0.5, 100.0) - 0.55).abs() < 1e-12);
        model.ignore_in_scoring = true;
        assert_eq!(model.energy(0.5, 100.0), 0.5);
    }
}
