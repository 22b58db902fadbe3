use serde::{Deserialize, Serialize};

use crate::request::AnalysisRequest;

/// One named, weighted phase of the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub weight: u8,
}

/// Ordered stages of one task. Weights always sum to 100.
///
/// Steps are 1-based: step `k` means stages `1..=k` have been reached, so
/// `cumulative(0) == 0` and `cumulative(len) == 100`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTable {
    stages: Vec<Stage>,
}

impl StageTable {
    pub fn for_request(request: &AnalysisRequest) -> Self {
        let depth = u32::from(request.research_depth.max(1));

        let mut raw: Vec<(String, u32)> = Vec::with_capacity(request.analysts.len() + 5);
        raw.push(("initialization".to_string(), 2));
        for analyst in &request.analysts {
            raw.push((format!("analyst:{analyst}"), 4));
        }
        raw.push(("research debate".to_string(), 2 * depth));
        raw.push(("trader decision".to_string(), 2));
        raw.push(("risk assessment".to_string(), depth + 1));
        raw.push(("finalization".to_string(), 1));

        Self::from_units(raw)
    }

    /// Scale raw units to integer weights summing to exactly 100 using the
    /// largest-remainder method; ties go to the earlier stage.
    pub fn from_units(raw: Vec<(String, u32)>) -> Self {
        let total: u64 = raw.iter().map(|(_, u)| u64::from(*u)).sum();
        if raw.is_empty() || total == 0 {
            return Self { stages: Vec::new() };
        }

        let mut weights: Vec<u64> = Vec::with_capacity(raw.len());
        let mut remainders: Vec<(usize, u64)> = Vec::with_capacity(raw.len());
        for (idx, (_, units)) in raw.iter().enumerate() {
            let scaled = u64::from(*units) * 100;
            weights.push(scaled / total);
            remainders.push((idx, scaled % total));
        }

        let assigned: u64 = weights.iter().sum();
        let missing = 100u64.saturating_sub(assigned) as usize;
        remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (idx, _) in remainders.into_iter().take(missing) {
            weights[idx] += 1;
        }

        let stages = raw
            .into_iter()
            .zip(weights)
            .map(|((name, _), weight)| Stage {
                name,
                weight: weight.min(100) as u8,
            })
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Percent reached once stages `1..=step` are entered.
    pub fn cumulative(&self, step: u32) -> u8 {
        let take = (step as usize).min(self.stages.len());
        let sum: u32 = self.stages[..take]
            .iter()
            .map(|s| u32::from(s.weight))
            .sum();
        sum.min(100) as u8
    }

    /// 1-based step number of the stage called `name`.
    pub fn step_of(&self, name: &str) -> Option<u32> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .map(|idx| idx as u32 + 1)
    }

    pub fn stage_name(&self, step: u32) -> Option<&str> {
        let idx = (step as usize).checked_sub(1)?;
        self.stages.get(idx).map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Analyst;

    fn request(analysts: Vec<Analyst>, depth: u8) -> AnalysisRequest {
        AnalysisRequest::new("AAPL", "2024-01-15", analysts, depth)
    }

    #[test]
    fn weights_sum_to_100_for_every_configuration() {
        for depth in 1..=5 {
            for n in 1..=Analyst::ALL.len() {
                let table = StageTable::for_request(&request(Analyst::ALL[..n].to_vec(), depth));
                let sum: u32 = table.stages().iter().map(|s| u32::from(s.weight)).sum();
                assert_eq!(sum, 100, "depth={depth} analysts={n}");
                assert_eq!(table.len(), n + 5);
                assert_eq!(table.cumulative(table.len() as u32), 100);
            }
        }
    }

    #[test]
    fn two_analysts_depth_three_layout() {
        let table = StageTable::for_request(&request(
            vec![Analyst::Market, Analyst::Fundamentals],
            3,
        ));
        let weights: Vec<u8> = table.stages().iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![9, 18, 17, 26, 9, 17, 4]);
        assert_eq!(table.stage_name(2), Some("analyst:market"));
        assert_eq!(table.step_of("trader decision"), Some(5));
    }

    #[test]
    fn cumulative_is_monotonic_and_clamped() {
        let table = StageTable::for_request(&request(vec![Analyst::News], 2));
        assert_eq!(table.cumulative(0), 0);
        let mut prev = 0;
        for step in 1..=table.len() as u32 {
            let cur = table.cumulative(step);
            assert!(cur >= prev);
            prev = cur;
        }
        assert_eq!(table.cumulative(999), 100);
        assert_eq!(table.stage_name(0), None);
    }

    #[test]
    fn empty_units_produce_empty_table() {
        let table = StageTable::from_units(Vec::new());
        assert!(table.is_empty());
        assert_eq!(table.cumulative(3), 0);
    }
}
