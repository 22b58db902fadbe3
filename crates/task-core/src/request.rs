use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Deepest research level accepted by the analysis pipeline.
pub const MAX_RESEARCH_DEPTH: u8 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("stock symbol must not be empty")]
    EmptySymbol,
    #[error("at least one analyst must be selected")]
    NoAnalysts,
    #[error("invalid analysis date {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("unknown analyst {0:?}")]
    UnknownAnalyst(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Analyst {
    Market,
    Social,
    News,
    Fundamentals,
}

impl Analyst {
    pub const ALL: [Analyst; 4] = [
        Analyst::Market,
        Analyst::Social,
        Analyst::News,
        Analyst::Fundamentals,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Analyst::Market => "market",
            Analyst::Social => "social",
            Analyst::News => "news",
            Analyst::Fundamentals => "fundamentals",
        }
    }
}

impl fmt::Display for Analyst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Analyst {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Analyst::ALL
            .into_iter()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| RequestError::UnknownAnalyst(s.to_string()))
    }
}

/// LLM provider and model selection forwarded to the analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub llm_provider: String,
    #[serde(default = "default_deep_model")]
    pub deep_think_llm: String,
    #[serde(default = "default_quick_model")]
    pub quick_think_llm: String,
}

fn default_provider() -> String {
    "dashscope".to_string()
}

fn default_deep_model() -> String {
    "qwen-plus".to_string()
}

fn default_quick_model() -> String {
    "qwen-turbo".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            llm_provider: default_provider(),
            deep_think_llm: default_deep_model(),
            quick_think_llm: default_quick_model(),
        }
    }
}

/// The inputs of one analysis run, retained with the task so results can be
/// re-formatted later without calling the engine again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub analysis_date: String,
    pub analysts: Vec<Analyst>,
    pub research_depth: u8,
    #[serde(default)]
    pub model: ModelConfig,
}

impl AnalysisRequest {
    pub fn new(
        symbol: impl Into<String>,
        analysis_date: impl Into<String>,
        analysts: Vec<Analyst>,
        research_depth: u8,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            analysis_date: analysis_date.into(),
            analysts,
            research_depth,
            model: ModelConfig::default(),
        }
    }

    /// Canonical form: upper-case symbol, analysts de-duplicated in request
    /// order, depth clamped to `1..=MAX_RESEARCH_DEPTH`.
    pub fn normalize(&mut self) {
        self.symbol = self.symbol.trim().to_ascii_uppercase();
        self.analysis_date = self.analysis_date.trim().to_string();

        let mut seen = Vec::with_capacity(self.analysts.len());
        for analyst in self.analysts.drain(..) {
            if !seen.contains(&analyst) {
                seen.push(analyst);
            }
        }
        self.analysts = seen;

        self.research_depth = self.research_depth.clamp(1, MAX_RESEARCH_DEPTH);
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.symbol.trim().is_empty() {
            return Err(RequestError::EmptySymbol);
        }
        if self.analysts.is_empty() {
            return Err(RequestError::NoAnalysts);
        }
        if NaiveDate::parse_from_str(self.analysis_date.trim(), "%Y-%m-%d").is_err() {
            return Err(RequestError::InvalidDate(self.analysis_date.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_canonicalizes_symbol_analysts_and_depth() {
        let mut req = AnalysisRequest::new(
            " aapl ",
            "2024-01-15",
            vec![Analyst::Market, Analyst::News, Analyst::Market],
            9,
        );
        req.normalize();

        assert_eq!(req.symbol, "AAPL");
        assert_eq!(req.analysts, vec![Analyst::Market, Analyst::News]);
        assert_eq!(req.research_depth, MAX_RESEARCH_DEPTH);

        req.research_depth = 0;
        req.normalize();
        assert_eq!(req.research_depth, 1);
    }

    #[test]
    fn validate_rejects_bad_inputs() {
        let ok = AnalysisRequest::new("AAPL", "2024-01-15", vec![Analyst::Market], 3);
        assert_eq!(ok.validate(), Ok(()));

        let mut empty = ok.clone();
        empty.symbol = "  ".into();
        assert_eq!(empty.validate(), Err(RequestError::EmptySymbol));

        let mut none = ok.clone();
        none.analysts.clear();
        assert_eq!(none.validate(), Err(RequestError::NoAnalysts));

        let mut bad_date = ok;
        bad_date.analysis_date = "15/01/2024".into();
        assert!(matches!(bad_date.validate(), Err(RequestError::InvalidDate(_))));
    }

    #[test]
    fn analyst_parses_case_insensitively() {
        assert_eq!("Fundamentals".parse::<Analyst>(), Ok(Analyst::Fundamentals));
        assert!("technical".parse::<Analyst>().is_err());
    }

    #[test]
    fn request_deserializes_with_default_model() {
        let req: AnalysisRequest = serde_json::from_str(
            r#"{"symbol":"AAPL","analysis_date":"2024-01-15","analysts":["market","fundamentals"],"research_depth":3}"#,
        )
        .unwrap();
        assert_eq!(req.analysts, vec![Analyst::Market, Analyst::Fundamentals]);
        assert_eq!(req.model, ModelConfig::default());
    }
}
