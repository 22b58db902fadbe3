use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use ta_task_core::{AnalysisRequest, Analyst, ModelConfig};

use crate::analysis::{AnalysisEngine, AnalysisOutput, EngineError, ProgressReporter};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    symbol: &'a str,
    analysis_date: &'a str,
    analysts: &'a [Analyst],
    research_depth: u8,
    #[serde(flatten)]
    model: &'a ModelConfig,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    decision: Value,
    #[serde(default)]
    state: Option<Value>,
}

/// Analysis engine reached over HTTP (`POST <base>/api/analyze/run`).
///
/// The call blocks the worker thread on the captured runtime handle, so it
/// must run on a blocking thread, never on a runtime worker.
pub struct HttpAnalysisEngine {
    http: reqwest::Client,
    base: Url,
    runtime: Handle,
}

impl HttpAnalysisEngine {
    /// Engine client for `base`. Must be called from within a tokio runtime.
    pub fn new(base: Url) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|e| EngineError::Other(e.into()))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("ta-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base, runtime })
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutput, EngineError> {
        let url = self
            .base
            .join("api/analyze/run")
            .map_err(|e| EngineError::Other(e.into()))?;
        let res = self
            .http
            .post(url)
            .json(&RunRequest {
                symbol: &request.symbol,
                analysis_date: &request.analysis_date,
                analysts: &request.analysts,
                research_depth: request.research_depth,
                model: &request.model,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), body));
        }

        let body: Value = res.json().await?;
        let parsed: RunResponse = serde_json::from_value(body.clone())
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        if !parsed.decision.is_object() {
            return Err(EngineError::Malformed("decision is not an object".into()));
        }
        Ok(AnalysisOutput {
            decision: parsed.decision,
            raw: Some(parsed.state.unwrap_or(body)),
        })
    }
}

fn error_from_body(status: u16, body: String) -> EngineError {
    if (400..500).contains(&status) {
        if let Ok(err) = serde_json::from_str::<ApiErrorBody>(&body) {
            return EngineError::Rejected {
                code: err.code,
                detail: err.detail,
            };
        }
    }
    let mut body = body;
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    EngineError::Http { status, body }
}

impl AnalysisEngine for HttpAnalysisEngine {
    fn analyze(
        &self,
        request: &AnalysisRequest,
        progress: &ProgressReporter,
    ) -> Result<AnalysisOutput, EngineError> {
        progress.enter_stage(
            "initialization",
            format!("submitting {} to analysis engine", request.symbol),
        );
        let output = self.runtime.block_on(self.run(request))?;
        progress.enter_stage("finalization", "formatting decision");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_with_api_body_are_rejections() {
        let err = error_from_body(
            400,
            r#"{"code":"invalid_symbol","detail":"ZZZZ is not listed"}"#.to_string(),
        );
        match err {
            EngineError::Rejected { code, detail } => {
                assert_eq!(code, "invalid_symbol");
                assert_eq!(detail, "ZZZZ is not listed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn server_errors_keep_a_truncated_body() {
        let err = error_from_body(502, "x".repeat(2000));
        match err {
            EngineError::Http { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn run_request_flattens_model_selection() {
        let request = AnalysisRequest::new(
            "AAPL",
            "2024-01-15",
            vec![Analyst::Market, Analyst::News],
            2,
        );
        let body = serde_json::to_value(RunRequest {
            symbol: &request.symbol,
            analysis_date: &request.analysis_date,
            analysts: &request.analysts,
            research_depth: request.research_depth,
            model: &request.model,
        })
        .unwrap();
        assert_eq!(body["analysts"], serde_json::json!(["market", "news"]));
        assert_eq!(body["llm_provider"], "dashscope");
        assert_eq!(body["deep_think_llm"], "qwen-plus");
    }

    #[test]
    fn new_requires_runtime() {
        let base = Url::parse("http://127.0.0.1:8000/").unwrap();
        assert!(HttpAnalysisEngine::new(base).is_err());
    }
}
