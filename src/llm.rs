//! Inference backend interface and Gemini client
//!
//! Capabilities talk to the model through the `LanguageModel` trait so the
//! selection mechanism stays swappable. The Gemini implementation uses a
//! long-lived reqwest::Client for connection pooling and runs a bounded
//! function-calling loop when tools are declared.

use crate::error::AssistantError;
use crate::tools::Tool;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound on model→tool→model round trips in one completion.
const MAX_TOOL_ROUNDS: usize = 4;

/// One request to the inference backend.
///
/// If `response_schema` is set the backend is asked to return JSON conforming
/// to it. If `tools` is non-empty the backend may invoke any subset of them
/// zero or more times before returning; the caller observes only the final
/// text plus the names of the tools that ran.
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub response_schema: Option<Value>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl CompletionRequest {
    pub fn text(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            response_schema: None,
            tools: Vec::new(),
        }
    }
}

/// Final output of one completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub invoked_tools: Vec<String>,
}

/// The inference backend seam.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// Strip a markdown code fence from model output before JSON parsing.
/// Models wrap JSON in ```json fences even when told not to.
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

//
// ================= Gemini =================
//

/// Reusable Gemini client (connection-pooled)
pub struct GeminiModel {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiModel {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        }
    }

    async fn send(&self, body: &GeminiRequest) -> Result<GeminiResponse> {
        let url = format!("{}?key={}", self.base_url, self.api_key);

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            error!("Gemini API request failed: {}", e);
            AssistantError::LlmError(format!("Gemini API error: {}", e))
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AssistantError::LlmError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        response.json::<GeminiResponse>().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AssistantError::LlmError(format!("Gemini parse error: {}", e))
        })
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        if self.api_key.is_empty() {
            return Err(AssistantError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let declarations: Vec<FunctionDeclaration> = request
            .tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();

        // The API rejects constrained JSON output combined with function
        // declarations, so the schema is only declared on tool-free requests.
        // Tool-carrying callers get format instructions in the prompt and a
        // lenient parse on their side.
        let response_schema = if declarations.is_empty() {
            request.response_schema.clone()
        } else {
            None
        };

        let mut contents = vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(request.prompt.clone())],
        }];
        let mut invoked_tools = Vec::new();

        for round in 0..=MAX_TOOL_ROUNDS {
            let body = GeminiRequest {
                contents: contents.clone(),
                generation_config: GenerationConfig {
                    temperature: 0.3,
                    top_p: 0.9,
                    top_k: 40,
                    max_output_tokens: 1024,
                    response_mime_type: response_schema
                        .as_ref()
                        .map(|_| "application/json".to_string()),
                    response_schema: response_schema.clone(),
                },
                system_instruction: SystemInstruction {
                    parts: vec![Part::text(request.system.clone())],
                },
                tools: if declarations.is_empty() {
                    None
                } else {
                    Some(vec![ToolDeclarations {
                        function_declarations: declarations.clone(),
                    }])
                },
            };

            info!(round, tools = declarations.len(), "Calling Gemini API");
            let response = self.send(&body).await?;

            let candidate = response.candidates.into_iter().next().ok_or_else(|| {
                AssistantError::LlmError("No response from Gemini API".to_string())
            })?;

            let calls: Vec<FunctionCall> = candidate
                .content
                .parts
                .iter()
                .filter_map(|p| p.function_call.clone())
                .collect();

            if calls.is_empty() || round == MAX_TOOL_ROUNDS {
                let text: String = candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect();

                return Ok(Completion {
                    text,
                    invoked_tools,
                });
            }

            // Feed tool results back and loop.
            contents.push(Content {
                role: Some("model".to_string()),
                parts: candidate.content.parts,
            });

            let mut response_parts = Vec::with_capacity(calls.len());
            for call in calls {
                let outcome = match request.tools.iter().find(|t| t.name() == call.name) {
                    Some(tool) => match tool.execute(&call.args).await {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "Tool execution failed");
                            json!({ "error": e.to_string() })
                        }
                    },
                    None => {
                        warn!(tool = %call.name, "Model requested an undeclared tool");
                        json!({ "error": format!("unknown tool: {}", call.name) })
                    }
                };

                invoked_tools.push(call.name.clone());
                response_parts.push(Part::function_response(call.name, outcome));
            }

            contents.push(Content {
                role: Some("user".to_string()),
                parts: response_parts,
            });
        }

        unreachable!("tool loop always returns within MAX_TOOL_ROUNDS")
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            function_call: None,
            function_response: None,
        }
    }

    fn function_response(name: String, response: Value) -> Self {
        Self {
            text: None,
            function_call: None,
            function_response: Some(FunctionResponse { name, response }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

//
// ================= Mock =================
//

/// Scripted model for development & testing.
/// Keeps the pipeline functional without LLM dependency.
pub struct MockModel {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    seen: std::sync::Mutex<Vec<(String, String)>>,
}

impl MockModel {
    pub fn with_responses(responses: Vec<&str>) -> Self {
        Self {
            responses: std::sync::Mutex::new(
                responses.into_iter().map(|s| s.to_string()).collect(),
            ),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// (system, prompt) pairs of every request received, in order.
    pub fn seen_requests(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.seen
            .lock()
            .unwrap()
            .push((request.system.clone(), request.prompt.clone()));

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(text) => Ok(Completion {
                text,
                invoked_tools: Vec::new(),
            }),
            None => Err(AssistantError::LlmError(
                "mock model has no scripted response left".to_string(),
            )),
        }
    }
}
