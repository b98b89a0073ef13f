use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::{Captures, Regex};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shinobi_core::gateway::{CompletionRequest, GenerationParams, ModelGateway, SystemBlock};
use shinobi_core::messages::Message;
use shinobi_core::usage::Usage;
use shinobi_llm::pricing::PriceTable;

use super::trace::TraceEvent;
use crate::error::EngineError;

/// `{{input}}`, `{{memory.KEY}}`, `{{dep.ID}}`
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(input|memory\.([A-Za-z0-9_.\-]+)|dep\.([A-Za-z0-9_.\-]+))\s*\}\}")
        .expect("placeholder pattern is valid")
});

/// Everything a module sees when it runs.
#[derive(Clone, Debug)]
pub struct ThoughtContext {
    pub scope: String,
    pub input: String,
    /// Copy of the scope's memory taken just before the module ran.
    pub memory: BTreeMap<String, Value>,
    pub trace: Vec<TraceEvent>,
    /// Outputs of the module's declared dependencies, by module id.
    pub dependencies: BTreeMap<String, Value>,
    pub cancel: CancellationToken,
}

impl ThoughtContext {
    /// Context outside a graph run: no memory, no trace, no dependencies.
    pub fn standalone(input: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            scope: String::new(),
            input: input.into(),
            memory: BTreeMap::new(),
            trace: Vec::new(),
            dependencies: BTreeMap::new(),
            cancel,
        }
    }

    pub fn dependency(&self, id: &str) -> Option<&Value> {
        self.dependencies.get(id)
    }

    /// Fill the supported placeholders; unknown keys render empty.
    pub fn render(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                if let Some(key) = caps.get(2) {
                    self.memory.get(key.as_str()).map(value_text).unwrap_or_default()
                } else if let Some(id) = caps.get(3) {
                    self.dependencies.get(id.as_str()).map(value_text).unwrap_or_default()
                } else {
                    self.input.clone()
                }
            })
            .into_owned()
    }
}

/// Strings render bare; everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Thought {
    pub output: Value,
    /// Free-form notes appended to the trace after the module completes.
    pub notes: Vec<String>,
    pub usage: Usage,
}

impl Thought {
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn text(&self) -> String {
        value_text(&self.output)
    }
}

#[async_trait]
pub trait ThoughtModule: Send + Sync {
    fn id(&self) -> &str;

    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn think(&self, ctx: &ThoughtContext) -> Result<Thought, EngineError>;
}

type ThinkFn = Arc<dyn Fn(ThoughtContext) -> BoxFuture<'static, Result<Thought, EngineError>> + Send + Sync>;

/// Module backed by an async closure.
#[derive(Clone)]
pub struct FnModule {
    id: String,
    dependencies: Vec<String>,
    think: ThinkFn,
}

impl FnModule {
    pub fn new<F, Fut>(id: impl Into<String>, think: F) -> Self
    where
        F: Fn(ThoughtContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Thought, EngineError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            think: Arc::new(move |ctx| Box::pin(think(ctx))),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl ThoughtModule for FnModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn think(&self, ctx: &ThoughtContext) -> Result<Thought, EngineError> {
        (self.think)(ctx.clone()).await
    }
}

/// Module that renders a prompt template and asks the model.
pub struct PromptModule {
    id: String,
    dependencies: Vec<String>,
    model: String,
    template: String,
    system: Option<String>,
    params: GenerationParams,
    gateway: Arc<dyn ModelGateway>,
    prices: Arc<PriceTable>,
}

impl PromptModule {
    pub fn new(
        id: impl Into<String>,
        gateway: Arc<dyn ModelGateway>,
        model: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            model: model.into(),
            template: template.into(),
            system: None,
            params: GenerationParams::default(),
            gateway,
            prices: Arc::new(PriceTable::with_defaults()),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_prices(mut self, prices: Arc<PriceTable>) -> Self {
        self.prices = prices;
        self
    }
}

#[async_trait]
impl ThoughtModule for PromptModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn think(&self, ctx: &ThoughtContext) -> Result<Thought, EngineError> {
        let prompt = ctx.render(&self.template);
        let mut request = CompletionRequest::new(&self.model);
        if let Some(system) = &self.system {
            request.system.push(SystemBlock::new("module", ctx.render(system)));
        }
        request.messages.push(Message::user_text(prompt));
        request.params = self.params.clone();

        let completion = self
            .gateway
            .complete(&request, &ctx.cancel)
            .await
            .map_err(|e| EngineError::from(e).with_usage(Usage::from_call(None, None)))?;
        let usage = self.prices.usage_for(&self.model, completion.usage);
        Ok(Thought {
            output: Value::String(completion.content.unwrap_or_default()),
            notes: Vec::new(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shinobi_core::usage::TokenUsage;
    use shinobi_llm::mock::{MockGateway, MockResponse};

    fn ctx() -> ThoughtContext {
        let mut ctx = ThoughtContext::standalone("why is the sky blue?", CancellationToken::new());
        let _ = ctx.memory.insert("tone".into(), json!("curious"));
        let _ = ctx.dependencies.insert("facts".into(), json!({"n": 3}));
        ctx
    }

    #[test]
    fn renders_placeholders() {
        let rendered = ctx().render("Q: {{input}} | tone={{ memory.tone }} | facts={{dep.facts}} | x={{memory.none}}");
        assert_eq!(
            rendered,
            r#"Q: why is the sky blue? | tone=curious | facts={"n":3} | x="#
        );
    }

    #[tokio::test]
    async fn fn_module_sees_context() {
        let module = FnModule::new("upper", |ctx: ThoughtContext| async move {
            Ok(Thought::new(ctx.input.to_uppercase()).with_note("shouted"))
        })
        .depends_on(["facts"]);
        assert_eq!(module.dependencies(), ["facts".to_string()]);
        let thought = module.think(&ctx()).await.unwrap();
        assert_eq!(thought.text(), "WHY IS THE SKY BLUE?");
        assert_eq!(thought.notes, vec!["shouted"]);
    }

    #[tokio::test]
    async fn prompt_module_calls_gateway() {
        let mock = Arc::new(
            MockGateway::new(vec![MockResponse::text("Rayleigh scattering.")])
                .with_default_usage(TokenUsage::new(12, 4)),
        );
        let module = PromptModule::new("answer", mock.clone(), "claude-haiku", "{{input}} ({{memory.tone}})")
            .with_system("Answer in one line.");
        let thought = module.think(&ctx()).await.unwrap();
        assert_eq!(thought.output, json!("Rayleigh scattering."));
        assert_eq!(thought.usage.total_tokens, 16);
        assert!(!thought.usage.approximate);

        let request = mock.last_request().unwrap();
        assert_eq!(request.last_user_text(), Some("why is the sky blue? (curious)"));
        assert_eq!(request.system_text(), "Answer in one line.");
    }
}
