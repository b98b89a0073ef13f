use tokio_util::sync::CancellationToken;
use tracing::debug;

use shinobi_core::errors::GatewayError;
use shinobi_core::gateway::{CompletionRequest, SystemBlock};
use shinobi_core::messages::Message;
use shinobi_core::usage::Usage;

use crate::error::EngineError;
use crate::runtime::Runtime;

const SYNTHESIS_INSTRUCTIONS: &str = "Combine the contributions below into one complete answer to the \
original request. Resolve disagreements explicitly and do not drop information.";

/// One labelled contribution to a synthesis pass.
pub(crate) struct Section<'a> {
    pub label: &'a str,
    pub content: &'a str,
}

/// Text handed to the next stage: the query followed by earlier findings.
pub(crate) fn compose(query: &str, sections: &[Section<'_>], heading: &str) -> String {
    if sections.is_empty() {
        return query.to_string();
    }
    let mut text = format!("{query}\n\n{heading}:");
    for section in sections {
        text.push_str(&format!("\n\n[{}]\n{}", section.label, section.content));
    }
    text
}

/// A final model call folding every contribution into one answer.
pub(crate) async fn synthesize(
    runtime: &Runtime,
    model: &str,
    mut system: Vec<SystemBlock>,
    query: &str,
    sections: &[Section<'_>],
    cancel: &CancellationToken,
) -> Result<(String, Usage), EngineError> {
    system.push(SystemBlock::new("synthesis", SYNTHESIS_INSTRUCTIONS));
    let mut request = CompletionRequest::new(model);
    request.system = system;
    request.messages.push(Message::user_text(compose(query, sections, "Contributions")));

    debug!(model, sections = sections.len(), "running synthesis");
    let completion = match runtime.gateway().complete(&request, cancel).await {
        Ok(completion) => completion,
        Err(e) => {
            let unknown = Usage::from_call(None, None);
            return Err(match e {
                GatewayError::Cancelled => EngineError::Cancelled,
                e => e.into(),
            }
            .with_usage(unknown));
        }
    };
    let usage = runtime.prices().usage_for(model, completion.usage);
    Ok((completion.content.unwrap_or_default(), usage))
}
