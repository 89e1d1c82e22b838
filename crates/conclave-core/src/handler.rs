//! Handler shapes shared by graph nodes and agents.
//!
//! A handler is picked once, when the node or agent is built, from a closed
//! set of shapes. Running it never inspects the payload to decide what to call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{ConclaveError, Result};
use crate::traits::{Processor, Tool};
use crate::types::DataMap;

#[derive(Clone)]
pub enum Handler {
    /// Agent-process shape.
    Process(Arc<dyn Processor>),
    /// Tool-call shape: inputs become the tool's JSON object argument.
    Tool(Arc<dyn Tool>),
    /// Chain-call shape: each handler receives the previous one's outputs.
    Chain(Vec<Handler>),
    /// Outputs equal inputs.
    Passthrough,
}

impl Handler {
    pub fn processor(processor: impl Processor) -> Self {
        Self::Process(Arc::new(processor))
    }

    /// Wrap an async closure as a processor handler.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken, DataMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DataMap>> + Send + 'static,
    {
        Self::Process(Arc::new(FnProcessor::new(f)))
    }

    pub fn tool(tool: impl Tool) -> Self {
        Self::Tool(Arc::new(tool))
    }

    pub fn chain(handlers: Vec<Handler>) -> Self {
        Self::Chain(handlers)
    }

    /// Short name of the handler shape, used in logs and events.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::Tool(_) => "tool",
            Self::Chain(_) => "chain",
            Self::Passthrough => "passthrough",
        }
    }

    pub fn run(
        &self,
        cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        match self {
            Self::Process(processor) => processor.process(cancel, inputs),
            Self::Tool(tool) => Box::pin(run_tool(tool.as_ref(), cancel, inputs)),
            Self::Chain(handlers) => Box::pin(async move {
                let mut current = inputs;
                for handler in handlers {
                    if cancel.is_cancelled() {
                        return Err(ConclaveError::Cancelled);
                    }
                    current = handler.run(cancel.clone(), current).await?;
                }
                Ok(current)
            }),
            Self::Passthrough => Box::pin(async move { Ok(inputs) }),
        }
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::Passthrough
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool(tool) => write!(f, "Handler::Tool({})", tool.name()),
            Self::Chain(handlers) => f.debug_tuple("Handler::Chain").field(handlers).finish(),
            other => write!(f, "Handler::{}", other.shape()),
        }
    }
}

async fn run_tool(tool: &dyn Tool, cancel: CancellationToken, inputs: DataMap) -> Result<DataMap> {
    let input = serde_json::Value::Object(inputs.into_iter().collect());
    let timeout = Duration::from_secs(tool.timeout_secs());

    let output = match tokio::time::timeout(timeout, tool.execute(input, cancel)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ConclaveError::Timeout {
                target: format!("tool {}", tool.name()),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    Ok(match output {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => DataMap::from([("result".to_string(), other)]),
    })
}

/// Adapts an async closure to [`Processor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(CancellationToken, DataMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<DataMap>> + Send + 'static,
{
    fn process(
        &self,
        cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin((self.f)(cancel, inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct UpperTool;

    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase the `text` field"
        }

        fn execute(
            &self,
            input: serde_json::Value,
            _cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                let text = input["text"].as_str().unwrap_or_default().to_uppercase();
                Ok(json!(text))
            })
        }
    }

    fn inputs(text: &str) -> DataMap {
        DataMap::from([("text".to_string(), json!(text))])
    }

    #[tokio::test]
    async fn test_passthrough() {
        let out = Handler::Passthrough
            .run(CancellationToken::new(), inputs("hi"))
            .await
            .unwrap();
        assert_eq!(out["text"], json!("hi"));
    }

    #[tokio::test]
    async fn test_tool_wraps_scalar_result() {
        let out = Handler::tool(UpperTool)
            .run(CancellationToken::new(), inputs("hi"))
            .await
            .unwrap();
        assert_eq!(out["result"], json!("HI"));
    }

    #[tokio::test]
    async fn test_chain_feeds_outputs_forward() {
        let append = |suffix: &'static str| {
            Handler::from_fn(move |_cancel, mut inputs: DataMap| async move {
                let text = inputs["text"].as_str().unwrap_or_default().to_string();
                inputs.insert("text".into(), json!(format!("{text}{suffix}")));
                Ok(inputs)
            })
        };

        let chain = Handler::chain(vec![append("-a"), append("-b")]);
        let out = chain.run(CancellationToken::new(), inputs("x")).await.unwrap();
        assert_eq!(out["text"], json!("x-a-b"));
        assert_eq!(chain.shape(), "chain");
    }

    #[tokio::test]
    async fn test_chain_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chain = Handler::chain(vec![Handler::Passthrough]);
        let err = chain.run(cancel, inputs("x")).await.unwrap_err();
        assert!(matches!(err, ConclaveError::Cancelled));
    }

    #[tokio::test]
    async fn test_chain_propagates_errors() {
        let failing = Handler::from_fn(|_cancel, _inputs| async move {
            Err(ConclaveError::handler("step", "boom"))
        });
        let chain = Handler::chain(vec![Handler::Passthrough, failing]);
        let err = chain.run(CancellationToken::new(), inputs("x")).await.unwrap_err();
        assert!(err.is_handler_failure());
    }
}
