//! Code node: runs a Lua script in the sandbox
//!
//! Parameters: `code`, `mode` (`runOnceForAllItems` default, or
//! `runOnceForEachItem`), `timeoutMs` and `language` (only `lua`).
//! In per-item mode `staticData` changes carry over from one item to the next.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, SandboxError};
use crate::runtime::context::{static_data_patch, ExecutionContext};
use crate::runtime::sandbox::{Sandbox, ScriptBindings};
use crate::workflow::{Node, PortItems};

use super::{flatten_inputs, node_binding, normalize_items, NodeOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeMode {
    AllItems,
    EachItem,
}

pub async fn run(
    sandbox: &Sandbox,
    node: &Node,
    inputs: PortItems,
    context: &ExecutionContext,
    cancel: &CancellationToken,
) -> Result<NodeOutput> {
    let language = node.param_str("language").unwrap_or("lua");
    if !language.eq_ignore_ascii_case("lua") {
        return Err(EngineError::node(&node.id, format!("Unsupported language '{language}'")));
    }
    let code = ["code", "luaCode", "script"]
        .iter()
        .find_map(|key| node.param_str(key))
        .ok_or_else(|| EngineError::node(&node.id, "Missing 'code' parameter"))?;
    let mode = match node.param_str("mode").unwrap_or("runOnceForAllItems") {
        "runOnceForAllItems" | "allItems" => CodeMode::AllItems,
        "runOnceForEachItem" | "eachItem" => CodeMode::EachItem,
        other => return Err(EngineError::node(&node.id, format!("Unknown mode '{other}'"))),
    };
    let timeout_ms = node.param_u64("timeoutMs");

    let items = flatten_inputs(inputs);
    let base = ScriptBindings {
        items: items.clone(),
        node: node_binding(node),
        workflow: context.workflow_binding(),
        execution: context.execution_binding(),
        variables: context.variables.clone(),
        static_data: context.static_data.clone(),
        ..Default::default()
    };

    let mut output = Vec::new();
    let mut logs = Vec::new();
    let mut static_data = context.static_data.clone();

    // STEP 1: Build one sandbox call per batch (all items) or per item
    let calls: Vec<ScriptBindings> = match mode {
        CodeMode::AllItems => vec![ScriptBindings {
            item: items.first().cloned(),
            item_index: Some(0),
            ..base
        }],
        CodeMode::EachItem => items
            .iter()
            .enumerate()
            .map(|(index, item)| ScriptBindings {
                item: Some(item.clone()),
                item_index: Some(index),
                ..base.clone()
            })
            .collect(),
    };

    // STEP 2: Run them in order, threading static data through
    for mut bindings in calls {
        bindings.static_data = static_data.clone();
        let result = sandbox
            .execute_script_cancellable(code, bindings, timeout_ms, cancel)
            .await
            .map_err(|err| match err {
                SandboxError::Canceled => EngineError::NodeCanceled(node.id.clone()),
                other => EngineError::node(&node.id, other),
            })?;

        for line in &result.logs {
            tracing::info!(node_id = %node.id, execution_id = %context.execution_id, "📝 {line}");
        }
        logs.extend(result.logs);
        static_data = result.static_data;
        output.extend(normalize_items(result.result));
    }

    tracing::debug!(node_id = %node.id, items = output.len(), "✅ Code node finished");
    Ok(NodeOutput {
        ports: vec![output],
        logs,
        static_data: Some(static_data_patch(&context.static_data, &static_data)).filter(|patch| !patch.is_empty()),
    })
}
