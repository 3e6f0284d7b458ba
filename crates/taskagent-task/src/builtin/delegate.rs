//! `delegate`: hand `params.task` to `params.resource` and finish with the
//! remote result.

use serde_json::{Value, json};
use taskagent_core::model::{EVENT_ERROR, EVENT_PROGRESS};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::task_type::{StepFuture, TaskType};

pub const NAME: &str = "delegate";

pub fn task_type() -> TaskType {
    TaskType::new(NAME, start).with_schema(json!({
        "type": "object",
        "required": ["resource", "task"],
        "properties": {
            "resource": { "type": "string", "minLength": 1 },
            "task": { "type": "string", "minLength": 1 },
            "msg": { "type": "object" }
        }
    }))
}

fn start(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(run(ctx))
}

async fn run(ctx: &mut TaskContext) -> Result<Value, TaskError> {
    let resource = ctx.param_str("resource")?.to_string();
    let task = ctx.param_str("task")?.to_string();
    let msg = ctx.params().get("msg").cloned().unwrap_or_else(|| json!({}));

    ctx.log().info(format!("Delegating {task} to {resource}"));
    let mut subtask = ctx.sub_task(&resource, &task, msg);

    while let Some(event) = subtask.next().await {
        if event.is_finish() {
            subtask.unregister();
            ctx.finish(Some(json!({
                "resource": resource,
                "task": task,
                "result": event.payload
            })));
            return Ok(Value::Null);
        }
        match event.name.as_str() {
            EVENT_ERROR => ctx.log().warn(json!({ "subtask_error": event.payload })),
            EVENT_PROGRESS => {
                if let Some(value) = event.payload.get("value").and_then(Value::as_u64) {
                    ctx.progress(u32::try_from(value).unwrap_or(u32::MAX));
                }
            }
            other => ctx.log().debug(format!("Subtask event {other}")),
        }
    }
    Err(TaskError::SubtaskClosed(subtask.id().to_string()))
}
