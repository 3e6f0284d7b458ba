//! `error`: runs the `silly` step, reports a non-fatal error and returns
//! without finishing, so the worker exits non-zero.

use serde_json::Value;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::task_type::{StepFuture, StepSpec, TaskType};

pub const NAME: &str = "error";
const STEP: &str = "silly";

pub fn task_type() -> TaskType {
    TaskType::new(NAME, start).with_step(
        STEP,
        StepSpec::new(silly).with_description("A step that only logs its arguments"),
    )
}

fn start(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(run(ctx))
}

async fn run(ctx: &mut TaskContext) -> Result<Value, TaskError> {
    ctx.run_step(STEP, serde_json::json!([1, 2])).await?;
    ctx.error("Failed inside the error task start", None);
    Ok(Value::Null)
}

fn silly(ctx: &mut TaskContext, args: Value) -> StepFuture<'_> {
    Box::pin(async move {
        ctx.log().debug(serde_json::json!({ "step": STEP, "args": args }));
        Ok(Value::Null)
    })
}
