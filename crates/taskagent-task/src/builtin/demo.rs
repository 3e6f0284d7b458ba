//! `demo`: log a line, report half-way progress, finish with a greeting.

use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::task_type::{StepFuture, TaskType};

pub const NAME: &str = "demo";

pub fn task_type() -> TaskType {
    TaskType::new(NAME, start)
}

fn start(ctx: &mut TaskContext) -> StepFuture<'_> {
    Box::pin(async move {
        ctx.log().info("I'm logging a message");
        ctx.progress(50);
        ctx.finish(Some(json!({ "hello": "world" })));
        Ok(Value::Null)
    })
}
