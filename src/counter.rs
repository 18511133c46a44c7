//! The `DO_COUNTER` executor: a named integer counter whose changes are
//! published on the `count` topic.

use rpcshard_lite::{
    ExecutorCatalog, ExecutorDefinition, FieldAddressing, InstanceContext, ProcedureError,
    ProcedureTable, Subscribed,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const COUNTER_KIND: &str = "DO_COUNTER";
pub const ADDRESSING_FIELD: &str = "_namespace";
pub const COUNT_TOPIC: &str = "count";

const COUNTER_KEY: &str = "counter";

/// Input carrying only the counter's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Named {
    #[serde(rename = "_namespace")]
    pub namespace: String,
}

/// Input of `inc` and `dec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amount {
    #[serde(rename = "_namespace")]
    pub namespace: String,
    pub amount: i64,
}

async fn current(ctx: &InstanceContext) -> Result<i64, ProcedureError> {
    Ok(ctx.storage().load::<i64>(COUNTER_KEY).await?.unwrap_or(0))
}

async fn add(ctx: &InstanceContext, delta: i64) -> Result<i64, ProcedureError> {
    let value = current(ctx).await? + delta;
    ctx.storage().save(COUNTER_KEY, &value).await?;
    ctx.emit(COUNT_TOPIC, json!(value)).await?;
    Ok(value)
}

pub fn procedures() -> ProcedureTable {
    let mut table = ProcedureTable::new();
    table
        .query("do_name", |_ctx: InstanceContext, input: Named| async move {
            Ok::<_, ProcedureError>(input.namespace)
        })
        .mutation("inc", |ctx: InstanceContext, input: Amount| async move {
            add(&ctx, input.amount).await
        })
        .mutation("dec", |ctx: InstanceContext, input: Amount| async move {
            add(&ctx, -input.amount).await
        })
        .query("get", |ctx: InstanceContext, _input: Named| async move {
            current(&ctx).await
        })
        .subscription(COUNT_TOPIC, |ctx: InstanceContext, _input: Value| async move {
            let value = current(&ctx).await?;
            Ok::<_, ProcedureError>(Subscribed::new(COUNT_TOPIC, value))
        });
    table
}

pub fn definition() -> ExecutorDefinition {
    ExecutorDefinition::new(
        COUNTER_KIND,
        FieldAddressing::new(ADDRESSING_FIELD),
        procedures(),
    )
}

/// Catalog with every executor kind this gateway serves.
pub fn catalog() -> ExecutorCatalog {
    let mut catalog = ExecutorCatalog::new();
    catalog.register(definition());
    catalog
}
