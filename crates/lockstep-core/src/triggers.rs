//! Trigger retry engine.
//!
//! One pass over the replication objects per invocation, each mutation a single
//! bounded attempt. There is no internal retry loop: the operator re-runs until
//! the report converges. Objects already in the target state are reported as
//! [`Outcome::AlreadySatisfied`] and never touched, so re-running is always safe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use lockstep_rdbc::security::{quote_identifier, validate_qualified_identifier, validate_sql_identifier};

use crate::catalog::{ObjectCatalog, TriggerState};
use crate::error::{Error, Result};
use crate::executor::BoundedExecutor;
use crate::model::{QualifiedName, ReplicationObject};
use crate::report::{MutationAttempt, Operation, Outcome, RunReport};

/// Add or remove the replication trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOperation {
    /// Create the trigger where missing
    Add,
    /// Drop the trigger where present
    Drop,
}

impl TriggerOperation {
    fn operation(self) -> Operation {
        match self {
            Self::Add => Operation::AddTrigger,
            Self::Drop => Operation::DropTrigger,
        }
    }
}

impl fmt::Display for TriggerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// Firing mode to switch an existing trigger to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToggleMode {
    /// `DISABLE TRIGGER`
    Disable,
    /// `ENABLE ALWAYS TRIGGER`
    EnableAlways,
}

impl ToggleMode {
    fn target_state(self) -> TriggerState {
        match self {
            Self::Disable => TriggerState::Disabled,
            Self::EnableAlways => TriggerState::Always,
        }
    }

    fn operation(self) -> Operation {
        match self {
            Self::Disable => Operation::DisableTrigger,
            Self::EnableAlways => Operation::EnableAlwaysTrigger,
        }
    }

    fn clause(self) -> &'static str {
        match self {
            Self::Disable => "DISABLE TRIGGER",
            Self::EnableAlways => "ENABLE ALWAYS TRIGGER",
        }
    }
}

/// The replication trigger: its name and the function it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Trigger name, identical on every table
    pub name: String,
    /// Trigger function, `name` or `schema.name`
    pub function: String,
}

impl TriggerSpec {
    /// Create a spec, validating both identifiers
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Result<Self> {
        let spec = Self {
            name: name.into(),
            function: function.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Reject names that are not plain identifiers
    pub fn validate(&self) -> Result<()> {
        validate_sql_identifier(&self.name)
            .map_err(|e| Error::config(format!("trigger name: {}", e)))?;
        if self.function.contains('.') {
            validate_qualified_identifier(&self.function).map(|_| ())
        } else {
            validate_sql_identifier(&self.function)
        }
        .map_err(|e| Error::config(format!("trigger function: {}", e)))?;
        Ok(())
    }

    fn quoted_function(&self) -> String {
        match self.function.split_once('.') {
            Some((schema, name)) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
            None => quote_identifier(&self.function),
        }
    }

    /// `CREATE TRIGGER` for `table`
    pub fn create_sql(&self, table: &QualifiedName) -> String {
        format!(
            "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            quote_identifier(&self.name),
            table.quoted(),
            self.quoted_function()
        )
    }

    /// `DROP TRIGGER` for `table`
    pub fn drop_sql(&self, table: &QualifiedName) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_identifier(&self.name),
            table.quoted()
        )
    }

    /// `ALTER TABLE .. {DISABLE|ENABLE ALWAYS} TRIGGER` for `table`
    pub fn toggle_sql(&self, table: &QualifiedName, mode: ToggleMode) -> String {
        format!(
            "ALTER TABLE {} {} {}",
            table.quoted(),
            mode.clause(),
            quote_identifier(&self.name)
        )
    }
}

/// Adds, drops and toggles the replication trigger across a set of objects.
pub struct TriggerEngine {
    catalog: Arc<dyn ObjectCatalog>,
    executor: BoundedExecutor,
    spec: TriggerSpec,
    timeout: Duration,
}

impl TriggerEngine {
    /// Create an engine. `timeout` is the per-object lock wait budget.
    pub fn new(
        catalog: Arc<dyn ObjectCatalog>,
        executor: BoundedExecutor,
        spec: TriggerSpec,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            executor,
            spec,
            timeout,
        }
    }

    /// The trigger this engine manages
    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    fn attempt_record(&self, object: &ReplicationObject, operation: Operation, outcome: Outcome) -> MutationAttempt {
        let attempt = MutationAttempt {
            object: object.name.clone(),
            target: self.spec.name.clone(),
            operation,
            wait_budget: self.timeout,
            outcome,
        };
        attempt.log();
        attempt
    }

    /// One pass of `operation` over `objects`, in (schema, name) order.
    pub async fn run(&self, objects: &[ReplicationObject], operation: TriggerOperation) -> RunReport {
        info!(
            trigger = %self.spec.name,
            %operation,
            objects = objects.len(),
            budget = ?self.timeout,
            "starting trigger run"
        );

        let mut report = RunReport::new();
        for object in sorted(objects) {
            let outcome = self.apply(object, operation).await;
            report.push(self.attempt_record(object, operation.operation(), outcome));
        }

        info!(%operation, summary = %report.summary(), "trigger run finished");
        report
    }

    async fn apply(&self, object: &ReplicationObject, operation: TriggerOperation) -> Outcome {
        if !object.is_table() {
            return Outcome::AlreadySatisfied;
        }
        if operation == TriggerOperation::Add && !object.has_primary_key() {
            return missing_primary_key(object);
        }

        let present = match self.catalog.has_trigger(&object.name, &self.spec.name).await {
            Ok(present) => present,
            Err(e) => return Outcome::fatal(e),
        };

        match (operation, present) {
            (TriggerOperation::Add, true) | (TriggerOperation::Drop, false) => Outcome::AlreadySatisfied,
            (TriggerOperation::Add, false) => {
                self.executor
                    .attempt(&self.spec.create_sql(&object.name), self.timeout)
                    .await
            }
            (TriggerOperation::Drop, true) => {
                self.executor
                    .attempt(&self.spec.drop_sql(&object.name), self.timeout)
                    .await
            }
        }
    }

    /// Switch the firing mode of existing triggers.
    ///
    /// Objects whose trigger is absent, or already in `mode`, are left alone.
    pub async fn toggle(&self, objects: &[ReplicationObject], mode: ToggleMode) -> RunReport {
        info!(trigger = %self.spec.name, ?mode, objects = objects.len(), "starting trigger toggle");

        let mut report = RunReport::new();
        for object in sorted(objects) {
            let outcome = self.toggle_one(object, mode).await;
            report.push(self.attempt_record(object, mode.operation(), outcome));
        }

        info!(?mode, summary = %report.summary(), "trigger toggle finished");
        report
    }

    async fn toggle_one(&self, object: &ReplicationObject, mode: ToggleMode) -> Outcome {
        if !object.is_table() {
            return Outcome::AlreadySatisfied;
        }
        if !object.has_primary_key() {
            return missing_primary_key(object);
        }

        match self.catalog.trigger_state(&object.name, &self.spec.name).await {
            Err(e) => Outcome::fatal(e),
            Ok(None) => {
                warn!(object = %object.name, trigger = %self.spec.name, "trigger not present, nothing to toggle");
                Outcome::AlreadySatisfied
            }
            Ok(Some(state)) if state == mode.target_state() => Outcome::AlreadySatisfied,
            Ok(Some(_)) => {
                self.executor
                    .attempt(&self.spec.toggle_sql(&object.name, mode), self.timeout)
                    .await
            }
        }
    }

    /// Tables not yet in the state `operation` aims for. Read-only.
    pub async fn verify(
        &self,
        objects: &[ReplicationObject],
        operation: TriggerOperation,
    ) -> Result<Vec<QualifiedName>> {
        let mut pending = Vec::new();
        for object in sorted(objects) {
            if !object.is_table() {
                continue;
            }
            let present = self.catalog.has_trigger(&object.name, &self.spec.name).await?;
            let done = match operation {
                TriggerOperation::Add => present,
                TriggerOperation::Drop => !present,
            };
            if !done {
                pending.push(object.name.clone());
            }
        }
        Ok(pending)
    }
}

fn sorted(objects: &[ReplicationObject]) -> Vec<&ReplicationObject> {
    let mut sorted: Vec<&ReplicationObject> = objects.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
}

fn missing_primary_key(object: &ReplicationObject) -> Outcome {
    Outcome::fatal(Error::MissingPrimaryKey {
        object: object.name.to_string(),
    })
}
