//! Record-building operations.
//!
//! A `TreeOp` root collects `RecordOp`s; each record gathers its values
//! (prompting for missing required ones in interactive mode), registers a
//! reference id and merges the `FieldOp` leaves chained on it. A YAML
//! `TreeSpec` describes such a tree for the CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::adapters::{Prompt, PromptBatch, PromptPlan};
use crate::core::{
    ChildFactory, ChildResults, FactoryMap, OpContext, Operation, Readiness, RelayHandle,
    RunContext,
};
use crate::domain::{Payload, Reason, RelayError, State, UserFacing};

/// Record type, used as the generated reference prefix
pub const TYPE_KEY: &str = "$type";

/// Custom reference key for the record
pub const REF_KEY: &str = "$ref";

/// Reference id to drop before registering this record
pub const REPLACES_KEY: &str = "$replaces";

/// Field names that must be present before execution
pub const REQUIRED_KEY: &str = "$required";

/// Answer to the final confirmation prompt
pub const CONFIRM_KEY: &str = "$confirm";

fn is_meta(key: &str) -> bool {
    key.starts_with('$')
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn record_type(state: &State) -> &str {
    state.get(TYPE_KEY).and_then(Value::as_str).unwrap_or_default()
}

fn required_fields(state: &State) -> Vec<String> {
    state
        .get(REQUIRED_KEY)
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Required fields that are absent or blank
pub fn missing_fields(state: &State) -> Vec<String> {
    required_fields(state)
        .into_iter()
        .filter(|name| state.get(name).map_or(true, is_blank))
        .collect()
}

fn require_value(value: &Value) -> std::result::Result<(), String> {
    if is_blank(value) {
        Err("a value is required".to_string())
    } else {
        Ok(())
    }
}

fn tree_calls() -> FactoryMap {
    FactoryMap::new()
        .with("record", ChildFactory::spawn(|| RecordOp))
        .with("finish", ChildFactory::terminal(finish_tree))
}

fn finish_tree(ctx: &RunContext, _args: &State) -> Result<()> {
    debug!(
        awaiting = ctx.registry().pending().len(),
        "Record tree fully described"
    );
    Ok(())
}

/// Root of a record tree
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeOp;

#[async_trait]
impl Operation for TreeOp {
    fn type_name(&self) -> &str {
        "tree"
    }

    fn children(&self) -> FactoryMap {
        tree_calls()
    }

    async fn before_run(&self, _state: &mut State, cx: &OpContext) -> Result<()> {
        match cx.run().connection().current() {
            Some(connection) => info!(alias = %connection.alias, "Building records"),
            None => debug!("Building records without a connection"),
        }
        Ok(())
    }

    async fn execute(&self, _state: &State, _cx: &OpContext) -> Result<Payload> {
        Ok(Payload::Null)
    }

    fn finish(&self, _own: Payload, children: ChildResults) -> Result<Payload> {
        let records: Vec<Payload> = children.into_iter().map(|child| child.payload).collect();
        Ok(json!({ "records": records }))
    }
}

/// One record; fields chained on it arrive as `FieldOp` children
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordOp;

#[async_trait]
impl Operation for RecordOp {
    fn type_name(&self) -> &str {
        "record"
    }

    fn children(&self) -> FactoryMap {
        tree_calls().with("field", ChildFactory::spawn(|| FieldOp))
    }

    async fn before_run(&self, state: &mut State, _cx: &OpContext) -> Result<()> {
        if record_type(state).is_empty() {
            return Err(UserFacing(format!("record needs a non-empty '{}'", TYPE_KEY)).into());
        }
        Ok(())
    }

    fn prompts(&self) -> Option<Box<dyn PromptPlan>> {
        let mut stage = 0;
        Some(Box::new(move |state: &State| -> Option<PromptBatch> {
            loop {
                stage += 1;
                match stage {
                    1 => {
                        let missing = missing_fields(state);
                        if missing.is_empty() {
                            continue;
                        }
                        return Some(
                            missing
                                .into_iter()
                                .map(|name| Prompt::input(&name, &name).validate(require_value))
                                .collect(),
                        );
                    }
                    2 => {
                        let question = format!("Create {}?", record_type(state));
                        return Some(vec![Prompt::confirm(CONFIRM_KEY, question).with_default(true)]);
                    }
                    _ => return None,
                }
            }
        }))
    }

    fn ready(&self, state: &State) -> Readiness {
        let missing = missing_fields(state);
        if !missing.is_empty() {
            return Readiness::NotReady(Reason::Structured(json!({ "missing": missing })));
        }
        if state.get(CONFIRM_KEY) == Some(&Value::Bool(false)) {
            return Readiness::not_ready("cancelled at confirmation");
        }
        Readiness::Ready
    }

    async fn execute(&self, state: &State, cx: &OpContext) -> Result<Payload> {
        let replaces = state.get(REPLACES_KEY).and_then(Value::as_str);
        let id = match state.get(REF_KEY).and_then(Value::as_str) {
            Some(key) => cx.register_custom(key, replaces)?,
            None => cx.register(Some(record_type(state)), replaces)?,
        };

        let values: State = state
            .iter()
            .filter(|(key, _)| !is_meta(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(json!({
            "type": record_type(state),
            "referenceId": id,
            "fields": values,
        }))
    }

    fn finish(&self, own: Payload, children: ChildResults) -> Result<Payload> {
        let mut record = match own {
            Payload::Object(record) => record,
            other => return Ok(other),
        };

        let mut nested = Vec::new();
        for child in children {
            if child.type_name != FieldOp::TYPE {
                nested.push(child.payload);
                continue;
            }
            let name = child
                .payload
                .get("name")
                .and_then(Value::as_str)
                .context("field payload without a name")?
                .to_string();
            let value = child.payload.get("value").cloned().unwrap_or(Value::Null);
            if let Some(Value::Object(fields)) = record.get_mut("fields") {
                fields.insert(name, value);
            }
        }

        if !nested.is_empty() {
            record.insert("children".to_string(), Value::Array(nested));
        }
        Ok(Payload::Object(record))
    }
}

/// A single named value on a record
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldOp;

impl FieldOp {
    pub const TYPE: &'static str = "field";
}

#[async_trait]
impl Operation for FieldOp {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn is_leaf(&self) -> bool {
        true
    }

    fn prompts(&self) -> Option<Box<dyn PromptPlan>> {
        let mut asked = false;
        Some(Box::new(move |state: &State| -> Option<PromptBatch> {
            if asked || state.get("value").is_some_and(|v| !v.is_null()) {
                return None;
            }
            asked = true;
            let name = state.get("name").and_then(Value::as_str).unwrap_or("value");
            Some(vec![Prompt::input("value", name)])
        }))
    }

    fn ready(&self, state: &State) -> Readiness {
        match state.get("name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => Readiness::Ready,
            _ => Readiness::not_ready("field needs a name"),
        }
    }

    async fn execute(&self, state: &State, _cx: &OpContext) -> Result<Payload> {
        Ok(json!({
            "name": state.get("name").cloned().unwrap_or(Value::Null),
            "value": state.get("value").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// YAML description of a record tree
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TreeSpec {
    #[serde(default)]
    pub records: Vec<RecordSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordSpec {
    #[serde(rename = "type")]
    pub record_type: String,

    /// Custom reference key; a generated `<type>_<n>` id is used otherwise
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,

    #[serde(default)]
    pub replaces: Option<String>,

    #[serde(default)]
    pub required: Vec<String>,

    /// Initial values, visible to prompts and the readiness check
    #[serde(default)]
    pub values: State,

    /// Values added as chained `field` calls
    #[serde(default)]
    pub fields: State,

    #[serde(default)]
    pub children: Vec<RecordSpec>,
}

impl TreeSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse record tree")
    }

    /// Start the tree on `ctx` and return the root handle
    pub fn launch(&self, ctx: &RunContext) -> std::result::Result<RelayHandle, RelayError> {
        let root = RelayHandle::root(TreeOp, State::new(), ctx)?;
        for record in &self.records {
            record.chain(&root)?;
        }
        root.call("finish", State::new())
    }
}

impl RecordSpec {
    fn args(&self) -> State {
        let mut args = self.values.clone();
        args.insert(TYPE_KEY.to_string(), json!(self.record_type));
        if let Some(reference) = &self.reference {
            args.insert(REF_KEY.to_string(), json!(reference));
        }
        if let Some(replaces) = &self.replaces {
            args.insert(REPLACES_KEY.to_string(), json!(replaces));
        }
        if !self.required.is_empty() {
            args.insert(REQUIRED_KEY.to_string(), json!(self.required));
        }
        args
    }

    fn chain(&self, parent: &RelayHandle) -> std::result::Result<RelayHandle, RelayError> {
        let record = parent.call("record", self.args())?;

        // Calls on a field go to its record
        let mut cursor = record.clone();
        for (name, value) in &self.fields {
            let mut args = State::new();
            args.insert("name".to_string(), json!(name));
            args.insert("value".to_string(), value.clone());
            cursor = cursor.call("field", args)?;
        }

        for child in &self.children {
            child.chain(&record)?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(value: Value) -> State {
        match value {
            Value::Object(map) => map,
            _ => State::new(),
        }
    }

    #[test]
    fn test_missing_fields_treats_blank_as_missing() {
        let s = state(json!({
            "$required": ["Name", "Phone", "Site"],
            "Name": "Acme",
            "Phone": "  ",
        }));
        assert_eq!(missing_fields(&s), vec!["Phone", "Site"]);
    }

    #[test]
    fn test_record_readiness() {
        let op = RecordOp;
        let incomplete = state(json!({"$type": "Account", "$required": ["Name"]}));
        assert!(matches!(
            op.ready(&incomplete),
            Readiness::NotReady(Reason::Structured(_))
        ));

        let declined = state(json!({"$type": "Account", "$confirm": false}));
        assert_eq!(
            op.ready(&declined),
            Readiness::not_ready("cancelled at confirmation")
        );
    }

    #[test]
    fn test_record_prompt_plan_skips_satisfied_batch() {
        let mut plan = RecordOp.prompts().unwrap();
        let complete = state(json!({"$type": "Account", "$required": ["Name"], "Name": "Acme"}));

        let batch = plan.next_batch(&complete).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, CONFIRM_KEY);
        assert!(plan.next_batch(&complete).is_none());
    }

    #[test]
    fn test_tree_spec_parsing() {
        let spec = TreeSpec::from_yaml(
            r#"
records:
  - type: Account
    ref: acme
    required: [Name]
    values:
      Name: Acme
    fields:
      Industry: Tech
    children:
      - type: Contact
        fields:
          LastName: Doe
"#,
        )
        .unwrap();

        let account = &spec.records[0];
        assert_eq!(account.reference.as_deref(), Some("acme"));
        assert_eq!(account.children[0].record_type, "Contact");

        let args = account.args();
        assert_eq!(args[TYPE_KEY], json!("Account"));
        assert_eq!(args[REQUIRED_KEY], json!(["Name"]));
        assert_eq!(args["Name"], json!("Acme"));
    }

    #[tokio::test]
    async fn test_launch_builds_nested_payload() {
        let spec = TreeSpec::from_yaml(
            r#"
records:
  - type: Account
    ref: acme
    values: { Name: Acme }
    fields: { Industry: Tech, Rating: Hot }
    children:
      - type: Contact
        values: { LastName: Doe }
"#,
        )
        .unwrap();

        let ctx = RunContext::default();
        let root = spec.launch(&ctx).unwrap();
        assert!(root.is_root());

        let payload = root.done().await.unwrap();
        let account = &payload["records"][0];
        assert_eq!(account["referenceId"], json!("acme"));
        assert_eq!(account["fields"]["Industry"], json!("Tech"));
        assert_eq!(account["fields"]["Rating"], json!("Hot"));
        assert_eq!(account["children"][0]["referenceId"], json!("Contact_0"));

        assert_eq!(ctx.registry().resolve("acme"), Some(account.clone()));
        assert!(ctx.registry().pending().is_empty());
    }
}
