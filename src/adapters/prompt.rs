//! Prompt descriptors, prompt plans and prompt providers.
//!
//! An operation describes the input it needs as a lazy sequence of prompt
//! batches (`PromptPlan`). The engine asks a `PromptProvider` for each batch
//! and merges the answers into the operation's state before pulling the next
//! batch, so later batches can depend on earlier answers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::domain::State;

/// Answers returned for one batch, keyed by prompt name
pub type Answers = State;

/// Check applied to an answer before it is accepted
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Rewrite applied to an accepted answer
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Kind of input a prompt asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Free text
    Input,

    /// Yes/no
    Confirm,

    /// Numeric value
    Number,

    /// One of a fixed set of choices
    Select,
}

/// A single question
#[derive(Clone)]
pub struct Prompt {
    pub name: String,
    pub kind: PromptKind,
    pub message: String,
    pub default: Option<Value>,
    pub choices: Vec<String>,
    validators: Vec<Validator>,
    transforms: Vec<Transform>,
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("default", &self.default)
            .field("choices", &self.choices)
            .field("validators", &self.validators.len())
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

impl Prompt {
    fn new(kind: PromptKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            message: message.into(),
            default: None,
            choices: Vec::new(),
            validators: Vec::new(),
            transforms: Vec::new(),
        }
    }

    pub fn input(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(PromptKind::Input, name, message)
    }

    pub fn confirm(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(PromptKind::Confirm, name, message)
    }

    pub fn number(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(PromptKind::Number, name, message)
    }

    pub fn select<I, S>(name: impl Into<String>, message: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prompt = Self::new(PromptKind::Select, name, message);
        prompt.choices = choices.into_iter().map(Into::into).collect();
        prompt
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(check));
        self
    }

    pub fn transform<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.push(Arc::new(rewrite));
        self
    }

    /// Coerce a raw answer to this prompt's kind, run validators, then transforms.
    pub fn accept(&self, raw: Value) -> Result<Value, String> {
        let value = self.coerce(raw)?;
        for check in &self.validators {
            check(&value)?;
        }
        Ok(self
            .transforms
            .iter()
            .fold(value, |value, rewrite| rewrite(value)))
    }

    fn coerce(&self, raw: Value) -> Result<Value, String> {
        match (self.kind, raw) {
            (PromptKind::Confirm, Value::Bool(b)) => Ok(Value::Bool(b)),
            (PromptKind::Confirm, Value::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "y" | "yes" | "true" => Ok(Value::Bool(true)),
                    "n" | "no" | "false" => Ok(Value::Bool(false)),
                    _ => Err(format!("'{}' expects yes or no, got '{}'", self.name, s)),
                }
            }
            (PromptKind::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (PromptKind::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(|n| match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Value::from(f as i64)
                    }
                    _ => Value::Number(n),
                })
                .ok_or_else(|| format!("'{}' expects a number, got '{}'", self.name, s)),
            (PromptKind::Select, Value::String(s)) => {
                if self.choices.iter().any(|c| c == &s) {
                    Ok(Value::String(s))
                } else {
                    Err(format!(
                        "'{}' must be one of [{}], got '{}'",
                        self.name,
                        self.choices.join(", "),
                        s
                    ))
                }
            }
            (PromptKind::Input, value) => Ok(value),
            (kind, value) => Err(format!(
                "'{}' cannot accept {} as {:?}",
                self.name, value, kind
            )),
        }
    }
}

/// One unit of input request
pub type PromptBatch = Vec<Prompt>;

/// Lazy, finite, forward-only sequence of prompt batches.
///
/// `next_batch` sees the state with all previous answers merged in.
pub trait PromptPlan: Send {
    fn next_batch(&mut self, state: &State) -> Option<PromptBatch>;
}

impl<F> PromptPlan for F
where
    F: FnMut(&State) -> Option<PromptBatch> + Send,
{
    fn next_batch(&mut self, state: &State) -> Option<PromptBatch> {
        self(state)
    }
}

/// Fixed list of batches, yielded in order
#[derive(Debug, Default)]
pub struct BatchQueue {
    batches: VecDeque<PromptBatch>,
}

impl BatchQueue {
    pub fn new(batches: impl IntoIterator<Item = PromptBatch>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

impl PromptPlan for BatchQueue {
    fn next_batch(&mut self, _state: &State) -> Option<PromptBatch> {
        self.batches.pop_front()
    }
}

/// Source of answers for prompt batches
#[async_trait]
pub trait PromptProvider: Send + Sync {
    /// Answer every prompt in the batch
    async fn ask(&self, batch: &PromptBatch) -> Result<Answers>;
}

/// Answers prompts from a prepared script instead of a human.
///
/// Keyed answers win; otherwise the prompt's default is used.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    script: Mutex<Script>,
}

#[derive(Debug, Default)]
struct Script {
    answers: HashMap<String, VecDeque<Value>>,
    asked: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for a prompt name. Repeated names are answered in order.
    pub fn answer(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.lock()
            .answers
            .entry(name.into())
            .or_default()
            .push_back(value.into());
        self
    }

    /// Build from a YAML/JSON mapping of prompt name to answer
    pub fn from_map(answers: State) -> Self {
        answers
            .into_iter()
            .fold(Self::new(), |prompter, (name, value)| prompter.answer(name, value))
    }

    /// Prompt names asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.lock().asked.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PromptProvider for ScriptedPrompter {
    async fn ask(&self, batch: &PromptBatch) -> Result<Answers> {
        let mut script = self.lock();
        let mut answers = Answers::new();

        for prompt in batch {
            script.asked.push(prompt.name.clone());
            let raw = script
                .answers
                .get_mut(&prompt.name)
                .and_then(VecDeque::pop_front)
                .or_else(|| prompt.default.clone())
                .with_context(|| format!("No scripted answer for prompt '{}'", prompt.name))?;

            let value = prompt.accept(raw).map_err(anyhow::Error::msg)?;
            answers.insert(prompt.name.clone(), value);
        }

        Ok(answers)
    }
}

/// Reads one answer per line from stdin, writing questions to stderr.
///
/// Invalid answers are asked again; an empty line takes the default.
pub struct LinePrompter {
    lines: AsyncMutex<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
}

impl Default for LinePrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl LinePrompter {
    pub fn new() -> Self {
        Self {
            lines: AsyncMutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl PromptProvider for LinePrompter {
    async fn ask(&self, batch: &PromptBatch) -> Result<Answers> {
        let mut lines = self.lines.lock().await;
        let mut stderr = tokio::io::stderr();
        let mut answers = Answers::new();

        for prompt in batch {
            loop {
                let hint = match (&prompt.default, prompt.kind) {
                    (Some(default), _) => format!(" [{}]", default),
                    (None, PromptKind::Select) => format!(" ({})", prompt.choices.join("/")),
                    (None, PromptKind::Confirm) => " (y/n)".to_string(),
                    _ => String::new(),
                };
                stderr
                    .write_all(format!("? {}{}: ", prompt.message, hint).as_bytes())
                    .await?;
                stderr.flush().await?;

                let line = lines
                    .next_line()
                    .await?
                    .with_context(|| format!("Input closed while asking '{}'", prompt.name))?;

                let raw = if line.trim().is_empty() {
                    match &prompt.default {
                        Some(default) => default.clone(),
                        None => Value::String(String::new()),
                    }
                } else {
                    Value::String(line.trim().to_string())
                };

                match prompt.accept(raw) {
                    Ok(value) => {
                        answers.insert(prompt.name.clone(), value);
                        break;
                    }
                    Err(message) => {
                        stderr.write_all(format!("  {}\n", message).as_bytes()).await?;
                    }
                }
            }
        }

        Ok(answers)
    }
}
