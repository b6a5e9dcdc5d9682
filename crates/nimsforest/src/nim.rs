//! Nim: wind-to-wind AI processor.
//!
//! A nim subscribes to a wind subject, renders its prompt template against
//! the decoded input object, asks the configured asker, and publishes the
//! result. The publish subject may contain `{field}` placeholders filled
//! from the output at publish time; missing fields leave the placeholder
//! intact.
//!
//! Templates are Go-style `{{ .field }}` dot-path substitutions — no loops,
//! no conditionals. An unknown path is a render error and drops the message.
//!
//! If a journal is attached, the nim records an `update` slot in humus for
//! any input carrying an entity id (`id`, `contact_id`, or `entity_id`, in
//! that order). Journal failures are warnings, never fatal.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use nimsforest_types::{Leaf, subject};
use serde_json::Value;
use tracing::warn;

use crate::asker::Asker;
use crate::cancel::CancelToken;
use crate::config::NimConfig;
use crate::humus::Humus;
use crate::wind::{Subscription, Wind};

/// Keys probed, in order, for the journaled entity id.
const ENTITY_ID_KEYS: &[&str] = &["id", "contact_id", "entity_id"];

pub struct Nim {
    name: String,
    subscribes: String,
    publishes: String,
    template: String,
    asker: Arc<dyn Asker>,
    wind: Wind,
    journal: Option<Humus>,
    subscription: Option<Subscription>,
}

impl Nim {
    pub fn new(
        config: &NimConfig,
        wind: Wind,
        asker: Arc<dyn Asker>,
        journal: Option<Humus>,
    ) -> Result<Self> {
        let template = std::fs::read_to_string(&config.prompt)
            .with_context(|| format!("failed to read prompt {}", config.prompt.display()))?;
        Ok(Self {
            name: config.name.clone(),
            subscribes: config.subscribes.clone(),
            publishes: config.publishes.clone(),
            template,
            asker,
            wind,
            journal,
            subscription: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribes(&self) -> &str {
        &self.subscribes
    }

    pub fn publishes(&self) -> &str {
        &self.publishes
    }

    pub fn start(&mut self, _cancel: CancelToken) -> Result<()> {
        let name = self.name.clone();
        let publishes = self.publishes.clone();
        let template = self.template.clone();
        let asker = Arc::clone(&self.asker);
        let wind = self.wind.clone();
        let journal = self.journal.clone();

        let subscription = self.wind.catch(&self.subscribes, move |leaf| {
            let input: Value = match leaf.json() {
                Ok(v) => v,
                Err(e) => {
                    warn!(nim = %name, subject = %leaf.subject, "dropping non-JSON leaf: {}", e);
                    return Ok(());
                }
            };

            let prompt = match render_template(&template, &input) {
                Ok(p) => p,
                Err(e) => {
                    warn!(nim = %name, "dropping leaf, template render failed: {:#}", e);
                    return Ok(());
                }
            };

            let response = match asker.ask(&prompt) {
                Ok(r) => r,
                Err(e) => {
                    warn!(nim = %name, "dropping leaf, asker failed: {:#}", e);
                    return Ok(());
                }
            };

            let output = parse_response(&response);
            let effective_subject = subject::interpolate(&publishes, &output);
            let data = match serde_json::to_vec(&output) {
                Ok(d) => d,
                Err(e) => {
                    warn!(nim = %name, "dropping leaf, unserializable output: {}", e);
                    return Ok(());
                }
            };

            if let Err(e) = wind.drop_leaf(Leaf::new(
                effective_subject,
                data,
                format!("nim:{}", name),
            )) {
                warn!(nim = %name, "publish failed, leaf lost: {:#}", e);
                return Ok(());
            }

            if let Some(journal) = &journal {
                if let Some(entity_id) = entity_id(&input) {
                    if let Err(e) = journal.append(
                        &format!("nim:{}", name),
                        &entity_id,
                        "update",
                        output,
                    ) {
                        warn!(nim = %name, entity_id = %entity_id, "journal append failed: {:#}", e);
                    }
                }
            }
            Ok(())
        })?;
        self.subscription = Some(subscription);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl std::fmt::Debug for Nim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nim").field("name", &self.name).finish()
    }
}

/// Parse the asker response: a JSON object passes through, anything else —
/// scalars, arrays, unparseable text — wraps as `{"response": <raw>}`.
fn parse_response(response: &str) -> Value {
    match serde_json::from_str::<Value>(response) {
        Ok(v @ Value::Object(_)) => v,
        _ => serde_json::json!({ "response": response }),
    }
}

/// First entity id found in the input under the well-known keys, rendered as
/// a string.
fn entity_id(input: &Value) -> Option<String> {
    let obj = input.as_object()?;
    for key in ENTITY_ID_KEYS {
        match obj.get(*key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => continue,
        }
    }
    None
}

/// Render a Go-style `{{ .path.to.field }}` template against a JSON value.
///
/// Only dot-path substitution is supported. An unknown path is an error;
/// strings render bare, scalars via their display form, and composite values
/// as compact JSON.
pub fn render_template(template: &str, input: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 2..];
        let close = match tail.find("}}") {
            Some(c) => c,
            None => bail!("unclosed {{{{ in template"),
        };
        let expr = tail[..close].trim();
        let path = expr
            .strip_prefix('.')
            .with_context(|| format!("unsupported template expression {:?}", expr))?;
        let value = lookup_path(input, path)
            .with_context(|| format!("template field .{} not found", path))?;
        out.push_str(&render_value(value)?);
        rest = &tail[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup_path<'a>(input: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(input);
    }
    let mut current = input;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn render_value(value: &Value) -> Result<String> {
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        composite => serde_json::to_string(composite).context("failed to render template value")?,
    })
}
