use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TemplateError;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}|[{}]")
        .expect("placeholder pattern is valid")
});

/// What the caller asks: literal text, or variables for the prompt template.
#[derive(Clone, Debug, PartialEq)]
pub enum Prompt {
    Text(String),
    Vars(Map<String, Value>),
}

impl Prompt {
    /// Collects template variables. Fails if a value cannot be represented
    /// as JSON.
    pub fn vars<K, V, I>(vars: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Serialize,
    {
        vars.into_iter()
            .map(|(key, value)| {
                let name = key.into();
                match serde_json::to_value(value) {
                    Ok(value) => Ok((name, value)),
                    Err(err) => Err(TemplateError::InvalidVariable {
                        name,
                        message: err.to_string(),
                    }),
                }
            })
            .collect::<Result<Map<_, _>, _>>()
            .map(Prompt::Vars)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Map<String, Value>> for Prompt {
    fn from(vars: Map<String, Value>) -> Self {
        Prompt::Vars(vars)
    }
}

impl<V: Serialize> TryFrom<HashMap<String, V>> for Prompt {
    type Error = TemplateError;

    fn try_from(vars: HashMap<String, V>) -> Result<Self, Self::Error> {
        Prompt::vars(vars)
    }
}

impl<V: Serialize> TryFrom<BTreeMap<String, V>> for Prompt {
    type Error = TemplateError;

    fn try_from(vars: BTreeMap<String, V>) -> Result<Self, Self::Error> {
        Prompt::vars(vars)
    }
}

/// Text with `{name}` placeholders. `{{` and `}}` render as literal braces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for captures in TOKEN.captures_iter(&self.source) {
            if let Some(name) = captures.get(1) {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }

    pub fn render(&self, vars: &Map<String, Value>) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.source.len());
        let mut last = 0;

        for captures in TOKEN.captures_iter(&self.source) {
            let Some(token) = captures.get(0) else {
                continue;
            };
            rendered.push_str(&self.source[last..token.start()]);
            last = token.end();

            match (token.as_str(), captures.get(1)) {
                ("{{", _) => rendered.push('{'),
                ("}}", _) => rendered.push('}'),
                (_, Some(name)) => {
                    let value = vars
                        .get(name.as_str())
                        .ok_or_else(|| TemplateError::MissingVariable(name.as_str().to_string()))?;
                    push_value(&mut rendered, value);
                }
                _ => return Err(TemplateError::UnmatchedBrace(token.start())),
            }
        }

        rendered.push_str(&self.source[last..]);
        Ok(rendered)
    }
}

impl From<&str> for PromptTemplate {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for PromptTemplate {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(text) => out.push_str(text),
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn renders_named_placeholders() {
        let template = PromptTemplate::new("Summarize: {text}");
        let rendered = template
            .render(&vars(json!({"text": "hello"})))
            .expect("renders");

        assert_eq!(rendered, "Summarize: hello");
    }

    #[test]
    fn missing_variable_fails() {
        let template = PromptTemplate::new("Summarize: {text}");
        let err = template.render(&Map::new()).expect_err("text missing");

        assert_eq!(err, TemplateError::MissingVariable("text".to_string()));
    }

    #[test]
    fn extra_keys_are_ignored_and_values_render_as_json() {
        let template = PromptTemplate::new("What is the {statistic} of these numbers: {numbers}?");
        let rendered = template
            .render(&vars(json!({
                "statistic": "average",
                "numbers": [10.5, 20.3],
                "unused": true
            })))
            .expect("renders");

        assert_eq!(rendered, "What is the average of these numbers: [10.5,20.3]?");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let template = PromptTemplate::new("{{\"key\": {value}}}");
        let rendered = template
            .render(&vars(json!({"value": 1})))
            .expect("renders");

        assert_eq!(rendered, "{\"key\": 1}");
        assert_eq!(template.placeholders(), vec!["value"]);
    }

    #[test]
    fn stray_brace_is_rejected() {
        let template = PromptTemplate::new("broken {value");
        let err = template
            .render(&vars(json!({"value": 1})))
            .expect_err("unterminated");

        assert_eq!(err, TemplateError::UnmatchedBrace(7));
    }

    #[test]
    fn prompt_from_hash_map_serializes_values() {
        let mut map = HashMap::new();
        map.insert("count".to_string(), 3);

        let Prompt::Vars(vars) = Prompt::try_from(map).expect("values serialize") else {
            panic!("expected vars");
        };
        assert_eq!(vars.get("count"), Some(&json!(3)));
    }

    #[test]
    fn unserializable_variable_is_rejected() {
        let pairs = BTreeMap::from([((1, 2), 3)]);

        let err = Prompt::vars([("pairs", pairs)]).expect_err("tuple keys are not JSON");
        assert!(matches!(
            err,
            TemplateError::InvalidVariable { ref name, .. } if name == "pairs"
        ));
    }
}
