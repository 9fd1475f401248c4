use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// How a component is rendered and wrapped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentOptions {
    /// Id of the container element (generated when absent)
    pub container_id: Option<String>,
    /// Tag of the container element (default: `div`)
    pub container_tag: Option<String>,
    pub container_class: Option<String>,
    /// Skip server rendering; the client renders into an empty container
    pub client_only: bool,
    /// Render static markup and emit no client script
    pub server_only: bool,
}

/// A component registered with a render environment
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: String,
    pub props: Value,
    pub container_id: String,
    pub container_tag: String,
    pub container_class: Option<String>,
    pub client_only: bool,
    pub server_only: bool,
}

impl Component {
    pub fn new(name: &str, props: Value, options: ComponentOptions) -> Result<Self> {
        validate_name(name)?;
        let container_tag = match options.container_tag {
            Some(tag) => {
                validate_tag(&tag)?;
                tag
            }
            None => "div".to_string(),
        };
        let container_id = options.container_id.unwrap_or_else(|| {
            format!(
                "jsrender_{}",
                NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed)
            )
        });
        Ok(Self {
            name: name.to_string(),
            props,
            container_id,
            container_tag,
            container_class: options.container_class,
            client_only: options.client_only,
            server_only: options.server_only,
        })
    }

    /// Wrap rendered HTML in the component's container element
    pub fn wrap(&self, inner_html: &str) -> String {
        let class = match &self.container_class {
            Some(class) => format!(" class=\"{}\"", escape_attribute(class)),
            None => String::new(),
        };
        format!(
            "<{tag} id=\"{id}\"{class}>{html}</{tag}>",
            tag = self.container_tag,
            id = escape_attribute(&self.container_id),
            class = class,
            html = inner_html
        )
    }

    /// Client script that hydrates the server markup, or renders from
    /// scratch for client-only components
    pub fn render_javascript(&self) -> Result<String> {
        let method = if self.client_only {
            "ReactDOM.render"
        } else {
            "ReactDOM.hydrate"
        };
        Ok(format!(
            "{}(React.createElement({}, {}), document.getElementById({}))",
            method,
            self.name,
            script_json(&self.props)?,
            script_json(&Value::from(self.container_id.as_str()))?
        ))
    }
}

/// Component names are dotted JavaScript identifiers (`App`, `Components.Nav`)
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => chars
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
                _ => false,
            }
        });
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidComponentName(name.to_string()))
    }
}

/// Container tags are plain element names (`div`, `my-widget`)
fn validate_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid = chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidContainerTag(tag.to_string()))
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// JSON that is safe to embed in a `<script>` block
fn script_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}
