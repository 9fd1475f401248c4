use serde::{Deserialize, Serialize};

/// A Source Map v3 document
/// https://sourcemaps.info/spec.html
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources_content: Vec<Option<String>>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub mappings: String,
}

impl SourceMap {
    /// Parse a source map from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Generate the inline source map data URI
    pub fn to_data_uri(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, json.as_bytes());
        Ok(format!(
            "data:application/json;charset=utf-8;base64,{}",
            encoded
        ))
    }

    /// Generate the source mapping URL comment for JavaScript
    pub fn to_comment(&self) -> Result<String, serde_json::Error> {
        let data_uri = self.to_data_uri()?;
        Ok(format!("//# sourceMappingURL={}", data_uri))
    }

    /// Move every mapping down by `lines` generated lines.
    ///
    /// Each generated line is one `;`-separated group in the mappings string,
    /// so prepending empty groups is enough; segment deltas are relative to
    /// the previous segment and stay valid.
    pub fn shift_lines(&mut self, lines: usize) {
        if lines == 0 {
            return;
        }
        let mut shifted = String::with_capacity(self.mappings.len() + lines);
        shifted.extend(std::iter::repeat(';').take(lines));
        shifted.push_str(&self.mappings);
        self.mappings = shifted;
    }

    /// Replace the source list with a single source whose content is embedded.
    pub fn embed_single_source(&mut self, source: impl Into<String>, content: impl Into<String>) {
        self.sources = vec![source.into()];
        self.sources_content = vec![Some(content.into())];
    }

    /// `sources` and `sourcesContent` line up whenever content is embedded.
    pub fn is_consistent(&self) -> bool {
        self.sources_content.is_empty() || self.sources_content.len() == self.sources.len()
    }

    /// Number of leading generated lines that carry no mapping.
    pub fn leading_empty_lines(&self) -> usize {
        self.mappings.chars().take_while(|c| *c == ';').count()
    }
}
