//! Model cards: a README with optional YAML front matter.

use std::collections::BTreeMap;

/// Parsed model card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelCard {
    /// Front matter fields, in key order
    pub data: BTreeMap<String, serde_json::Value>,
    /// Markdown body after the front matter
    pub text: String,
}

impl ModelCard {
    /// Split `---` delimited front matter from the body.
    ///
    /// A README without front matter yields empty `data` and the whole input
    /// as `text`. Front matter that is not a YAML mapping is treated as empty.
    pub fn parse(content: &str) -> Self {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let Some((front, body)) = split_front_matter(content) else {
            return Self {
                data: BTreeMap::new(),
                text: content.to_string(),
            };
        };

        let data = match serde_yaml::from_str::<serde_json::Value>(front) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            Ok(serde_json::Value::Null) => BTreeMap::new(),
            Ok(_) | Err(_) => {
                tracing::debug!("Ignoring model card front matter that is not a mapping");
                BTreeMap::new()
            }
        };

        Self {
            data,
            text: body.to_string(),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body.trim_start_matches(['\r', '\n'])));
        }
        offset += line.len();
    }
    None
}
