//! The edit page served at `/` and `/s/{name}`
//!
//! A single HTML page with three placeholders: `{{base_url}}`, `{{conf}}` and
//! `{{def}}`. Substituted values are HTML-escaped. A replacement template can
//! be loaded from disk at startup; there is no template engine.

use crate::pair::ConfigurationPair;
use anyhow::Context;
use std::path::Path;

const BASE_URL_PLACEHOLDER: &str = "{{base_url}}";
const CONF_PLACEHOLDER: &str = "{{conf}}";
const DEF_PLACEHOLDER: &str = "{{def}}";

const BUILTIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Gateway Playground</title>
<style>
body { font-family: sans-serif; margin: 2em; }
textarea { width: 100%; height: 16em; font-family: monospace; }
pre { background: #f4f4f4; padding: 1em; max-height: 24em; overflow: auto; }
</style>
</head>
<body>
<h1>Gateway Playground</h1>
<form id="pair">
<h2>Gateway config</h2>
<textarea name="conf">{{conf}}</textarea>
<h2>API definition</h2>
<textarea name="def">{{def}}</textarea>
<p>
<button type="button" onclick="send('/restart')">Restart</button>
<button type="button" onclick="send('/share')">Share</button>
<button type="button" onclick="refreshOutput()">Refresh output</button>
</p>
</form>
<p id="result"></p>
<h2>Output</h2>
<pre id="output"></pre>
<script>
var baseURL = "{{base_url}}";
function send(path) {
  var body = new URLSearchParams(new FormData(document.getElementById("pair")));
  fetch(baseURL + path, {method: "POST", body: body})
    .then(function (resp) { return resp.text(); })
    .then(function (text) {
      document.getElementById("result").textContent = text;
      setTimeout(refreshOutput, 500);
    });
}
function refreshOutput() {
  fetch(baseURL + "/output")
    .then(function (resp) { return resp.text(); })
    .then(function (text) { document.getElementById("output").textContent = text; });
}
setTimeout(refreshOutput, 500);
</script>
</body>
</html>
"#;

/// Page template with placeholder substitution
#[derive(Debug, Clone)]
pub struct PageTemplate {
    source: String,
}

impl Default for PageTemplate {
    fn default() -> Self {
        Self {
            source: BUILTIN_TEMPLATE.to_string(),
        }
    }
}

impl PageTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Read a replacement template from disk
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read page template {}", path.display()))?;
        Ok(Self { source })
    }

    /// Render the page for `pair`, linking back to `base_url`
    pub fn render(&self, base_url: &str, pair: &ConfigurationPair) -> String {
        // Single pass, so placeholder text inside a value is never expanded
        let mut out = String::with_capacity(self.source.len() + pair.conf.len() + pair.def.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];

            let (value, len) = if tail.starts_with(BASE_URL_PLACEHOLDER) {
                (Some(base_url), BASE_URL_PLACEHOLDER.len())
            } else if tail.starts_with(CONF_PLACEHOLDER) {
                (Some(pair.conf.as_str()), CONF_PLACEHOLDER.len())
            } else if tail.starts_with(DEF_PLACEHOLDER) {
                (Some(pair.def.as_str()), DEF_PLACEHOLDER.len())
            } else {
                (None, 2)
            };

            match value {
                Some(value) => escape_html_into(value, &mut out),
                None => out.push_str("{{"),
            }
            rest = &tail[len..];
        }

        out.push_str(rest);
        out
    }
}

fn escape_html_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}
