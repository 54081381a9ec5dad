//! Widget templates and the data context handed to them.
//!
//! Templates come from the external template store and are hostile
//! input: they are validated for size here and only ever embedded as
//! text by the document builder.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::TemplateLimits;

/// Rejection reasons, rendered as the short codes the settings UI maps
/// to localized strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("id_required")]
    IdRequired,
    #[error("id_invalid")]
    IdInvalid,
    #[error("name_required")]
    NameRequired,
    #[error("{0}_too_large")]
    TooLarge(&'static str),
    #[error("params_invalid")]
    ParamsInvalid,
    #[error("height_invalid")]
    HeightInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetTemplate {
    pub id: String,
    pub name: String,
    pub html: String,
    pub css: String,
    pub js: String,
    pub params: Value,
    /// Fixed height; when absent the guest reports its own height.
    pub height_px: Option<u32>,
}

impl Default for WidgetTemplate {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            html: String::new(),
            css: String::new(),
            js: String::new(),
            params: Value::Object(serde_json::Map::new()),
            height_px: None,
        }
    }
}

const MAX_ID_LEN: usize = 64;

fn normalize_id(raw: &str) -> Result<String, TemplateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TemplateError::IdRequired);
    }
    if trimmed.len() > MAX_ID_LEN
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TemplateError::IdInvalid);
    }
    Ok(trimmed.to_string())
}

fn normalize_name(raw: &str, max_chars: usize) -> Result<String, TemplateError> {
    let out: String = raw.trim().chars().take(max_chars).collect();
    if out.is_empty() {
        return Err(TemplateError::NameRequired);
    }
    Ok(out)
}

fn validate_size(label: &'static str, value: &str, max: usize) -> Result<(), TemplateError> {
    if value.chars().count() > max {
        return Err(TemplateError::TooLarge(label));
    }
    Ok(())
}

impl WidgetTemplate {
    /// Validates against `limits` and returns a normalized copy
    /// (trimmed id, trimmed and truncated name).
    pub fn normalized(&self, limits: &TemplateLimits) -> Result<WidgetTemplate, TemplateError> {
        let id = normalize_id(&self.id)?;
        let name = normalize_name(&self.name, limits.max_name_chars)?;
        validate_size("html", &self.html, limits.max_html_chars)?;
        validate_size("css", &self.css, limits.max_css_chars)?;
        validate_size("js", &self.js, limits.max_js_chars)?;
        let params =
            serde_json::to_string(&self.params).map_err(|_| TemplateError::ParamsInvalid)?;
        validate_size("params", &params, limits.max_params_chars)?;
        if let Some(h) = self.height_px {
            if h < limits.min_height_px || h > limits.max_height_px {
                return Err(TemplateError::HeightInvalid);
            }
        }

        Ok(WidgetTemplate {
            id,
            name,
            ..self.clone()
        })
    }

    /// Two templates share an identity when a mounted sandbox built from
    /// one could keep serving the other. Any content change means a new
    /// session and a new token.
    pub fn same_identity(&self, other: &WidgetTemplate) -> bool {
        self.id == other.id
            && self.html == other.html
            && self.css == other.css
            && self.js == other.js
            && self.height_px == other.height_px
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsRange {
    #[default]
    Today,
    All,
}

/// The `data` object delivered in every `update`, produced by the
/// statistics aggregation collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetDataContext {
    pub stats: Value,
    pub settings: Value,
    pub all_days: Value,
    pub aggregates: Value,
    pub range: StatsRange,
}

impl WidgetDataContext {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> WidgetTemplate {
        WidgetTemplate {
            id: "cw_1700000000000_deadbeef".into(),
            name: "Keys today".into(),
            html: "<div id='v'></div>".into(),
            js: "window.render = function () {};".into(),
            ..WidgetTemplate::default()
        }
    }

    #[test]
    fn test_valid_template_passes() {
        let t = template().normalized(&TemplateLimits::default()).unwrap();
        assert_eq!(t.name, "Keys today");
    }

    #[test]
    fn test_name_trimmed_and_truncated() {
        let mut t = template();
        t.name = format!("  {}  ", "x".repeat(100));
        let t = t.normalized(&TemplateLimits::default()).unwrap();
        assert_eq!(t.name.chars().count(), 64);
    }

    #[test]
    fn test_blank_name_rejected() {
        let mut t = template();
        t.name = "   ".into();
        assert_eq!(
            t.normalized(&TemplateLimits::default()),
            Err(TemplateError::NameRequired)
        );
    }

    #[test]
    fn test_id_rules() {
        let limits = TemplateLimits::default();
        let mut t = template();
        t.id = "".into();
        assert_eq!(t.normalized(&limits), Err(TemplateError::IdRequired));
        t.id = "../etc/passwd".into();
        assert_eq!(t.normalized(&limits), Err(TemplateError::IdInvalid));
        t.id = "a".repeat(65);
        assert_eq!(t.normalized(&limits), Err(TemplateError::IdInvalid));
        t.id = " ok-id_1 ".into();
        assert_eq!(t.normalized(&limits).unwrap().id, "ok-id_1");
    }

    #[test]
    fn test_oversized_js_rejected() {
        let mut t = template();
        t.js = "a".repeat(50_001);
        let err = t.normalized(&TemplateLimits::default()).unwrap_err();
        assert_eq!(err, TemplateError::TooLarge("js"));
        assert_eq!(err.to_string(), "js_too_large");
    }

    #[test]
    fn test_oversized_params_rejected() {
        let mut t = template();
        t.params = json!({"blob": "p".repeat(20_001)});
        assert_eq!(
            t.normalized(&TemplateLimits::default()),
            Err(TemplateError::TooLarge("params"))
        );
    }

    #[test]
    fn test_height_bounds() {
        let limits = TemplateLimits::default();
        let mut t = template();
        t.height_px = Some(10);
        assert_eq!(t.normalized(&limits), Err(TemplateError::HeightInvalid));
        t.height_px = Some(6_001);
        assert_eq!(t.normalized(&limits), Err(TemplateError::HeightInvalid));
        t.height_px = Some(240);
        assert!(t.normalized(&limits).is_ok());
    }

    #[test]
    fn test_identity_ignores_name_and_params() {
        let a = template();
        let mut b = template();
        b.name = "Renamed".into();
        b.params = json!({"x": 1});
        assert!(a.same_identity(&b));
        b.js.push(';');
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn test_template_from_store_json() {
        let t: WidgetTemplate = serde_json::from_value(json!({
            "id": "cw_1",
            "name": "n",
            "html": "<b>hi</b>",
            "height_px": 120,
            "created_at_ms": 5
        }))
        .unwrap();
        assert_eq!(t.height_px, Some(120));
        assert_eq!(t.params, json!({}));
    }

    #[test]
    fn test_data_context_wire_names() {
        let ctx = WidgetDataContext {
            all_days: json!([1, 2]),
            range: StatsRange::All,
            ..WidgetDataContext::default()
        };
        let value = ctx.to_value();
        assert_eq!(value["allDays"], json!([1, 2]));
        assert_eq!(value["range"], json!("all"));
    }
}
