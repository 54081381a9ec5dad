//! Sandbox document builder.
//!
//! Turns a [`WidgetTemplate`] into a self-contained HTML document that is
//! loaded with `sandbox="allow-scripts"` (no `allow-same-origin`). The
//! document carries a fixed CSP, the guest runtime script, the guest's
//! own markup/style/script, and nothing else from the host.
use serde_json::json;
use thiserror::Error;

use crate::config::Config;
use crate::host::session::SessionToken;
use crate::sandbox::template::WidgetTemplate;

/// Fixed, non-configurable Content-Security-Policy of every guest document.
pub const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; style-src 'unsafe-inline'; \
img-src data: blob:; font-src data:; script-src 'unsafe-inline'; connect-src 'none'; \
frame-src 'none'; object-src 'none'; base-uri 'none'; form-action 'none'";

/// Value of the iframe `sandbox` attribute.
pub const SANDBOX_ATTRIBUTE: &str = "allow-scripts";

/// Host bridge globals removed before guest code runs.
pub const PRIVILEGED_GLOBALS: &[&str] = &[
    "__TAURI__",
    "__TAURI_INTERNALS__",
    "__TAURI_IPC__",
    "__TAURI_METADATA__",
    "__TAURI_POST_MESSAGE__",
    "ipc",
    "chrome.webview",
    "webkit.messageHandlers",
];

/// Element id of the container guest markup is placed in.
pub const ROOT_ID: &str = "widget-root";

/// Global through which the last bootstrap script starts the runtime.
const START_HOOK: &str = "__widgetSandboxStart";

/// Glyph that replaces digits when a capture hides numbers.
pub const DIGIT_MASK: char = '\u{2022}';

const GUEST_RUNTIME: &str = include_str!("guest_runtime.js");
const CONFIG_PLACEHOLDER: &str = "/*__WIDGET_CONFIG__*/null";

const BASE_CSS: &str = "html,body{margin:0;padding:0;background:transparent;}\
#widget-root{box-sizing:border-box;overflow:hidden;}";
const FIXED_HEIGHT_CSS: &str = "html,body,#widget-root{height:100%;}";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Escaping left a sequence that could close the enclosing tag.
    #[error("guest {field} still contains a closing tag after escaping")]
    Unescaped { field: &'static str },
}

/// Runtime knobs baked into the guest bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOptions {
    pub ready_pulse_ms: u64,
    pub min_pixel_ratio: f64,
    pub max_pixel_ratio: f64,
    pub max_canvas_px: u32,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for DocumentOptions {
    fn from(config: &Config) -> Self {
        Self {
            ready_pulse_ms: config.guest.ready_pulse_ms,
            min_pixel_ratio: config.capture.min_pixel_ratio,
            max_pixel_ratio: config.capture.max_pixel_ratio,
            max_canvas_px: config.capture.max_canvas_px,
        }
    }
}

/// A built guest document plus the attributes its frame must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDocument {
    pub source: String,
    pub sandbox: &'static str,
    pub csp: &'static str,
}

/// Replaces every ASCII-case-insensitive occurrence of `needle` by
/// `replacement` followed by the original text after `keep_from`.
/// `needle` must start with `<` so matches sit on char boundaries.
fn neutralize(input: &str, needle: &str, keep_from: usize, replacement: &str) -> String {
    let bytes = input.as_bytes();
    let n = needle.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    let mut i = 0;
    while i + n.len() <= bytes.len() {
        if bytes[i] == b'<' && bytes[i..i + n.len()].eq_ignore_ascii_case(n) {
            out.push_str(&input[last..i]);
            out.push_str(replacement);
            last = i + keep_from;
            i += n.len();
        } else {
            i += 1;
        }
    }
    out.push_str(&input[last..]);
    out
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Guest script text: `</script` becomes `<\/script`, `<script` and `<!--`
/// become `\x3Cscript` and `\x3C!--`. Both read the same inside string,
/// template and regex literals; outside a literal the guest's own script
/// fails to parse, which only breaks that guest.
pub fn escape_script(js: &str) -> String {
    let s = neutralize(js, "</script", 2, "<\\/");
    let s = neutralize(&s, "<script", 1, "\\x3C");
    neutralize(&s, "<!--", 1, "\\x3C")
}

/// Guest stylesheet text.
pub fn escape_style(css: &str) -> String {
    let s = neutralize(css, "</style", 2, "<\\/");
    let s = neutralize(&s, "</script", 2, "<\\/");
    neutralize(&s, "<script", 1, "<\\")
}

/// Guest markup: script tags are turned into inert text. The runtime
/// parses the result into the root element as a fragment, so unbalanced
/// markup stays inside the root.
pub fn escape_markup(html: &str) -> String {
    let s = neutralize(html, "</script", 1, "&lt;");
    neutralize(&s, "<script", 1, "&lt;")
}

/// JSON embedded in a script block; `<` only occurs inside strings there.
fn escape_json_for_script(json: &str) -> String {
    json.replace('<', "\\u003c")
}

/// Builds the guest document for `template` bound to `token`.
///
/// `fixed_height_px` overrides the template's own height; with a fixed
/// height the root fills the frame and resize reporting is off.
pub fn build(
    template: &WidgetTemplate,
    token: &SessionToken,
    fixed_height_px: Option<u32>,
    options: &DocumentOptions,
) -> Result<SandboxDocument, BuildError> {
    let fixed_height = fixed_height_px.or(template.height_px);

    let html = escape_markup(&template.html);
    let css = escape_style(&template.css);
    let js = escape_script(&template.js);

    if contains_ci(&html, "<script") {
        return Err(BuildError::Unescaped { field: "html" });
    }
    if contains_ci(&css, "</style") || contains_ci(&css, "</script") {
        return Err(BuildError::Unescaped { field: "css" });
    }
    if contains_ci(&js, "</script") {
        return Err(BuildError::Unescaped { field: "js" });
    }

    let runtime_config = json!({
        "token": token.as_str(),
        "fixedHeight": fixed_height,
        "readyPulseMs": options.ready_pulse_ms,
        "minPixelRatio": options.min_pixel_ratio,
        "maxPixelRatio": options.max_pixel_ratio,
        "maxCanvasPx": options.max_canvas_px,
        "privilegedGlobals": PRIVILEGED_GLOBALS,
        "rootId": ROOT_ID,
        "startHook": START_HOOK,
        "mask": DIGIT_MASK.to_string(),
        "markup": html,
    });
    let runtime = GUEST_RUNTIME.replacen(
        CONFIG_PLACEHOLDER,
        &escape_json_for_script(&runtime_config.to_string()),
        1,
    );

    let fixed_css = if fixed_height.is_some() { FIXED_HEIGHT_CSS } else { "" };

    let source = format!(
        "<!DOCTYPE html>\n\
<html>\n\
<head>\n\
<meta charset=\"utf-8\">\n\
<meta http-equiv=\"Content-Security-Policy\" content=\"{CONTENT_SECURITY_POLICY}\">\n\
<style>{BASE_CSS}{fixed_css}</style>\n\
<style>{css}</style>\n\
</head>\n\
<body>\n\
<div id=\"{ROOT_ID}\"></div>\n\
<script>{runtime}</script>\n\
<script>{js}\n</script>\n\
<script>window.{START_HOOK}();</script>\n\
</body>\n\
</html>\n"
    );

    Ok(SandboxDocument {
        source,
        sandbox: SANDBOX_ATTRIBUTE,
        csp: CONTENT_SECURITY_POLICY,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SessionToken {
        SessionToken::parse("0123456789abcdef0123456789abcdef").unwrap()
    }

    fn template(html: &str, css: &str, js: &str) -> WidgetTemplate {
        WidgetTemplate {
            id: "w1".into(),
            name: "w".into(),
            html: html.into(),
            css: css.into(),
            js: js.into(),
            ..WidgetTemplate::default()
        }
    }

    fn count_ci(haystack: &str, needle: &str) -> usize {
        haystack
            .as_bytes()
            .windows(needle.len())
            .filter(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
            .count()
    }

    /// The builder emits exactly three script blocks and two style blocks.
    fn assert_tag_structure(source: &str) {
        assert_eq!(count_ci(source, "<script"), 3, "{source}");
        assert_eq!(count_ci(source, "</script"), 3, "{source}");
        assert_eq!(count_ci(source, "<style"), 2);
        assert_eq!(count_ci(source, "</style"), 2);
    }

    #[test]
    fn test_closing_script_in_js_stays_inside_block() {
        let js = "var s = \"</script><img src=x onerror=alert(1)>\"; window.render = function(){};";
        let doc = build(&template("", "", js), &token(), None, &DocumentOptions::default()).unwrap();
        assert_tag_structure(&doc.source);
        assert!(doc.source.contains("\"<\\/script><img src=x onerror=alert(1)>\""));
    }

    #[test]
    fn test_mixed_case_and_spaced_variants_escaped() {
        let js = "a='</SCRIPT >'; b='</ScRiPt'; c='<script>'; d='<!--';";
        let doc = build(&template("", "", js), &token(), None, &DocumentOptions::default()).unwrap();
        assert_tag_structure(&doc.source);
        assert!(doc.source.contains("a='<\\/SCRIPT >'"));
        assert!(doc.source.contains("c='\\x3Cscript>'"));
        assert!(doc.source.contains("d='\\x3C!--'"));
    }

    #[test]
    fn test_script_opener_escape_keeps_regex_meaning() {
        // `<\s` inside a regex would mean "< then whitespace"
        let js = r"var re = /<script\b/i; var re2 = /a<!--/;";
        assert_eq!(
            escape_script(js),
            r"var re = /\x3Cscript\b/i; var re2 = /a\x3C!--/;"
        );
    }

    #[test]
    fn test_script_tags_in_markup_are_inert() {
        let html = "<div><script>alert(1)</script></div>";
        let doc = build(&template(html, "", ""), &token(), None, &DocumentOptions::default()).unwrap();
        assert_tag_structure(&doc.source);
        assert!(doc
            .source
            .contains(r#""markup":"\u003cdiv>&lt;script>alert(1)&lt;/script>\u003c/div>""#));
    }

    #[test]
    fn test_unbalanced_markup_stays_out_of_document_structure() {
        for html in ["</div><p>after</p>", "<!-- open", "<textarea>", "<plaintext>x"] {
            let doc = build(&template(html, "", ""), &token(), None, &DocumentOptions::default()).unwrap();
            assert_tag_structure(&doc.source);
            assert!(doc.source.contains("<div id=\"widget-root\"></div>"), "{html}");
            // Markup only exists as a JSON string inside the runtime config
            assert_eq!(count_ci(&doc.source, "<textarea"), 0);
            assert_eq!(count_ci(&doc.source, "<plaintext"), 0);
            assert_eq!(count_ci(&doc.source, "<!--"), 0);
            assert_eq!(count_ci(&doc.source, "</div"), 1);
        }
    }

    #[test]
    fn test_closing_style_in_css_escaped() {
        let css = "b{color:red}</style><script>alert(1)</script>";
        let doc = build(&template("", css, ""), &token(), None, &DocumentOptions::default()).unwrap();
        assert_tag_structure(&doc.source);
    }

    #[test]
    fn test_csp_and_sandbox_attribute() {
        let doc = build(&template("", "", ""), &token(), None, &DocumentOptions::default()).unwrap();
        assert!(doc.source.contains(&format!(
            "<meta http-equiv=\"Content-Security-Policy\" content=\"{CONTENT_SECURITY_POLICY}\">"
        )));
        assert_eq!(doc.sandbox, "allow-scripts");
        assert!(!doc.sandbox.contains("allow-same-origin"));
        for directive in [
            "default-src 'none'",
            "connect-src 'none'",
            "frame-src 'none'",
            "object-src 'none'",
            "base-uri 'none'",
            "form-action 'none'",
        ] {
            assert!(doc.csp.contains(directive), "missing {directive}");
        }
    }

    #[test]
    fn test_privileged_access_is_confined() {
        // The guest tries to reach a host bridge and the network. Neither
        // is allowed: bridges are removed before its script runs, and the
        // CSP forbids every fetch target.
        let js = "window.__TAURI__.invoke('read_file'); fetch('https://evil.test/');";
        let doc = build(&template("", "", js), &token(), None, &DocumentOptions::default()).unwrap();
        let runtime_at = doc.source.find("\"privilegedGlobals\"").unwrap();
        let guest_at = doc.source.find("window.__TAURI__.invoke").unwrap();
        assert!(runtime_at < guest_at);
        assert!(doc.csp.contains("connect-src 'none'"));
        assert!(doc.csp.starts_with("default-src 'none'"));
        assert!(!doc.csp.contains("unsafe-eval"));
    }

    #[test]
    fn test_runtime_config_embedded() {
        let doc = build(&template("", "", ""), &token(), None, &DocumentOptions::default()).unwrap();
        assert!(doc.source.contains("\"token\":\"0123456789abcdef0123456789abcdef\""));
        assert!(doc.source.contains("\"readyPulseMs\":200"));
        assert!(doc.source.contains("\"fixedHeight\":null"));
        assert!(!doc.source.contains(CONFIG_PLACEHOLDER));
        assert!(doc.source.contains("window.__widgetSandboxStart();"));
    }

    #[test]
    fn test_fixed_height_fills_frame() {
        let doc = build(&template("", "", ""), &token(), Some(180), &DocumentOptions::default()).unwrap();
        assert!(doc.source.contains(FIXED_HEIGHT_CSS));
        assert!(doc.source.contains("\"fixedHeight\":180"));

        let mut t = template("", "", "");
        t.height_px = Some(90);
        let doc = build(&t, &token(), None, &DocumentOptions::default()).unwrap();
        assert!(doc.source.contains("\"fixedHeight\":90"));

        let doc = build(&template("", "", ""), &token(), None, &DocumentOptions::default()).unwrap();
        assert!(!doc.source.contains(FIXED_HEIGHT_CSS));
    }

    #[test]
    fn test_guest_order_runtime_then_guest_then_start() {
        let doc = build(
            &template("<p id='x'></p>", "p{}", "window.render=function(){};"),
            &token(),
            None,
            &DocumentOptions::default(),
        )
        .unwrap();
        let root = doc.source.find("<div id=\"widget-root\"></div>").unwrap();
        assert!(doc.source.contains(r#""markup":"\u003cp id='x'>\u003c/p>""#));
        let runtime = doc.source.find("\"rootId\"").unwrap();
        let guest = doc.source.find("window.render=function(){};").unwrap();
        let start = doc.source.find("window.__widgetSandboxStart();").unwrap();
        assert!(root < runtime && runtime < guest && guest < start);
    }

    #[test]
    fn test_neutralize_preserves_multibyte_text() {
        assert_eq!(escape_script("é</script>ü"), "é<\\/script>ü");
        assert_eq!(escape_markup("日本<SCRIPT>"), "日本&lt;SCRIPT>");
    }
}
