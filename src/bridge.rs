//! Capability bridge injection and wire protocol.
//!
//! Plugins run inside a sandboxed iframe and talk to the embedding
//! dashboard exclusively through `postMessage`. The host's part of that
//! contract is injecting the bridge script into the root HTML document as
//! it passes through the proxy, exactly once, before any plugin script
//! executes. The script itself lives in `bridge.js` and is compiled into
//! the binary.
//!
//! Injection is idempotent: the script tag carries a sentinel attribute,
//! and documents that already contain it pass through untouched.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BRIDGE_JS: &str = include_str!("bridge.js");

/// Attribute marking an already-injected document.
pub const BRIDGE_SENTINEL: &str = "data-apphost-bridge";

/// Library script tags that need a companion loaded right after them.
/// Matching is by substring on the tag's `src`.
const EXTENSION_SCRIPTS: &[(&str, &str)] = &[
    (
        "bootstrap.min.js",
        "https://cdn.jsdelivr.net/npm/@popperjs/core@2/dist/umd/popper.min.js",
    ),
    (
        "chart.min.js",
        "https://cdn.jsdelivr.net/npm/chartjs-adapter-date-fns@3/dist/chartjs-adapter-date-fns.bundle.min.js",
    ),
];

fn head_open_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<head[^>]*>").expect("head regex"))
}

fn body_open_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<body[^>]*>").expect("body regex"))
}

/// The bridge script tag for a plugin, sentinel included.
fn bridge_tag(plugin_id: Uuid) -> String {
    let js = BRIDGE_JS.replace("__PLUGIN_ID__", &plugin_id.to_string());
    format!("<script {BRIDGE_SENTINEL}=\"{plugin_id}\">\n{js}</script>")
}

/// Inject the bridge into an HTML document.
///
/// The script goes right after `<head>` so it runs before any plugin code;
/// documents without a head get it after `<body>`, and fragments with
/// neither get it prepended. A document already carrying the sentinel is
/// returned unchanged.
pub fn inject_bridge(html: &str, plugin_id: Uuid) -> String {
    if html.contains(BRIDGE_SENTINEL) {
        return html.to_string();
    }
    let tag = bridge_tag(plugin_id);

    if let Some(m) = head_open_regex().find(html) {
        let mut out = String::with_capacity(html.len() + tag.len());
        out.push_str(&html[..m.end()]);
        out.push_str(&tag);
        out.push_str(&html[m.end()..]);
        return append_extension_scripts(&out);
    }
    if let Some(m) = body_open_regex().find(html) {
        let mut out = String::with_capacity(html.len() + tag.len());
        out.push_str(&html[..m.end()]);
        out.push_str(&tag);
        out.push_str(&html[m.end()..]);
        return append_extension_scripts(&out);
    }
    append_extension_scripts(&format!("{tag}{html}"))
}

/// Insert companion scripts after library tags that require them, unless
/// the companion is already referenced somewhere in the document.
fn append_extension_scripts(html: &str) -> String {
    let mut out = html.to_string();
    for (needle, companion) in EXTENSION_SCRIPTS {
        if !out.contains(needle) || out.contains(companion) {
            continue;
        }
        // Find the </script> closing the tag that references the library.
        let Some(src_pos) = out.find(needle) else { continue };
        let Some(close_rel) = out[src_pos..].find("</script>") else {
            continue;
        };
        let insert_at = src_pos + close_rel + "</script>".len();
        let companion_tag = format!("\n<script src=\"{companion}\"></script>");
        out.insert_str(insert_at, &companion_tag);
    }
    out
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// Messages exchanged between the plugin iframe and the embedding
/// dashboard. The host never routes these (the browser does); the types
/// document the contract and let tests pin the shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    /// Iframe to parent: the bridge is installed and listening. No payload.
    #[serde(rename = "IFRAME_READY")]
    IframeReady,

    /// Parent to iframe: runtime configuration. Tokens pass from the
    /// dashboard straight into the frame; the host never sees them.
    #[serde(rename = "CONFIG", rename_all = "camelCase")]
    Config {
        company_id: String,
        api_base_url: String,
        tokens: serde_json::Value,
        app_id: String,
    },

    /// Iframe to parent: a captured console call.
    #[serde(rename = "CONSOLE_LOG", rename_all = "camelCase")]
    ConsoleLog {
        method: String,
        args: Vec<String>,
        timestamp: i64,
        /// Best-effort caller location; empty when unavailable.
        source: String,
    },

    /// Iframe to parent: an observed fetch/XHR. Headers and size are
    /// best-effort and null for opaque responses.
    #[serde(rename = "NETWORK_REQUEST", rename_all = "camelCase")]
    NetworkRequest {
        url: String,
        method: String,
        status: u16,
        duration: u64,
        headers: Option<serde_json::Value>,
        size: Option<u64>,
    },

    /// Iframe to parent: plugin-declared state transition. Together with
    /// the tag the message reads `{type, data, source}` on the wire.
    #[serde(rename = "STATE_CHANGE", rename_all = "camelCase")]
    StateChange {
        data: serde_json::Value,
        source: String,
    },

    /// Iframe to parent: outcome of an in-plugin test.
    #[serde(rename = "TEST_RESULT", rename_all = "camelCase")]
    TestResult {
        name: String,
        status: String,
        duration: Option<u64>,
        error: Option<String>,
    },

    /// Iframe to parent: uncaught error or unhandled rejection.
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        error: String,
        stack: String,
        filename: String,
        lineno: u32,
        colno: u32,
    },
}
