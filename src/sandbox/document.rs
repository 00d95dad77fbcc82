/// Builds the document payload loaded into an isolation context.
///
/// Layout of every document:
///
/// 1. optional `<style>` (preview only) and markup, verbatim
/// 2. script block: capture shim + `install_snippet`
/// 3. script block: the user script inside the async envelope
/// 4. script block: completion fallback when block 3 never ran
///
/// Block 4 covers scripts that fail to parse: the browser drops block 3
/// entirely (the shim reports the `SyntaxError` through the `error` hook)
/// and completion is still signaled exactly once.
///
/// Nothing is escaped or validated. The capability set of the context is
/// the trust boundary.
use super::protocol::ChannelId;
use super::shim;

/// Content-Security-Policy applied to preview documents.
pub const PREVIEW_CSP: &str = "default-src 'none'; \
style-src 'unsafe-inline'; \
script-src 'unsafe-inline'; \
img-src data: blob:; \
font-src data:; \
connect-src 'self'; \
frame-ancestors 'none'; \
base-uri 'none'; \
form-action 'none'";

/// Document for a script-only run (no markup, no style).
pub fn script_document(script: &str, channel: &ChannelId) -> String {
    let head = "    <meta charset=\"utf-8\" />\n    <title>Sandbox</title>\n".to_string();
    assemble(&head, "", script, channel)
}

/// Document for a preview run: markup and style are spliced in verbatim.
pub fn preview_document(markup: &str, style: &str, script: &str, channel: &ChannelId) -> String {
    let head = format!(
        "    <meta charset=\"utf-8\" />\n    \
         <meta http-equiv=\"Content-Security-Policy\" content=\"{PREVIEW_CSP}\">\n    \
         <title>Preview</title>\n    \
         <style>\n{style}\n    </style>\n"
    );
    assemble(&head, markup, script, channel)
}

fn assemble(head: &str, markup: &str, script: &str, channel: &ChannelId) -> String {
    let channel_literal = js_string_literal(channel.as_str());
    let install = shim::install_snippet(&channel_literal);
    let envelope = envelope(script);
    let capture = shim::CAPTURE_SCRIPT;

    format!(
        "<!doctype html>\n\
<html>\n  \
<head>\n\
{head}  \
</head>\n  \
<body>\n\
{markup}\n    \
<script>\n\
{capture}\n\
{install}\n\
let __envelopeEntered = false;\n    \
</script>\n    \
<script>\n\
{envelope}\n    \
</script>\n    \
<script>\n\
if (!__envelopeEntered) {{ __safePost({{ type: 'status', payload: 'completed' }}); }}\n    \
</script>\n  \
</body>\n\
</html>"
    )
}

/// Wraps the user script so that errors are reported and completion is
/// always signaled, including on early `return`.
pub fn envelope(script: &str) -> String {
    format!(
        "(async function () {{\n  \
__envelopeEntered = true;\n  \
try {{\n\
{script}\n  \
}} catch (e) {{\n    \
__safePost({{\n      \
type: 'error',\n      \
payload: String(e && e.message ? e.message : e),\n      \
stack: e && e.stack ? String(e.stack) : undefined\n    \
}});\n  \
}} finally {{\n    \
__safePost({{ type: 'status', payload: 'completed' }});\n  \
}}\n\
}})();"
    )
}

/// Quotes `value` as a JavaScript string literal (JSON string syntax).
fn js_string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
