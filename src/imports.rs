//! Import specifier rewriting.
//!
//! Scripts are usually written for Node, where `import cheerio from "cheerio"`
//! resolves through `node_modules`. Deno needs an explicit scheme, so bare
//! specifiers get `node:` (core modules) or `npm:` (everything else).
//!
//! This is a lexical rewrite over the four import forms, not a parse: a quoted
//! specifier inside a string literal that happens to follow `from` is
//! rewritten too.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Specifiers that already resolve under Deno.
const SAFE_PREFIXES: &[&str] = &[
    "./", "../", "/", "http:", "https:", "npm:", "node:", "jsr:", "data:",
];

const NODE_BUILTINS: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

/// `from "x"`, `import "x"`, `import("x")`, `require("x")`
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<head>\bfrom\s*|\bimport\s*|\bimport\s*\(\s*|\brequire\s*\(\s*)(?P<quote>["'])(?P<spec>[^"'\r\n]+)["']"#,
    )
    .expect("valid regex")
});

/// Returns true for Node core module names, with or without subpaths.
pub fn is_node_builtin(specifier: &str) -> bool {
    let name = specifier.split('/').next().unwrap_or(specifier);
    NODE_BUILTINS.contains(&name)
}

/// The Deno form of a single specifier, or `None` when it needs no change.
pub fn rewrite_specifier(specifier: &str) -> Option<String> {
    if specifier.is_empty() || SAFE_PREFIXES.iter().any(|p| specifier.starts_with(p)) {
        return None;
    }
    let scheme = if is_node_builtin(specifier) { "node" } else { "npm" };
    Some(format!("{scheme}:{specifier}"))
}

/// Rewrites every bare import specifier in `source`.
pub fn rewrite_imports(source: &str) -> Cow<'_, str> {
    IMPORT_RE.replace_all(source, |caps: &Captures<'_>| {
        let head = &caps["head"];
        let quote = &caps["quote"];
        let spec = &caps["spec"];
        match rewrite_specifier(spec) {
            Some(rewritten) => format!("{head}{quote}{rewritten}{quote}"),
            None => caps[0].to_string(),
        }
    })
}
