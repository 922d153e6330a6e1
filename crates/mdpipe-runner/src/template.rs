//! Literal `{TOKEN}` substitution for engine input files (MDP, PLUMED) and
//! command arguments.

use crate::error::{PipelineError, Result};
use crate::params::RunConfig;
use mdpipe_core::atomic_write_bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Tokens the pipeline fills in itself; templates may reference these
/// without the parameter file declaring them.
pub const BUILTIN_TOKENS: &[&str] = &[
    "RESTART",
    "CONTINUATION",
    "STAGE_DIR",
    "INPUT_DIR",
    "OUTPUT_DIR",
    "MAXH",
    "N_RANKS",
    "OMP_THREADS",
    "GPU_IDS",
    "REPLICA_INDEX",
    "REPLICA_DIR",
    "REPLICA_TEMPERATURE_K",
    "REPLICA_LAMBDA",
    "TRAJECTORY",
    "OUTPUT",
    "REPLICA_DIRS",
    "SEGMENTS",
];

#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
    resuming: bool,
}

impl RenderContext {
    pub fn from_config(config: &RunConfig) -> Self {
        let mut ctx = Self::default();
        for (key, value) in config.values() {
            ctx.scalars.insert(key.clone(), value.clone());
        }
        ctx.set_resuming(false);
        ctx
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.scalars.insert(key.to_string(), value.into());
        self
    }

    pub fn set_list(&mut self, key: &str, values: Vec<String>) -> &mut Self {
        self.lists.insert(key.to_string(), values);
        self
    }

    /// Restart handling is a typed switch rather than text editing of the
    /// template: `{RESTART}` and `{CONTINUATION}` follow this flag.
    pub fn set_resuming(&mut self, resuming: bool) -> &mut Self {
        self.resuming = resuming;
        self.scalars.insert(
            "RESTART".to_string(),
            if resuming { "RESTART" } else { "" }.to_string(),
        );
        self.scalars.insert(
            "CONTINUATION".to_string(),
            if resuming { "yes" } else { "no" }.to_string(),
        );
        self
    }

    pub fn resuming(&self) -> bool {
        self.resuming
    }

    fn lookup(&self, token: &str) -> Option<String> {
        if let Some(v) = self.scalars.get(token) {
            return Some(v.clone());
        }
        self.lists.get(token).map(|items| items.join(" "))
    }
}

/// Returns every `{TOKEN}` referenced by `text`, in sorted order.
pub fn template_tokens(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    scan(text, |token| {
        out.insert(token.to_string());
        None
    });
    out
}

pub fn render_str(text: &str, ctx: &RenderContext, template_name: &str) -> Result<String> {
    let mut unresolved = BTreeSet::new();
    let rendered = scan(text, |token| {
        let value = ctx.lookup(token);
        if value.is_none() {
            unresolved.insert(token.to_string());
        }
        value
    });
    if !unresolved.is_empty() {
        return Err(PipelineError::UnresolvedTemplateToken {
            template: template_name.to_string(),
            tokens: unresolved.into_iter().map(|t| format!("{{{}}}", t)).collect(),
        });
    }
    Ok(rendered)
}

/// Renders a command line. An argument that is exactly `{LIST}` for a list
/// token expands into one argument per element.
pub fn render_args(args: &[String], ctx: &RenderContext, context: &str) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(name) = whole_token(arg) {
            if let Some(items) = ctx.lists.get(name) {
                out.extend(items.iter().cloned());
                continue;
            }
        }
        out.push(render_str(arg, ctx, context)?);
    }
    Ok(out)
}

/// Renders `src` into `dst`. Nothing is written unless every token resolves.
pub fn render_file(src: &Path, dst: &Path, ctx: &RenderContext) -> Result<()> {
    let text = fs::read_to_string(src).map_err(|e| PipelineError::io(src, e))?;
    let rendered = render_str(&text, ctx, &src.display().to_string())?;
    atomic_write_bytes(dst, rendered.as_bytes()).map_err(|e| PipelineError::io(dst, e))
}

fn whole_token(arg: &str) -> Option<&str> {
    let inner = arg.strip_prefix('{')?.strip_suffix('}')?;
    if is_token_name(inner) {
        Some(inner)
    } else {
        None
    }
}

fn is_token_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {
            chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    }
}

/// Walks `text`, calling `resolve` for each token. Resolved tokens are
/// replaced; everything else, including braces around non-token text, is
/// copied through unchanged.
fn scan<F>(text: &str, mut resolve: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_token_name(&after[..close]) => {
                let name = &after[..close];
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
