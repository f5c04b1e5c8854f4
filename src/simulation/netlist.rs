use std::fs;
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use regex::Regex;

use crate::core::{Component, ComponentKind, ValueUpdate, parse_value};
use crate::error::{Error, Result};
use crate::optimization::TargetCurve;

/// Element line prefix up to and including the value token (4th token).
const VALUE_TOKEN: &str = r"^(\s*[^\s;]+\s+[^\s;]+\s+[^\s;]+\s+)([^\s;]+)";

/// In-memory circuit model backed by a netlist file.
///
/// Edits go back through `patch`, which rewrites only value tokens so
/// untouched lines round-trip byte for byte.
#[derive(Clone, Debug)]
pub struct Netlist {
    path: PathBuf,
    components: Vec<Component>,
    nodes: IndexSet<String>,
}

/// Control directive and the block it opens or closes.
fn directive(tokens: &[&str]) -> Option<String> {
    tokens
        .first()
        .filter(|t| t.starts_with('.'))
        .map(|t| t.to_ascii_uppercase())
}

fn code_part(line: &str) -> &str {
    line.split(';').next().unwrap_or("")
}

fn comment_part(line: &str) -> Option<&str> {
    line.split_once(';').map(|(_, comment)| comment)
}

impl Netlist {
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse_str(path, &text)
    }

    /// Parse netlist text as if it had been read from `path`.
    pub fn parse_str(path: impl AsRef<Path>, text: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let mut components = Vec::new();
        let mut nodes = IndexSet::new();
        let mut in_subckt = false;
        let mut in_control = false;

        for (idx, line) in lines.iter().enumerate().skip(1) {
            let line_no = idx + 1;
            let tokens: Vec<&str> = code_part(line).split_whitespace().collect();
            let Some(first) = tokens.first() else {
                continue;
            };

            match directive(&tokens).as_deref() {
                Some(".SUBCKT") => {
                    in_subckt = true;
                    continue;
                }
                Some(".ENDS") => {
                    in_subckt = false;
                    continue;
                }
                Some(".CONTROL") => {
                    in_control = true;
                    continue;
                }
                Some(".ENDC") => {
                    in_control = false;
                    continue;
                }
                _ => {}
            }
            if in_subckt || in_control {
                continue;
            }

            let malformed = |needed: usize| Error::Netlist {
                path: path.clone(),
                line: line_no,
                message: format!(
                    "expected at least {} tokens, found {}: '{}'",
                    needed,
                    tokens.len(),
                    line.trim_end()
                ),
            };

            let Some(designator) = first.chars().next() else {
                continue;
            };
            match designator.to_ascii_uppercase() {
                'R' | 'L' | 'C' => {
                    if tokens.len() < 4 {
                        return Err(malformed(4));
                    }
                    let value = parse_value(tokens[3]).map_err(|e| Error::Netlist {
                        path: path.clone(),
                        line: line_no,
                        message: e.to_string(),
                    })?;
                    let Some(kind) = ComponentKind::from_designator(designator) else {
                        continue;
                    };
                    let mut component = Component::new(*first, kind, value);
                    component.is_variable = comment_part(line)
                        .is_some_and(|c| c.to_ascii_uppercase().contains("OPTIMIZE"));
                    nodes.extend(tokens[1..3].iter().map(|n| n.to_string()));
                    components.push(component);
                }
                'B' | 'D' | 'F' | 'H' | 'I' | 'V' | 'W' => {
                    if tokens.len() < 3 {
                        return Err(malformed(3));
                    }
                    nodes.extend(tokens[1..3].iter().map(|n| n.to_string()));
                }
                'J' | 'Q' | 'U' | 'Z' => {
                    if tokens.len() < 4 {
                        return Err(malformed(4));
                    }
                    nodes.extend(tokens[1..4].iter().map(|n| n.to_string()));
                }
                'E' | 'G' | 'M' | 'O' | 'S' | 'T' => {
                    if tokens.len() < 5 {
                        return Err(malformed(5));
                    }
                    nodes.extend(tokens[1..5].iter().map(|n| n.to_string()));
                }
                'X' | 'K' | 'A' => {
                    if tokens.len() < 3 {
                        return Err(malformed(3));
                    }
                    // Trailing positional token is the subcircuit or model name
                    let positional: Vec<&str> =
                        tokens[1..].iter().copied().filter(|t| !t.contains('=')).collect();
                    if let Some((_, connections)) = positional.split_last() {
                        nodes.extend(connections.iter().map(|n| n.to_string()));
                    }
                }
                _ => {}
            }
        }

        debug!(
            "parsed {}: {} components, {} nodes",
            path.display(),
            components.len(),
            nodes.len()
        );

        Ok(Self {
            path,
            components,
            nodes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn nodes(&self) -> &IndexSet<String> {
        &self.nodes
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.components
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn unknown(&self, name: &str) -> Error {
        Error::Netlist {
            path: self.path.clone(),
            line: 0,
            message: format!("no component named '{}'", name),
        }
    }

    fn require_mut(&mut self, name: &str) -> Result<&mut Component> {
        let Self {
            path, components, ..
        } = self;
        components
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Netlist {
                path: path.clone(),
                line: 0,
                message: format!("no component named '{}'", name),
            })
    }

    pub fn variable_components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(|c| c.is_variable)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variable_components().map(|c| c.name.clone()).collect()
    }

    /// `V(node)` for every non-ground node.
    pub fn node_expressions(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.as_str() != "0")
            .map(|n| format!("V({})", n))
            .collect()
    }

    /// Component values keyed by name, for expression evaluation.
    pub fn values(&self) -> IndexMap<String, f64> {
        self.components
            .iter()
            .map(|c| (c.name.clone(), c.value))
            .collect()
    }

    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        self.require_mut(name)?.value = value;
        Ok(())
    }

    pub fn set_variable(&mut self, name: &str, variable: bool) -> Result<()> {
        self.require_mut(name)?.is_variable = variable;
        Ok(())
    }

    pub fn set_bounds(&mut self, name: &str, min: f64, max: f64) -> Result<()> {
        let component = self.require_mut(name)?;
        component.min_value = min;
        component.max_value = max;
        Ok(())
    }

    /// Make exactly `names` the variable set.
    pub fn select_variables<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        if let Some(missing) = names.iter().find(|n| self.component(n.as_ref()).is_none()) {
            return Err(self.unknown(missing.as_ref()));
        }
        for component in &mut self.components {
            component.is_variable = names
                .iter()
                .any(|n| component.name.eq_ignore_ascii_case(n.as_ref()));
        }
        Ok(())
    }

    /// Copy the source file to `dest`, creating the working copy for a solve.
    pub fn copy_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        fs::copy(&self.path, dest).map_err(|e| Error::io(dest, e))?;
        Ok(())
    }

    /// Rewrite `path` with `updates` applied, and mirror them in memory.
    ///
    /// Only the value token of each named element changes; `.CONTROL`
    /// blocks are dropped and every other line is written back unchanged.
    pub fn patch(&mut self, path: impl AsRef<Path>, updates: &[ValueUpdate]) -> Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let rewritten = rewrite(path, &text, updates)?;
        fs::write(path, rewritten).map_err(|e| Error::io(path, e))?;

        for update in updates {
            if let Some(component) = self.component_mut(&update.name) {
                component.value = update.value;
            }
        }
        Ok(())
    }
}

/// Render a value so it reads back exactly.
fn literal(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e6).contains(&magnitude) {
        format!("{}", value)
    } else {
        format!("{:e}", value)
    }
}

fn rewrite(path: &Path, text: &str, updates: &[ValueUpdate]) -> Result<String> {
    let value_token = Regex::new(VALUE_TOKEN).map_err(|e| Error::Netlist {
        path: path.to_path_buf(),
        line: 0,
        message: e.to_string(),
    })?;
    // Later updates to the same component win
    let mut pending: Vec<&ValueUpdate> = Vec::with_capacity(updates.len());
    for update in updates {
        match pending
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&update.name))
        {
            Some(slot) => *slot = update,
            None => pending.push(update),
        }
    }
    let mut out = String::with_capacity(text.len() + 16 * updates.len());
    let mut in_subckt = false;
    let mut in_control = false;

    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let tokens: Vec<&str> = code_part(line).split_whitespace().collect();
        let kw = directive(&tokens);

        match kw.as_deref() {
            Some(".CONTROL") => in_control = true,
            Some(".ENDC") if in_control => {
                in_control = false;
                continue;
            }
            Some(".SUBCKT") => in_subckt = true,
            Some(".ENDS") => in_subckt = false,
            _ => {}
        }
        if in_control {
            continue;
        }

        let name = tokens.first().copied().unwrap_or("");
        let hit = if idx == 0 || in_subckt || tokens.len() < 4 {
            None
        } else {
            pending
                .iter()
                .position(|u| u.name.eq_ignore_ascii_case(name))
        };

        match hit {
            Some(pos) => {
                let update = pending.remove(pos);
                let replaced = value_token.replace(line, |caps: &regex::Captures| {
                    format!("{}{}", &caps[1], literal(update.value))
                });
                out.push_str(&replaced);
            }
            None => out.push_str(line),
        }
    }

    if let Some(missing) = pending.first() {
        return Err(Error::Netlist {
            path: path.to_path_buf(),
            line: 0,
            message: format!("no element line for component '{}'", missing.name),
        });
    }

    Ok(out)
}

/// Transient analysis window written into the working netlist.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransientSpec {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl TransientSpec {
    /// Cover the target's x-range in `divisions` steps.
    pub fn from_curve(curve: &TargetCurve, divisions: usize) -> Self {
        let (start, stop) = curve.x_range();
        Self {
            start,
            stop,
            step: (stop - start) / divisions.max(1) as f64,
        }
    }
}

/// Insert `.TRAN` and `.PRINT TRAN` directives after the title line.
///
/// Returns `false` and leaves the file alone when either directive is
/// already present.
pub fn inject_transient_directive<S: AsRef<str>>(
    path: impl AsRef<Path>,
    spec: &TransientSpec,
    target: &str,
    extra_probes: &[S],
) -> Result<bool> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

    let existing = text.lines().find(|line| {
        let kw = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        kw == ".TRAN" || kw == ".PRINT"
    });
    if let Some(line) = existing {
        warn!(
            "{} already has '{}', transient directive not injected",
            path.display(),
            line.trim()
        );
        return Ok(false);
    }

    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut probes = vec![target.to_string()];
    for probe in extra_probes {
        let probe = probe.as_ref();
        if !probes.iter().any(|p| p.eq_ignore_ascii_case(probe)) {
            probes.push(probe.to_string());
        }
    }

    let block = format!(
        ".TRAN {step} {stop} {start} {step}{nl}.PRINT TRAN {probes}{nl}",
        step = literal(spec.step),
        stop = literal(spec.stop),
        start = literal(spec.start),
        probes = probes.join(" "),
        nl = newline,
    );

    let mut out = String::with_capacity(text.len() + block.len());
    match text.split_once('\n') {
        Some((title, rest)) => {
            out.push_str(title);
            out.push('\n');
            out.push_str(&block);
            out.push_str(rest);
        }
        None => {
            out.push_str(&text);
            if !text.is_empty() {
                out.push_str(newline);
            }
            out.push_str(&block);
        }
    }
    fs::write(path, out).map_err(|e| Error::io(path, e))?;
    Ok(true)
}
