//! Static template inheritance over the AST.
//!
//! A child's blocks override the parent's blocks of the same name; `{parent}` in
//! an override is replaced by the overridden body. Middle templates merge their
//! own blocks under the child's. When a template in the chain extends a
//! non-literal name, the walk stops and the collected blocks are handed to the
//! render-time extends instead.

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use smol_str::SmolStr;

use super::CompilationSession;
use super::error::CompileError;
use crate::ast::node::{Expr, Node, NodeKind, SetValue};
use crate::ast::Program;

pub(super) type Blocks = IndexMap<SmolStr, Vec<Node>>;

pub(super) struct Expanded {
    pub body: Vec<Node>,
    pub dynamic: Option<DynamicParent>,
}

pub(super) struct DynamicParent {
    pub parent: Expr,
    pub line: u32,
    pub blocks: Blocks,
}

pub(super) fn expand(session: &mut CompilationSession<'_>, program: Program) -> Result<Expanded, CompileError> {
    let mut current = program;
    let mut preamble = Vec::new();
    let mut overrides = Blocks::new();
    let mut is_root = true;

    loop {
        let Some((line, parent)) = find_extends(session, &current)? else {
            if is_root {
                return Ok(Expanded {
                    body: current,
                    dynamic: None,
                });
            }
            apply_overrides(&mut current, &overrides, &mut Vec::new());
            preamble.extend(current);
            return Ok(Expanded {
                body: preamble,
                dynamic: None,
            });
        };

        is_root = false;
        session.set_line(line);
        merge_blocks(&mut overrides, collect_blocks(&current));
        for used in uses(&current) {
            let program = session.load_ast(&used)?;
            merge_blocks(&mut overrides, collect_blocks(&program));
        }
        preamble.extend(child_preamble(&current));

        let Some(name) = parent.as_str().map(SmolStr::new) else {
            return Ok(Expanded {
                body: preamble,
                dynamic: Some(DynamicParent {
                    parent,
                    line,
                    blocks: overrides,
                }),
            });
        };

        if session.extends_chain.contains(&name) {
            let chain = session
                .extends_chain
                .iter()
                .chain(std::iter::once(&name))
                .map(SmolStr::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(session.invalid_usage(format!("Circular extends detected: {}", chain)));
        }
        session.extends_chain.push(name.clone());
        current = session.load_ast(&name)?;
    }
}

fn find_extends(session: &CompilationSession<'_>, program: &[Node]) -> Result<Option<(u32, Expr)>, CompileError> {
    let mut found = None;
    for node in program {
        if let NodeKind::Extends(parent) = &node.kind {
            if found.is_some() {
                return Err(CompileError::InvalidUsage {
                    message: format!("Template {} may only extend one parent", session.unit_name()),
                    line: node.line,
                });
            }
            found = Some((node.line, parent.clone()));
        }
    }
    Ok(found)
}

fn uses(program: &[Node]) -> Vec<String> {
    program
        .iter()
        .filter_map(|node| match &node.kind {
            NodeKind::Use(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Top-level statements of a child template that survive inheritance.
pub(super) fn child_preamble(program: &[Node]) -> Vec<Node> {
    program
        .iter()
        .filter(|node| {
            matches!(
                node.kind,
                NodeKind::Set { .. } | NodeKind::Macro(_) | NodeKind::Import { .. } | NodeKind::Use(_)
            )
        })
        .cloned()
        .collect()
}

/// Every block defined anywhere in `nodes`, outermost first.
pub(super) fn collect_blocks(nodes: &[Node]) -> Blocks {
    let mut blocks = Blocks::new();
    collect_into(nodes, &mut blocks);
    blocks
}

fn collect_into(nodes: &[Node], blocks: &mut Blocks) {
    for node in nodes {
        if let NodeKind::Block { name, body } = &node.kind {
            blocks.entry(name.clone()).or_insert_with(|| body.clone());
        }
        for children in children(&node.kind) {
            collect_into(children, blocks);
        }
    }
}

pub(super) fn block_names(nodes: &[Node]) -> FxHashSet<SmolStr> {
    collect_blocks(nodes).into_keys().collect()
}

/// Adds `blocks` below the existing overrides. An override that calls
/// `{parent}` receives the lower definition.
fn merge_blocks(overrides: &mut Blocks, blocks: Blocks) {
    for (name, body) in blocks {
        match overrides.get_mut(&name) {
            Some(existing) => *existing = splice_parent(existing, &body),
            None => {
                overrides.insert(name, body);
            }
        }
    }
}

/// Replaces `{parent}` in `nodes` with `parent_body`. Nested blocks keep their own `{parent}`.
pub(super) fn splice_parent(nodes: &[Node], parent_body: &[Node]) -> Vec<Node> {
    let mut spliced = Vec::with_capacity(nodes.len());
    for node in nodes {
        match &node.kind {
            NodeKind::Parent => spliced.extend(parent_body.iter().cloned()),
            NodeKind::Block { .. } => spliced.push(node.clone()),
            _ => {
                let mut node = node.clone();
                for children in children_mut(&mut node.kind) {
                    *children = splice_parent(children, parent_body);
                }
                spliced.push(node);
            }
        }
    }
    spliced
}

/// Substitutes overrides into the blocks of a root template. Block markers stay
/// so a render-time child can still override them.
pub(super) fn apply_overrides(nodes: &mut [Node], overrides: &Blocks, resolving: &mut Vec<SmolStr>) {
    for node in nodes.iter_mut() {
        if let NodeKind::Block { name, body } = &mut node.kind {
            if resolving.contains(name) {
                continue;
            }
            resolving.push(name.clone());
            apply_overrides(body, overrides, resolving);
            if let Some(replacement) = overrides.get(name) {
                let mut replacement = replacement.clone();
                apply_overrides(&mut replacement, overrides, resolving);
                *body = splice_parent(&replacement, body);
            }
            resolving.pop();
            continue;
        }

        for children in children_mut(&mut node.kind) {
            apply_overrides(children, overrides, resolving);
        }
    }
}

/// Statement lists nested directly under `kind`. Macro bodies are not included.
pub(super) fn children(kind: &NodeKind) -> Vec<&Vec<Node>> {
    match kind {
        NodeKind::If { branches, otherwise } => branches
            .iter()
            .map(|(_, body)| body)
            .chain(otherwise.iter())
            .collect(),
        NodeKind::Loop { body, empty, .. } => std::iter::once(body).chain(empty.iter()).collect(),
        NodeKind::Switch { cases, default, .. } => cases
            .iter()
            .map(|(_, body)| body)
            .chain(default.iter())
            .collect(),
        NodeKind::Set {
            value: SetValue::Capture { body, .. },
            ..
        } => vec![body],
        NodeKind::While { body, .. }
        | NodeKind::Block { body, .. }
        | NodeKind::FilterBlock { body, .. }
        | NodeKind::Autoescape { body, .. }
        | NodeKind::Strip(body) => vec![body],
        NodeKind::Tag { body: Some(body), .. } => vec![body],
        _ => Vec::new(),
    }
}

pub(super) fn children_mut(kind: &mut NodeKind) -> Vec<&mut Vec<Node>> {
    match kind {
        NodeKind::If { branches, otherwise } => branches
            .iter_mut()
            .map(|(_, body)| body)
            .chain(otherwise.iter_mut())
            .collect(),
        NodeKind::Loop { body, empty, .. } => std::iter::once(body).chain(empty.iter_mut()).collect(),
        NodeKind::Switch { cases, default, .. } => cases
            .iter_mut()
            .map(|(_, body)| body)
            .chain(default.iter_mut())
            .collect(),
        NodeKind::Set {
            value: SetValue::Capture { body, .. },
            ..
        } => vec![body],
        NodeKind::While { body, .. }
        | NodeKind::Block { body, .. }
        | NodeKind::FilterBlock { body, .. }
        | NodeKind::Autoescape { body, .. }
        | NodeKind::Strip(body) => vec![body],
        NodeKind::Tag { body: Some(body), .. } => vec![body],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Node {
        Node::new(1, NodeKind::Text(s.to_string()))
    }

    fn block(name: &str, body: Vec<Node>) -> Node {
        Node::new(1, NodeKind::Block {
            name: SmolStr::new(name),
            body,
        })
    }

    fn parent() -> Node {
        Node::new(1, NodeKind::Parent)
    }

    #[test]
    fn test_splice_parent_replaces_marker() {
        let spliced = splice_parent(&[text("a"), parent(), text("c")], &[text("b")]);
        assert_eq!(spliced, vec![text("a"), text("b"), text("c")]);
    }

    #[test]
    fn test_splice_parent_skips_nested_blocks() {
        let nested = block("inner", vec![parent()]);
        let spliced = splice_parent(&[nested.clone()], &[text("b")]);
        assert_eq!(spliced, vec![nested]);
    }

    #[test]
    fn test_apply_overrides_with_parent() {
        let mut root = vec![text("<"), block("content", vec![text("default")]), text(">")];
        let overrides = Blocks::from_iter([(SmolStr::new("content"), vec![text("["), parent(), text("]")])]);
        apply_overrides(&mut root, &overrides, &mut Vec::new());
        assert_eq!(root, vec![
            text("<"),
            block("content", vec![text("["), text("default"), text("]")]),
            text(">"),
        ]);
    }

    #[test]
    fn test_apply_overrides_reaches_nested_blocks() {
        let mut root = vec![block("outer", vec![text("o:"), block("inner", vec![text("i")])])];
        let overrides = Blocks::from_iter([(SmolStr::new("inner"), vec![text("I")])]);
        apply_overrides(&mut root, &overrides, &mut Vec::new());
        assert_eq!(root, vec![block("outer", vec![text("o:"), block("inner", vec![text("I")])])]);
    }

    #[test]
    fn test_merge_blocks_keeps_most_derived() {
        let mut overrides = Blocks::from_iter([(SmolStr::new("a"), vec![text("child "), parent()])]);
        merge_blocks(
            &mut overrides,
            Blocks::from_iter([
                (SmolStr::new("a"), vec![text("middle")]),
                (SmolStr::new("b"), vec![text("only middle")]),
            ]),
        );
        assert_eq!(overrides["a"], vec![text("child "), text("middle")]);
        assert_eq!(overrides["b"], vec![text("only middle")]);
    }

    #[test]
    fn test_child_preamble_keeps_declarations() {
        let program = vec![
            text("dropped"),
            Node::new(1, NodeKind::Use("traits".to_string())),
            block("a", vec![]),
        ];
        assert_eq!(child_preamble(&program), vec![Node::new(1, NodeKind::Use("traits".to_string()))]);
    }
}
