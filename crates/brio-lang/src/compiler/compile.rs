use std::sync::{Arc, LazyLock};

use regex_lite::Regex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::CompilationSession;
use super::error::CompileError;
use super::escape::SafetyTracker;
use super::session::{Breakable, LoopFrame};
use crate::ast::node::{self as ast, NodeKind, SetMode, SetValue};
use crate::extension::{Extension, TagCall};
use crate::ir::{Expr, LoopOp, Op, Target};
use crate::options::Options;

type SwitchCases = Vec<(Vec<Expr>, Vec<Op>)>;

static BETWEEN_TAGS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r">\s+<").ok());
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

fn strip_text(text: &str) -> String {
    let text = match BETWEEN_TAGS.as_ref() {
        Some(re) => re.replace_all(text, "><").into_owned(),
        None => text.to_string(),
    };
    match WHITESPACE.as_ref() {
        Some(re) => re.replace_all(&text, " ").into_owned(),
        None => text,
    }
}

impl CompilationSession<'_> {
    pub(crate) fn compile_nodes(&mut self, nodes: &[ast::Node]) -> Result<Vec<Op>, CompileError> {
        let mut ops = Vec::with_capacity(nodes.len());
        for node in nodes {
            self.compile_node(node, &mut ops)?;
        }
        Ok(ops)
    }

    fn compile_node(&mut self, node: &ast::Node, out: &mut Vec<Op>) -> Result<(), CompileError> {
        self.set_line(node.line);

        match &node.kind {
            NodeKind::Text(text) => {
                let text = if self.strip_enabled() { strip_text(text) } else { text.clone() };
                match out.last_mut() {
                    Some(Op::Text(previous)) => previous.push_str(&text),
                    _ if text.is_empty() => {}
                    _ => out.push(Op::Text(text)),
                }
            }
            NodeKind::Print { expr, raw } => {
                let (expr, safe) = self.compile_expr_with_safety(expr)?;
                out.push(Op::Print {
                    expr,
                    escape: !raw && self.escape_for(safe),
                });
            }
            NodeKind::If { branches, otherwise } => out.push(self.compile_if(branches, otherwise.as_deref())?),
            NodeKind::Loop {
                source,
                key,
                value,
                body,
                empty,
            } => {
                let source = self.compile_expr(source)?;
                let empty = empty.as_deref().map(|nodes| self.compile_nodes(nodes)).transpose()?;

                let rebound = key.iter().chain(std::iter::once(value)).cloned().collect::<Vec<_>>();
                self.loops.push(LoopFrame::default());
                self.breakables.push(Breakable::Loop);
                let body = self.compile_loop_body(body, &rebound);
                self.breakables.pop();
                let frame = self.loops.pop().unwrap_or_default();
                let body = body?;

                out.push(Op::Loop(Box::new(LoopOp {
                    source,
                    key: key.clone(),
                    value: value.clone(),
                    body,
                    empty,
                    needs_length: frame.needs_length,
                })));
            }
            NodeKind::While { cond, body } => {
                let cond = self.compile_expr(cond)?;
                self.breakables.push(Breakable::Loop);
                let body = self.compile_loop_body(body, &[]);
                self.breakables.pop();
                let body = body?;
                out.push(Op::While { cond, body });
            }
            NodeKind::Switch { subject, cases, default } => {
                let subject = self.compile_expr(subject)?;
                self.breakables.push(Breakable::Switch);
                let result = self.compile_switch(cases, default.as_deref());
                self.breakables.pop();
                let (cases, default) = result?;
                out.push(Op::Switch { subject, cases, default });
            }
            NodeKind::Set { target, value, mode } => {
                let (value, safe) = match value {
                    SetValue::Expr(expr) => self.compile_expr_with_safety(expr)?,
                    SetValue::Capture { body, filters } => {
                        let body = self.compile_nodes(body)?;
                        let captured = Expr::Render {
                            bindings: Vec::new(),
                            body,
                            isolated: false,
                        };
                        self.apply_filters(captured, true, filters)?
                    }
                };
                let target = self.compile_target(target, safe)?;
                out.push(Op::Assign {
                    target,
                    value,
                    only_if_unset: *mode == SetMode::Add,
                });
            }
            NodeKind::Unset(targets) => {
                let targets = targets
                    .iter()
                    .map(|target| self.compile_target(target, false))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(Op::Unset(targets));
            }
            NodeKind::Block { name, body } => {
                let body = self.compile_nodes(body)?;
                out.push(Op::Block { name: name.clone(), body });
            }
            NodeKind::Parent => {
                if !self.dynamic_child {
                    return Err(self.invalid_usage("Tag {parent} may only be used inside an overriding block"));
                }
                out.push(Op::BlockSuper);
            }
            NodeKind::Extends(_) => {
                return Err(self.invalid_usage("Tag {extends} is only allowed at the top of a template"));
            }
            NodeKind::Use(name) => {
                let program = self.load_ast(name)?;
                self.hoist_macros(&program);
            }
            NodeKind::Include { name, params } => self.compile_include(name, params, out)?,
            NodeKind::Insert(name) => {
                if self.including.iter().any(|n| n == name) {
                    return Err(self.invalid_usage(format!("Recursive insert of '{}'", name)));
                }
                let program = self.load_ast(name)?;
                if program.iter().any(|node| matches!(node.kind, NodeKind::Extends(_))) {
                    return Err(self.invalid_usage(format!("Inserted template '{}' can not use {{extends}}", name)));
                }
                self.including.push(SmolStr::new(name));
                self.hoist_macros(&program);
                let result = program.iter().try_for_each(|node| self.compile_node(node, out));
                self.including.pop();
                self.set_line(node.line);
                result?;
            }
            NodeKind::Import { source, names, alias } => self.compile_import(source, names.as_deref(), alias.as_ref())?,
            NodeKind::Macro(def) => {
                self.macros
                    .entry(def.name.clone())
                    .or_insert_with(|| Arc::new(def.clone()));
            }
            NodeKind::FilterBlock { filters, body } => {
                let body = self.compile_nodes(body)?;
                let captured = Expr::Render {
                    bindings: Vec::new(),
                    body,
                    isolated: false,
                };
                let (expr, _) = self.apply_filters(captured, true, filters)?;
                out.push(Op::Print { expr, escape: false });
            }
            NodeKind::Autoescape { enabled, body } => {
                self.autoescape.push(*enabled);
                let result = body.iter().try_for_each(|node| self.compile_node(node, out));
                self.autoescape.pop();
                result?;
            }
            NodeKind::Strip(body) => {
                self.strip.push(true);
                let result = body.iter().try_for_each(|node| self.compile_node(node, out));
                self.strip.pop();
                result?;
            }
            NodeKind::Cycle(values) => {
                let mut safe = true;
                let mut compiled = Vec::with_capacity(values.len());
                for value in values {
                    let (value, value_safe) = self.compile_expr_with_safety(value)?;
                    safe &= value_safe;
                    compiled.push(value);
                }
                out.push(Op::Cycle {
                    values: compiled,
                    escape: self.escape_for(safe),
                });
            }
            NodeKind::Do(expr) => out.push(Op::Eval(self.compile_expr(expr)?)),
            NodeKind::Break => match self.breakables.last() {
                Some(Breakable::Loop) => out.push(Op::Break),
                Some(Breakable::Switch) => {}
                None => return Err(self.invalid_usage("Tag {break} may only be used inside a loop")),
            },
            NodeKind::Continue => {
                if !self.breakables.contains(&Breakable::Loop) {
                    return Err(self.invalid_usage("Tag {continue} may only be used inside a loop"));
                }
                out.push(Op::Continue);
            }
            NodeKind::Tag {
                name,
                args,
                assign,
                body,
            } => out.extend(self.compile_tag(name, args, assign.as_ref(), body.as_deref())?),
        }

        Ok(())
    }

    fn compile_if(
        &mut self,
        branches: &[(ast::Expr, Vec<ast::Node>)],
        otherwise: Option<&[ast::Node]>,
    ) -> Result<Op, CompileError> {
        let before = self.safety.clone();
        let mut outcomes = Vec::with_capacity(branches.len() + 1);
        let mut compiled = Vec::with_capacity(branches.len());

        for (cond, body) in branches {
            self.safety = before.clone();
            let mut cond_ir = self.compile_expr(cond)?;
            if self.config().if_empty && cond.is_plain_variable() {
                cond_ir = Expr::NotEmpty(Box::new(cond_ir));
            }
            compiled.push((cond_ir, self.compile_nodes(body)?));
            outcomes.push(self.safety.clone());
        }

        self.safety = before.clone();
        let otherwise = otherwise.map(|body| self.compile_nodes(body)).transpose()?;
        outcomes.push(self.safety.clone());
        self.merge_safety(before, outcomes);

        Ok(Op::If {
            branches: compiled,
            otherwise,
        })
    }

    fn compile_switch(
        &mut self,
        cases: &[(Vec<ast::Expr>, Vec<ast::Node>)],
        default: Option<&[ast::Node]>,
    ) -> Result<(SwitchCases, Option<Vec<Op>>), CompileError> {
        let before = self.safety.clone();
        let mut outcomes = Vec::with_capacity(cases.len() + 1);
        let mut compiled = Vec::with_capacity(cases.len());

        for (values, body) in cases {
            self.safety = before.clone();
            let values = values
                .iter()
                .map(|value| self.compile_expr(value))
                .collect::<Result<Vec<_>, _>>()?;
            compiled.push((values, self.compile_nodes(body)?));
            outcomes.push(self.safety.clone());
        }

        self.safety = before.clone();
        let default = default.map(|body| self.compile_nodes(body)).transpose()?;
        outcomes.push(self.safety.clone());
        self.merge_safety(before, outcomes);
        Ok((compiled, default))
    }

    /// Compiles a loop body until the safe set at the end of an iteration agrees with
    /// the one at its start, so a later reassignment is seen by earlier prints.
    fn compile_loop_body(&mut self, body: &[ast::Node], rebound: &[SmolStr]) -> Result<Vec<Op>, CompileError> {
        let mut entry = self.safety.clone();
        loop {
            self.safety = entry.clone();
            for name in rebound {
                self.mark_unsafe(name);
            }
            let ops = self.compile_nodes(body)?;

            let mut next = entry.clone();
            next.merge(&[entry.clone(), self.safety.clone()]);
            if next == entry {
                self.safety = next;
                return Ok(ops);
            }
            entry = next;
        }
    }

    fn merge_safety(&mut self, mut before: SafetyTracker, outcomes: Vec<SafetyTracker>) {
        before.merge(&outcomes);
        self.safety = before;
    }

    fn compile_target(&mut self, target: &ast::Target, safe: bool) -> Result<Target, CompileError> {
        let path = self.compile_path(&target.path)?;
        if target.path.is_empty() && !target.append && safe {
            self.mark_safe(&target.name);
        } else {
            self.mark_unsafe(&target.name);
        }
        Ok(Target {
            name: target.name.clone(),
            path,
            append: target.append,
        })
    }

    fn compile_include(
        &mut self,
        name: &ast::Expr,
        params: &[(SmolStr, ast::Expr)],
        out: &mut Vec<Op>,
    ) -> Result<(), CompileError> {
        let bindings = params
            .iter()
            .map(|(param, value)| Ok((param.clone(), self.compile_expr(value)?)))
            .collect::<Result<Vec<_>, CompileError>>()?;

        let inline = match name.as_str() {
            Some(template)
                if self.options().contains(Options::FORCE_INCLUDE) && !self.including.iter().any(|n| n == template) =>
            {
                Some(template)
            }
            _ => None,
        };

        if let Some(template) = inline {
            let program = self.load_ast(template)?;
            if !program.iter().any(|node| matches!(node.kind, NodeKind::Extends(_))) {
                let line = self.line();
                self.including.push(SmolStr::new(template));
                let safety = self.safety.clone();
                for (param, _) in params {
                    self.mark_unsafe(param);
                }
                self.hoist_macros(&program);
                let body = self.compile_nodes(&program);
                self.safety = safety;
                self.including.pop();
                self.set_line(line);
                out.push(Op::Scope { bindings, body: body? });
                return Ok(());
            }
        }

        let name = self.compile_expr(name)?;
        out.push(Op::Include { name, params: bindings });
        Ok(())
    }

    fn compile_import(
        &mut self,
        source: &str,
        names: Option<&[SmolStr]>,
        alias: Option<&SmolStr>,
    ) -> Result<(), CompileError> {
        let program = self.load_ast(source)?;
        let available = program
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Macro(def) => Some((def.name.clone(), Arc::new(def.clone()))),
                _ => None,
            })
            .collect::<FxHashMap<_, _>>();

        let selected = match names {
            Some(names) => names
                .iter()
                .map(|name| match available.get(name) {
                    Some(def) => Ok((name.clone(), Arc::clone(def))),
                    None => Err(self.invalid_usage(format!("Macro '{}' not found in '{}'", name, source))),
                })
                .collect::<Result<FxHashMap<_, _>, _>>()?,
            None => available,
        };

        match alias {
            Some(alias) => {
                self.namespaces.entry(alias.clone()).or_default().extend(selected);
            }
            None => self.macros.extend(selected),
        }
        Ok(())
    }

    fn compile_tag(
        &mut self,
        name: &SmolStr,
        args: &[ast::Expr],
        assign: Option<&SmolStr>,
        body: Option<&[ast::Node]>,
    ) -> Result<Vec<Op>, CompileError> {
        let Some(entry) = self.config().extensions.tags.resolve(name) else {
            return Err(CompileError::UnknownTag {
                name: name.clone(),
                line: self.line(),
            });
        };
        let body = body.map(|nodes| self.compile_nodes(nodes)).transpose()?;

        match &entry.kind {
            Extension::Generator(generator) => generator(self, TagCall {
                name,
                args,
                assign,
                body,
            }),
            Extension::Alias(_) => {
                let args = args
                    .iter()
                    .map(|arg| self.compile_expr(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let escape = match assign {
                    Some(var) => {
                        if entry.safe {
                            self.mark_safe(var);
                        } else {
                            self.mark_unsafe(var);
                        }
                        false
                    }
                    None => self.escape_for(entry.safe),
                };
                Ok(vec![Op::Tag {
                    name: name.clone(),
                    args,
                    body,
                    assign: assign.cloned(),
                    escape,
                }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::between_tags("<a>  \n <b>", "<a><b>")]
    #[case::runs("a \n\t b", "a b")]
    #[case::untouched("ab", "ab")]
    fn test_strip_text(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_text(input), expected);
    }
}
