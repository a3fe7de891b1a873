use std::sync::Arc;

use smol_str::SmolStr;

use super::CompilationSession;
use super::error::CompileError;
use crate::ast::node::{self as ast, Arg, Callee, FilterCall, IsTest, Literal, MacroDef, PathSegment};
use crate::extension::{AccessorCall, Extension};
use crate::ir::{self, BinaryOp, Const, Expr, LoopField, Segment, UnaryOp};
use crate::options::Options;

pub(super) fn literal(literal: &Literal) -> Const {
    match literal {
        Literal::Null => Const::Null,
        Literal::Bool(b) => Const::Bool(*b),
        Literal::Number(n) => Const::Number(*n),
        Literal::String(s) => Const::String(SmolStr::new(s)),
    }
}

fn not(expr: Expr) -> Expr {
    Expr::Unary {
        op: UnaryOp::Not,
        operand: Box::new(expr),
    }
}

impl CompilationSession<'_> {
    pub fn compile_expr(&mut self, expr: &ast::Expr) -> Result<Expr, CompileError> {
        self.compile_expr_with_safety(expr).map(|(expr, _)| expr)
    }

    /// Lowers `expr` and reports whether its value can be printed without escaping.
    pub fn compile_expr_with_safety(&mut self, expr: &ast::Expr) -> Result<(Expr, bool), CompileError> {
        match expr {
            ast::Expr::Literal(l) => Ok((Expr::Const(literal(l)), true)),
            ast::Expr::Var(name, path) => {
                let safe = self.safety.is_safe(&dotted(name, path));
                Ok((
                    Expr::Var {
                        name: name.clone(),
                        path: self.compile_path(path)?,
                    },
                    safe,
                ))
            }
            ast::Expr::Get(base, segment) => {
                let base = self.compile_expr(base)?;
                let segment = self.compile_segment(segment)?;
                Ok((
                    Expr::Get {
                        base: Box::new(base),
                        segment,
                    },
                    false,
                ))
            }
            ast::Expr::LoopMeta(fields) => self.compile_loop_meta(fields).map(|expr| (expr, true)),
            ast::Expr::Accessor { name, path, args } => self.compile_accessor(name, path, args.as_deref()),
            ast::Expr::Unary(op, operand) => {
                let operand = self.compile_expr(operand)?;
                Ok((
                    Expr::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    true,
                ))
            }
            ast::Expr::Binary(op, lhs, rhs) => {
                let (lhs, lhs_safe) = self.compile_expr_with_safety(lhs)?;
                let (rhs, rhs_safe) = self.compile_expr_with_safety(rhs)?;
                let safe = match op {
                    BinaryOp::Concat | BinaryOp::ConcatSpace => lhs_safe && rhs_safe,
                    _ => true,
                };
                Ok((
                    Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    safe,
                ))
            }
            ast::Expr::Ternary { cond, then, otherwise } => {
                let cond = self.compile_expr(cond)?;
                let (then, then_safe) = self.compile_expr_with_safety(then)?;
                let (otherwise, otherwise_safe) = self.compile_expr_with_safety(otherwise)?;
                Ok((
                    Expr::Ternary {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    then_safe && otherwise_safe,
                ))
            }
            ast::Expr::IfSet { cond, then, otherwise } => {
                let cond = self.compile_expr(cond)?;
                let (then, then_safe) = self.compile_expr_with_safety(then)?;
                let (otherwise, otherwise_safe) = self.compile_expr_with_safety(otherwise)?;
                Ok((
                    Expr::IfSet {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    then_safe && otherwise_safe,
                ))
            }
            ast::Expr::Elvis(lhs, rhs) => {
                let (lhs, lhs_safe) = self.compile_expr_with_safety(lhs)?;
                let (rhs, rhs_safe) = self.compile_expr_with_safety(rhs)?;
                Ok((Expr::Elvis(Box::new(lhs), Box::new(rhs)), lhs_safe && rhs_safe))
            }
            ast::Expr::Coalesce(lhs, rhs) => {
                let (lhs, lhs_safe) = self.compile_expr_with_safety(lhs)?;
                let (rhs, rhs_safe) = self.compile_expr_with_safety(rhs)?;
                Ok((Expr::Coalesce(Box::new(lhs), Box::new(rhs)), lhs_safe && rhs_safe))
            }
            ast::Expr::NotEmpty(value) => Ok((Expr::NotEmpty(Box::new(self.compile_expr(value)?)), true)),
            ast::Expr::IsSet(value) => Ok((Expr::IsSet(Box::new(self.compile_expr(value)?)), true)),
            ast::Expr::Is { value, test, negated } => {
                let value = self.compile_expr(value)?;
                let expr = self.compile_is(value, test)?;
                Ok((if *negated { not(expr) } else { expr }, true))
            }
            ast::Expr::In {
                needle,
                haystack,
                mode,
                negated,
            } => {
                let expr = Expr::In {
                    needle: Box::new(self.compile_expr(needle)?),
                    haystack: Box::new(self.compile_expr(haystack)?),
                    mode: *mode,
                };
                Ok((if *negated { not(expr) } else { expr }, true))
            }
            ast::Expr::Range { from, to } => Ok((
                Expr::Range {
                    from: Box::new(self.compile_expr(from)?),
                    to: Box::new(self.compile_expr(to)?),
                },
                true,
            )),
            ast::Expr::Array(items) => {
                let items = items
                    .iter()
                    .map(|(key, value)| {
                        let key = key.as_ref().map(|key| self.compile_expr(key)).transpose()?;
                        Ok((key, self.compile_expr(value)?))
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Ok((Expr::Array(items), false))
            }
            ast::Expr::Call {
                target: Callee::Function(name),
                args,
            } => self.compile_call(name, args),
            ast::Expr::Call {
                target: Callee::Method { object, name },
                args,
            } => self.compile_method(object, name, args),
            ast::Expr::Filtered { base, filters } => {
                let (base, safe) = self.compile_expr_with_safety(base)?;
                self.apply_filters(base, safe, filters)
            }
        }
    }

    pub(super) fn compile_path(&mut self, path: &[PathSegment]) -> Result<Vec<Segment>, CompileError> {
        path.iter().map(|segment| self.compile_segment(segment)).collect()
    }

    fn compile_segment(&mut self, segment: &PathSegment) -> Result<Segment, CompileError> {
        Ok(match segment {
            PathSegment::Name(name) => Segment::Name(name.clone()),
            PathSegment::Index(index) => Segment::Index(Box::new(self.compile_expr(index)?)),
        })
    }

    /// Pipes `base` through `filters`. The result is safe when the last filter is.
    pub(super) fn apply_filters(
        &mut self,
        base: Expr,
        base_safe: bool,
        filters: &[FilterCall],
    ) -> Result<(Expr, bool), CompileError> {
        filters.iter().try_fold((base, base_safe), |(base, _), filter| {
            let Some(entry) = self.config().extensions.filters.resolve(&filter.name) else {
                return Err(CompileError::UnknownFilter {
                    name: filter.name.clone(),
                    line: self.line(),
                });
            };
            let args = filter
                .args
                .iter()
                .map(|arg| self.compile_expr(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let expr = match &entry.kind {
                Extension::Generator(generator) => generator(self, base, args)?,
                Extension::Alias(_) => Expr::Filter {
                    name: filter.name.clone(),
                    base: Box::new(base),
                    args,
                },
            };
            Ok((expr, entry.safe))
        })
    }

    fn compile_loop_meta(&mut self, fields: &[SmolStr]) -> Result<Expr, CompileError> {
        let depth = fields.iter().take_while(|f| *f == "parent").count();
        let field = match &fields[depth..] {
            [field] => LoopField::from_name(field),
            _ => None,
        };
        let Some(field) = field else {
            return Err(self.invalid_usage(format!("Unknown loop property '@{}'", fields.join("."))));
        };

        let Some(index) = self.loops.len().checked_sub(depth + 1) else {
            return Err(self.invalid_usage(format!(
                "Loop property '@{}' used outside of a loop",
                fields.join(".")
            )));
        };
        if field.needs_length() {
            self.loops[index].needs_length = true;
        }
        Ok(Expr::LoopMeta { depth, field })
    }

    fn compile_accessor(
        &mut self,
        name: &SmolStr,
        path: &[PathSegment],
        args: Option<&[Arg]>,
    ) -> Result<(Expr, bool), CompileError> {
        if self.options().contains(Options::DENY_ACCESSOR) {
            return Err(self.security(format!("Accessor $.{} is disabled", name)));
        }
        let Some(entry) = self.config().extensions.accessors.resolve(name) else {
            return Err(CompileError::UnknownAccessor {
                name: name.clone(),
                line: self.line(),
            });
        };

        let path = self.compile_path(path)?;
        let args = args.map(|args| self.compile_positional(args)).transpose()?;
        let expr = match entry {
            Extension::Generator(generator) => generator(self, AccessorCall {
                name: name.clone(),
                path,
                args,
            })?,
            Extension::Alias(_) => Expr::Accessor {
                name: name.clone(),
                args: args.unwrap_or_default(),
                path,
            },
        };
        let safe = matches!(expr, Expr::Const(_) | Expr::Fetch { .. } | Expr::BlockDefined { .. });
        Ok((expr, safe))
    }

    fn compile_positional(&mut self, args: &[Arg]) -> Result<Vec<Expr>, CompileError> {
        args.iter()
            .map(|arg| match &arg.name {
                Some(name) => Err(self.invalid_usage(format!("Named argument '{}' is not supported here", name))),
                None => self.compile_expr(&arg.value),
            })
            .collect()
    }

    fn compile_is(&mut self, value: Expr, test: &IsTest) -> Result<Expr, CompileError> {
        match test {
            IsTest::Check(name) => self.compile_check(name, value),
            IsTest::TypeName(type_name) => Ok(Expr::InstanceOf {
                value: Box::new(value),
                type_name: type_name.clone(),
            }),
            IsTest::Value(expected) => match expected.as_ref() {
                ast::Expr::Var(name, path) if path.is_empty() && self.config().extensions.checks.is_valid(name) => {
                    self.compile_check(name, value)
                }
                expected => Ok(ir::builder::binary(
                    BinaryOp::Identical,
                    value,
                    self.compile_expr(expected)?,
                )),
            },
        }
    }

    fn compile_check(&mut self, name: &SmolStr, value: Expr) -> Result<Expr, CompileError> {
        match self.config().extensions.checks.resolve(name) {
            Some(Extension::Generator(generator)) => generator(self, value),
            Some(Extension::Alias(_)) => Ok(Expr::Check {
                name: name.clone(),
                value: Box::new(value),
            }),
            None => Err(self.invalid_usage(format!("Unknown check 'is {}'", name))),
        }
    }

    /// `name(...)`: a macro, then a function, then a filter called like a function.
    fn compile_call(&mut self, name: &SmolStr, args: &[Arg]) -> Result<(Expr, bool), CompileError> {
        if let Some(def) = self.macros.get(name).cloned() {
            return self.call_macro(def, args).map(|expr| (expr, true));
        }

        let extensions = &self.config().extensions;
        if let Some(function) = extensions.functions.resolve(name) {
            if function.restricted && self.options().contains(Options::DENY_NATIVE_FUNCS) {
                return Err(self.security(format!("Function '{}' is not allowed", name)));
            }
            let args = self.compile_positional(args)?;
            return Ok((ir::builder::call(name.clone(), args), false));
        }

        if let Some(entry) = extensions.filters.resolve(name) {
            let mut args = self.compile_positional(args)?;
            if args.is_empty() {
                return Err(self.invalid_usage(format!("Filter '{}' called as a function needs a value", name)));
            }
            let base = args.remove(0);
            let expr = match &entry.kind {
                Extension::Generator(generator) => generator(self, base, args)?,
                Extension::Alias(_) => Expr::Filter {
                    name: name.clone(),
                    base: Box::new(base),
                    args,
                },
            };
            return Ok((expr, entry.safe));
        }

        Err(CompileError::UnknownFunction {
            name: name.clone(),
            line: self.line(),
        })
    }

    fn compile_method(&mut self, object: &ast::Expr, name: &SmolStr, args: &[Arg]) -> Result<(Expr, bool), CompileError> {
        if let ast::Expr::Var(namespace, path) = object
            && path.is_empty()
            && let Some(macros) = self.namespaces.get(namespace)
        {
            let Some(def) = macros.get(name).cloned() else {
                return Err(self.invalid_usage(format!("Macro '{}' not found in '{}'", name, namespace)));
            };
            return self.call_macro(def, args).map(|expr| (expr, true));
        }

        if self.options().contains(Options::DENY_METHODS) {
            return Err(self.security(format!("Method call '{}()' is not allowed", name)));
        }
        let object = self.compile_expr(object)?;
        let args = self.compile_positional(args)?;
        Ok((
            Expr::Method {
                object: Box::new(object),
                name: name.clone(),
                args,
            },
            false,
        ))
    }

    fn call_macro(&mut self, def: Arc<MacroDef>, args: &[Arg]) -> Result<Expr, CompileError> {
        let bindings = self.bind_args(&def, args)?;
        let reentered = self.expanding.iter().any(|d| Arc::ptr_eq(d, &def));

        if def.recursive || reentered {
            let key = self.macro_key(&def);
            if !self.macro_table.contains_key(&key) {
                self.macro_table.insert(key.clone(), ir::MacroDef {
                    params: def.params.iter().map(|p| p.name.clone()).collect(),
                    body: Vec::new(),
                });
                self.expanding.push(Arc::clone(&def));
                let body = self.compile_macro_body(&def);
                self.expanding.pop();
                let body = body?;
                if let Some(entry) = self.macro_table.get_mut(&key) {
                    entry.body = body;
                }
            }
            return Ok(Expr::Macro {
                name: key,
                args: bindings.into_iter().map(|(_, expr)| expr).collect(),
            });
        }

        if self.expanding.len() >= self.config().max_recursion {
            return Err(CompileError::Recursion {
                name: def.name.clone(),
                limit: self.config().max_recursion,
                line: self.line(),
            });
        }
        self.expanding.push(Arc::clone(&def));
        let body = self.compile_macro_body(&def);
        self.expanding.pop();

        Ok(Expr::Render {
            bindings,
            body: body?,
            isolated: true,
        })
    }

    fn compile_macro_body(&mut self, def: &MacroDef) -> Result<Vec<crate::ir::Op>, CompileError> {
        let line = self.line();
        let autoescape = self.autoescape.clone();
        self.autoescape.truncate(1);
        let body = self.compile_isolated(&def.body);
        self.autoescape = autoescape;
        self.set_line(line);
        body
    }

    /// Binds call arguments to parameters by position or by name, filling defaults.
    fn bind_args(&mut self, def: &MacroDef, args: &[Arg]) -> Result<Vec<(SmolStr, Expr)>, CompileError> {
        let mut slots: Vec<Option<Expr>> = vec![None; def.params.len()];
        let mut position = 0;

        for arg in args {
            let index = match &arg.name {
                None => {
                    if position >= def.params.len() {
                        return Err(self.invalid_usage(format!(
                            "Macro '{}' accepts at most {} argument(s)",
                            def.name,
                            def.params.len()
                        )));
                    }
                    position += 1;
                    position - 1
                }
                Some(name) => match def.params.iter().position(|p| p.name == *name) {
                    Some(index) => index,
                    None => {
                        return Err(self.invalid_usage(format!(
                            "Macro '{}' has no parameter '{}'",
                            def.name, name
                        )));
                    }
                },
            };
            slots[index] = Some(self.compile_expr(&arg.value)?);
        }

        def.params
            .iter()
            .zip(slots)
            .map(|(param, slot)| match (slot, &param.default) {
                (Some(expr), _) => Ok((param.name.clone(), expr)),
                (None, Some(default)) => Ok((param.name.clone(), Expr::Const(literal(default)))),
                (None, None) => Err(self.invalid_usage(format!(
                    "Missing required argument '{}' for macro '{}'",
                    param.name, def.name
                ))),
            })
            .collect()
    }
}

fn dotted(name: &SmolStr, path: &[PathSegment]) -> String {
    let mut dotted = name.to_string();
    for segment in path {
        match segment {
            PathSegment::Name(part) => {
                dotted.push('.');
                dotted.push_str(part);
            }
            PathSegment::Index(_) => break,
        }
    }
    dotted
}
