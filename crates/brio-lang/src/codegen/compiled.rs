//! Closure types produced by code generation.

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::runtime::{Flow, Frame, RuntimeError};
use crate::value::Value;

/// An IR expression turned into a closure over the render frame.
pub type CompiledExpr = Box<dyn Fn(&mut Frame<'_>) -> Result<Value, RuntimeError> + Send + Sync>;

/// An IR statement. Output is appended to the buffer; the returned [`Flow`]
/// carries `break` and `continue` out to the enclosing loop.
pub type CompiledOp = Box<dyn Fn(&mut Frame<'_>, &mut String) -> Result<Flow, RuntimeError> + Send + Sync>;

pub type Body = Vec<CompiledOp>;

pub struct CompiledMacro {
    pub params: Vec<SmolStr>,
    pub body: Body,
}

pub type Macros = FxHashMap<SmolStr, CompiledMacro>;

/// Runs `body`, stopping at the first `break` or `continue`.
pub fn render_body(body: &[CompiledOp], frame: &mut Frame<'_>, out: &mut String) -> Result<Flow, RuntimeError> {
    for op in body {
        match op(frame, out)? {
            Flow::Normal => {}
            flow => return Ok(flow),
        }
    }
    Ok(Flow::Normal)
}
