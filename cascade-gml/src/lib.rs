//! # cascade-gml
//!
//! GML (Generic Mapping Language) expression engine for Cascade flows.
//!
//! GML is the embedded expression language used in flow definitions for
//! `args`, `with`, `sets`, `vars`, `when` and `only` blocks: a null-safe
//! mapping language with method-chain pipelines, template interpolation,
//! CASE expressions, arrow functions and user-defined functions.
//!
//! ## Example
//!
//! ```
//! use cascade_gml::{Context, Value, evaluate};
//!
//! let mut ctx = Context::new();
//! ctx.set("items", Value::array([
//!     Value::object([("price", Value::Int(10))]),
//!     Value::object([("price", Value::Int(30))]),
//! ]));
//!
//! let total = evaluate("items.sum('price')", &ctx).unwrap();
//! assert_eq!(total, Value::Float(40.0));
//! ```

pub mod ast;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod methods;
pub mod parser;
pub mod udf;
pub mod value;

pub use context::Context;
pub use error::{GmlError, GmlResult};
pub use evaluator::Evaluator;
pub use parser::Parser;
pub use udf::{Udf, UdfKind, UdfParam};
pub use value::{LambdaValue, Object, Value};

/// Parse and evaluate a GML block against a context.
pub fn evaluate(source: &str, ctx: &Context) -> GmlResult<Value> {
    Evaluator::new().evaluate(source, ctx)
}

/// Parse and evaluate a GML block, returning the assignment bindings.
pub fn evaluate_bindings(source: &str, ctx: &Context) -> GmlResult<Object> {
    Evaluator::new().evaluate_bindings(source, ctx)
}

/// Evaluate a boolean guard expression (`when` / `only`).
pub fn evaluate_bool(source: &str, ctx: &Context) -> GmlResult<bool> {
    Evaluator::new().evaluate_bool(source, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_lookup() {
        let mut ctx = Context::new();
        ctx.set("name", Value::string("Alice"));
        assert_eq!(evaluate("name", &ctx).unwrap(), Value::string("Alice"));
    }

    #[test]
    fn test_pipeline() {
        let mut ctx = Context::new();
        ctx.set(
            "orders",
            Value::array([
                Value::object([("amount", Value::Int(5)), ("open", Value::Bool(true))]),
                Value::object([("amount", Value::Int(7)), ("open", Value::Bool(false))]),
                Value::object([("amount", Value::Int(11)), ("open", Value::Bool(true))]),
            ]),
        );
        let total = evaluate("orders.filter(o => o.open).sum('amount')", &ctx).unwrap();
        assert_eq!(total, Value::Float(16.0));
    }
}
