//! User-defined functions.
//!
//! Expression UDFs carry a GML script parsed once at registration and
//! evaluated per call in a fresh child frame with parameters bound.
//! Native UDFs wrap a host-registered Rust closure; that is how embedders
//! contribute compiled functions to the registry.

use crate::ast::Script;
use crate::error::{GmlError, GmlResult};
use crate::parser::Parser;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

pub type NativeFn = Arc<dyn Fn(&[Value]) -> GmlResult<Value> + Send + Sync>;

pub struct Udf {
    pub name: String,
    pub params: Vec<UdfParam>,
    pub kind: UdfKind,
}

#[derive(Debug, Clone)]
pub struct UdfParam {
    pub name: String,
    pub default: Option<Value>,
    pub required: bool,
}

impl UdfParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
            required: false,
        }
    }
}

pub enum UdfKind {
    /// A GML expression body, parsed at registration time.
    Expression(Script),
    /// A host-provided Rust closure.
    Native(NativeFn),
}

impl Udf {
    /// Build an expression UDF, parsing `source` once up front. A malformed
    /// body is rejected here rather than at first call.
    pub fn expression(
        name: impl Into<String>,
        params: Vec<UdfParam>,
        source: &str,
    ) -> GmlResult<Self> {
        let script = Parser::new(source)?.parse()?;
        Ok(Self {
            name: name.into(),
            params,
            kind: UdfKind::Expression(script),
        })
    }

    pub fn native(name: impl Into<String>, params: Vec<UdfParam>, f: NativeFn) -> Self {
        Self {
            name: name.into(),
            params,
            kind: UdfKind::Native(f),
        }
    }

    /// Bind positional call arguments to declared parameters, filling
    /// defaults and rejecting missing required parameters.
    pub fn bind_args(&self, args: &[Value]) -> GmlResult<Vec<(String, Value)>> {
        let mut bound = Vec::with_capacity(self.params.len());
        for (i, param) in self.params.iter().enumerate() {
            let value = match args.get(i) {
                Some(v) => v.clone(),
                None => match &param.default {
                    Some(default) => default.clone(),
                    None if param.required => {
                        return Err(GmlError::InvalidArgument(format!(
                            "{}: missing required parameter '{}'",
                            self.name, param.name
                        )));
                    }
                    None => Value::Null,
                },
            };
            bound.push((param.name.clone(), value));
        }
        Ok(bound)
    }
}

impl fmt::Debug for Udf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            UdfKind::Expression(_) => "expression",
            UdfKind::Native(_) => "native",
        };
        f.debug_struct("Udf")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("kind", &kind)
            .finish()
    }
}
