//! Lexically-scoped variable frames.
//!
//! A `Context` is one frame: its own variables, an optional parent frame,
//! and a UDF registry. Lookup walks local then the parent chain; writes land
//! in the innermost frame only. Parent links are `Arc` snapshots, so the
//! chain is a tree by construction and a child can never mutate its parent.

use crate::udf::Udf;
use crate::value::{Object, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Context {
    variables: Object,
    parent: Option<Arc<Context>>,
    functions: HashMap<String, Arc<Udf>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_object(variables: Object) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Create an empty child frame on top of `parent`. The child inherits
    /// visibility of the parent's variables and UDFs through the chain.
    pub fn child_of(parent: Arc<Context>) -> Self {
        Self {
            variables: Object::new(),
            parent: Some(parent),
            functions: HashMap::new(),
        }
    }

    /// Snapshot this frame and return a child of the snapshot.
    pub fn child(&self) -> Self {
        Self::child_of(Arc::new(self.clone()))
    }

    /// Resolve a variable: local frame first, then the parent chain.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.variables.get(name) {
            return Some(value);
        }
        let mut frame = self.parent.as_deref();
        while let Some(ctx) = frame {
            if let Some(value) = ctx.variables.get(name) {
                return Some(value);
            }
            frame = ctx.parent.as_deref();
        }
        None
    }

    /// Write to the innermost frame. Shadows any parent binding.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn extend(&mut self, bindings: Object) {
        self.variables.extend(bindings);
    }

    /// Variables of this frame only (no parent chain).
    pub fn variables(&self) -> &Object {
        &self.variables
    }

    pub fn into_variables(self) -> Object {
        self.variables
    }

    /// Register a UDF in this frame; children inherit, and may shadow.
    pub fn register_udf(&mut self, udf: Udf) {
        self.functions.insert(udf.name.clone(), Arc::new(udf));
    }

    pub fn lookup_udf(&self, name: &str) -> Option<Arc<Udf>> {
        if let Some(udf) = self.functions.get(name) {
            return Some(udf.clone());
        }
        let mut frame = self.parent.as_deref();
        while let Some(ctx) = frame {
            if let Some(udf) = ctx.functions.get(name) {
                return Some(udf.clone());
            }
            frame = ctx.parent.as_deref();
        }
        None
    }

    /// Flatten the whole chain into one object, innermost bindings winning.
    pub fn flatten(&self) -> Object {
        let mut frames = vec![&self.variables];
        let mut frame = self.parent.as_deref();
        while let Some(ctx) = frame {
            frames.push(&ctx.variables);
            frame = ctx.parent.as_deref();
        }
        let mut out = Object::new();
        for vars in frames.into_iter().rev() {
            for (k, v) in vars {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}
