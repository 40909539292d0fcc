//! Functional-rate expression evaluation.
//!
//! The engine never embeds expression parsing or sandboxing logic of its own;
//! it consumes a narrow [ExpressionEvaluator] capability. The default backend
//! compiles `evalexpr` operator trees. A minimal fallback keeps
//! network-generation-time evaluation functional when no backend is
//! installed, but must never stand in for runtime kinetics.
//!
//! Whether functional rates are allowed at all is an explicit configuration
//! value ([EvaluatorConfig]) threaded into the engine constructor; cache
//! invalidation is an explicit call ([RateEvaluator::invalidate_caches]),
//! made by the scheduler when parameters change.

use crate::error::SimulatorError;
use crate::network::UserFunction;
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node,
    Operator, Value,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Variable bindings for one rate evaluation: parameters, observable values,
/// raw species concentrations and `ridx{j}` reactant aliases.
pub type RateContext = HashMap<String, f64>;

/// A compiled rate expression, evaluated against a [RateContext].
#[derive(Clone)]
pub struct CompiledExpr(Arc<dyn Fn(&RateContext) -> Result<f64, SimulatorError> + Send + Sync>);

impl CompiledExpr {
    pub fn new(
        f: impl Fn(&RateContext) -> Result<f64, SimulatorError> + Send + Sync + 'static,
    ) -> Self {
        CompiledExpr(Arc::new(f))
    }

    pub fn eval(&self, ctx: &RateContext) -> Result<f64, SimulatorError> {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompiledExpr")
    }
}

/// Narrow contract for the external expression capability.
pub trait ExpressionEvaluator: Send + Sync {
    /// Compile an expression over a permitted variable set.
    fn compile(
        &self,
        expr: &str,
        allowed_vars: &[String],
    ) -> Result<CompiledExpr, SimulatorError>;

    /// Names of all variables the expression reads.
    fn referenced_variables(&self, expr: &str) -> Result<Vec<String>, SimulatorError>;

    /// Evaluate an expression with no free variables.
    fn evaluate_constant(&self, expr: &str) -> Result<f64, SimulatorError>;
}

/// Engine-wide evaluator configuration.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorConfig {
    /// When false, any attempt to build or evaluate a functional rate is a
    /// hard, phase-aborting error with a fixed diagnostic.
    pub functional_rates_enabled: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        EvaluatorConfig {
            functional_rates_enabled: true,
        }
    }
}

/// Known math functions rewritten into the `math::` namespace the backend
/// expects. Rate laws use the bare names.
const MATH_FNS: &[(&str, &str)] = &[
    ("sqrt", "math::sqrt"),
    ("exp", "math::exp"),
    ("ln", "math::ln"),
    ("log10", "math::log10"),
    ("log2", "math::log2"),
    ("pow", "math::pow"),
    ("sin", "math::sin"),
    ("cos", "math::cos"),
    ("tan", "math::tan"),
    ("abs", "math::abs"),
];

/// Rewrite bare math function calls into namespaced form.
fn rewrite_math_fns(expr: &str) -> String {
    let bytes = expr.as_bytes();
    let mut out = String::with_capacity(expr.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let ident = &expr[start..i];
            // Only a call position triggers the rewrite, and never one that
            // is already namespaced.
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let is_call = j < bytes.len() && bytes[j] == b'(';
            let already_namespaced = start >= 2 && &expr[start - 2..start] == "::";
            if is_call && !already_namespaced {
                if let Some((_, ns)) = MATH_FNS.iter().find(|(bare, _)| *bare == ident) {
                    out.push_str(ns);
                    continue;
                }
            }
            out.push_str(ident);
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// True when the expression contains function-call syntax (`ident(`).
/// Used as the classification fallback when dependency extraction fails.
pub fn contains_call_syntax(expr: &str) -> bool {
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if (bytes[i] as char).is_ascii_alphabetic() || bytes[i] == b'_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'(' && i > start {
                return true;
            }
        } else {
            i += 1;
        }
    }
    false
}

fn walk_identifiers(node: &Node<DefaultNumericTypes>, out: &mut HashSet<String>) {
    if let Operator::VariableIdentifierRead { identifier } = node.operator() {
        out.insert(identifier.to_string());
    }
    for child in node.children() {
        walk_identifiers(child, out);
    }
}

/// Default expression backend over `evalexpr` operator trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalexprEvaluator;

impl ExpressionEvaluator for EvalexprEvaluator {
    fn compile(
        &self,
        expr: &str,
        allowed_vars: &[String],
    ) -> Result<CompiledExpr, SimulatorError> {
        let rewritten = rewrite_math_fns(expr);
        let node = build_operator_tree::<DefaultNumericTypes>(&rewritten)
            .map_err(|e| SimulatorError::Expression(format!("parse of '{expr}' failed: {e}")))?;
        let mut referenced = HashSet::new();
        walk_identifiers(&node, &mut referenced);
        let bound: Vec<String> = allowed_vars
            .iter()
            .filter(|v| referenced.contains(*v))
            .cloned()
            .collect();
        let source = expr.to_string();
        Ok(CompiledExpr::new(move |ctx: &RateContext| {
            let mut context = HashMapContext::<DefaultNumericTypes>::new();
            for name in &bound {
                let value = ctx.get(name).copied().ok_or_else(|| {
                    SimulatorError::Expression(format!(
                        "variable '{name}' missing while evaluating '{source}'"
                    ))
                })?;
                context
                    .set_value(name.clone(), Value::from_float(value))
                    .map_err(|e| SimulatorError::Expression(e.to_string()))?;
            }
            node.eval_number_with_context(&context)
                .map_err(|e| SimulatorError::Expression(format!("eval of '{source}' failed: {e}")))
        }))
    }

    fn referenced_variables(&self, expr: &str) -> Result<Vec<String>, SimulatorError> {
        let rewritten = rewrite_math_fns(expr);
        let node = build_operator_tree::<DefaultNumericTypes>(&rewritten)
            .map_err(|e| SimulatorError::Expression(format!("parse of '{expr}' failed: {e}")))?;
        let mut referenced = HashSet::new();
        walk_identifiers(&node, &mut referenced);
        let mut vars: Vec<String> = referenced.into_iter().collect();
        vars.sort();
        Ok(vars)
    }

    fn evaluate_constant(&self, expr: &str) -> Result<f64, SimulatorError> {
        let rewritten = rewrite_math_fns(expr);
        let node = build_operator_tree::<DefaultNumericTypes>(&rewritten)
            .map_err(|e| SimulatorError::Expression(format!("parse of '{expr}' failed: {e}")))?;
        let context = HashMapContext::<DefaultNumericTypes>::new();
        node.eval_number_with_context(&context)
            .map_err(|e| SimulatorError::Expression(format!("eval of '{expr}' failed: {e}")))
    }
}

/// Minimal stand-in used when no backend is installed: identity lookup for a
/// single identifier, literal parsing otherwise. Keeps network-generation
/// time evaluation working before the real evaluator loads; never used for
/// runtime kinetics when a backend is expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackEvaluator;

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ExpressionEvaluator for FallbackEvaluator {
    fn compile(
        &self,
        expr: &str,
        _allowed_vars: &[String],
    ) -> Result<CompiledExpr, SimulatorError> {
        let trimmed = expr.trim().to_string();
        Ok(CompiledExpr::new(move |ctx: &RateContext| {
            if is_identifier(&trimmed) {
                match ctx.get(&trimmed) {
                    Some(v) => Ok(*v),
                    None => {
                        log::warn!("fallback evaluator: '{trimmed}' not found in context");
                        Ok(0.0)
                    }
                }
            } else {
                Ok(trimmed.parse::<f64>().unwrap_or(0.0))
            }
        }))
    }

    fn referenced_variables(&self, expr: &str) -> Result<Vec<String>, SimulatorError> {
        let trimmed = expr.trim();
        if is_identifier(trimmed) {
            Ok(vec![trimmed.to_string()])
        } else {
            Ok(Vec::new())
        }
    }

    fn evaluate_constant(&self, expr: &str) -> Result<f64, SimulatorError> {
        expr.trim()
            .parse::<f64>()
            .map_err(|_| SimulatorError::Expression(format!("'{expr}' is not a literal")))
    }
}

const MAX_CACHE_ENTRIES: usize = 2000;
const MAX_INLINE_PASSES: usize = 10;

/// Engine-facing facade over the evaluator capability.
///
/// Owns the user-function inlining pass and bounded expression caches.
/// Single-threaded by contract, hence the interior `RefCell`s.
pub struct RateEvaluator {
    backend: Arc<dyn ExpressionEvaluator>,
    config: EvaluatorConfig,
    functions: Vec<UserFunction>,
    expanded: RefCell<HashMap<String, String>>,
    compiled: RefCell<HashMap<String, CompiledExpr>>,
}

impl RateEvaluator {
    pub fn new(
        backend: Arc<dyn ExpressionEvaluator>,
        config: EvaluatorConfig,
        functions: Vec<UserFunction>,
    ) -> Self {
        RateEvaluator {
            backend,
            config,
            functions,
            expanded: RefCell::new(HashMap::new()),
            compiled: RefCell::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &dyn ExpressionEvaluator {
        self.backend.as_ref()
    }

    pub fn functional_rates_enabled(&self) -> bool {
        self.config.functional_rates_enabled
    }

    /// Drop every cached expansion and compilation. Called by the scheduler
    /// whenever parameters change at a phase boundary.
    pub fn invalidate_caches(&self) {
        self.expanded.borrow_mut().clear();
        self.compiled.borrow_mut().clear();
    }

    /// Inline user-function calls textually, bounded to a fixed pass count so
    /// mutually recursive definitions cannot loop forever.
    pub fn expand(&self, expression: &str) -> String {
        if let Some(hit) = self.expanded.borrow().get(expression) {
            return hit.clone();
        }
        let mut expr = expression.to_string();
        for _ in 0..MAX_INLINE_PASSES {
            let mut replaced = false;
            for func in &self.functions {
                let call = format!("{}()", func.name);
                if expr.contains(&call) {
                    expr = expr.replace(&call, &format!("({})", func.expression));
                    replaced = true;
                }
                if func.args.is_empty() {
                    if let Some(next) = replace_bare_identifier(&expr, &func.name, &func.expression)
                    {
                        expr = next;
                        replaced = true;
                    }
                }
            }
            if !replaced {
                break;
            }
        }
        let mut cache = self.expanded.borrow_mut();
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(expression.to_string(), expr.clone());
        expr
    }

    /// Evaluate a functional rate expression against the merged context.
    ///
    /// Fails hard when functional rates are disabled; other failures bubble
    /// up as [SimulatorError::Expression] for the caller to zero and report.
    pub fn evaluate(&self, expression: &str, ctx: &RateContext) -> Result<f64, SimulatorError> {
        if !self.config.functional_rates_enabled {
            return Err(SimulatorError::FunctionalRatesDisabled);
        }
        let compiled = self.compiled_for(expression, ctx)?;
        compiled.eval(ctx)
    }

    /// Compile (or fetch from cache) the expanded form of an expression.
    pub fn compiled_for(
        &self,
        expression: &str,
        ctx: &RateContext,
    ) -> Result<CompiledExpr, SimulatorError> {
        if !self.config.functional_rates_enabled {
            return Err(SimulatorError::FunctionalRatesDisabled);
        }
        let expanded = self.expand(expression);
        if let Some(hit) = self.compiled.borrow().get(&expanded) {
            return Ok(hit.clone());
        }
        let allowed: Vec<String> = ctx.keys().cloned().collect();
        let compiled = self.backend.compile(&expanded, &allowed)?;
        let mut cache = self.compiled.borrow_mut();
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(expanded, compiled.clone());
        Ok(compiled)
    }

    /// Constant evaluation with a literal-parse fallback, for scheduled
    /// concentration changes and static rate strings.
    pub fn evaluate_constant_or_parse(&self, expr: &str) -> f64 {
        match self.backend.evaluate_constant(expr) {
            Ok(v) if v.is_finite() => v,
            _ => expr.trim().parse::<f64>().unwrap_or(0.0),
        }
    }
}

/// Replace whole-word occurrences of `name` (not followed by `(`) with the
/// parenthesized replacement. Returns `None` when nothing matched.
fn replace_bare_identifier(expr: &str, name: &str, replacement: &str) -> Option<String> {
    let bytes = expr.as_bytes();
    let mut out = String::with_capacity(expr.len());
    let mut i = 0;
    let mut replaced = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let ident = &expr[start..i];
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let is_call = j < bytes.len() && bytes[j] == b'(';
            if ident == name && !is_call {
                out.push('(');
                out.push_str(replacement);
                out.push(')');
                replaced = true;
            } else {
                out.push_str(ident);
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    if replaced {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> RateContext {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn compiles_and_evaluates_simple_rate() {
        let eval = EvalexprEvaluator;
        let compiled = eval
            .compile("k * S / (K + S)", &["k".into(), "K".into(), "S".into()])
            .unwrap();
        let value = compiled.eval(&ctx(&[("k", 2.0), ("K", 1.0), ("S", 3.0)])).unwrap();
        assert!((value - 1.5).abs() < 1e-12);
    }

    #[test]
    fn extracts_referenced_variables_sorted() {
        let eval = EvalexprEvaluator;
        let vars = eval.referenced_variables("b + a * sqrt(c)").unwrap();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn rewrites_math_functions() {
        assert_eq!(rewrite_math_fns("sqrt(x) + exp(y)"), "math::sqrt(x) + math::exp(y)");
        // Not a call position: no rewrite.
        assert_eq!(rewrite_math_fns("sqrt + 1"), "sqrt + 1");
    }

    #[test]
    fn call_syntax_scan() {
        assert!(contains_call_syntax("Hill(V, K, n)"));
        assert!(!contains_call_syntax("k1 * 2.0"));
    }

    #[test]
    fn fallback_identity_lookup_and_literals() {
        let eval = FallbackEvaluator;
        let f = eval.compile("ka", &[]).unwrap();
        assert_eq!(f.eval(&ctx(&[("ka", 0.3)])).unwrap(), 0.3);
        let g = eval.compile("0.01", &[]).unwrap();
        assert_eq!(g.eval(&ctx(&[])).unwrap(), 0.01);
    }

    #[test]
    fn inlines_zero_arg_functions() {
        let re = RateEvaluator::new(
            Arc::new(EvalexprEvaluator),
            EvaluatorConfig::default(),
            vec![UserFunction {
                name: "f_act".into(),
                args: vec![],
                expression: "k_on * Lig".into(),
            }],
        );
        assert_eq!(re.expand("f_act() * 2"), "(k_on * Lig) * 2");
        assert_eq!(re.expand("f_act * 2"), "(k_on * Lig) * 2");
    }

    #[test]
    fn disabled_flag_is_a_hard_error() {
        let re = RateEvaluator::new(
            Arc::new(EvalexprEvaluator),
            EvaluatorConfig {
                functional_rates_enabled: false,
            },
            vec![],
        );
        let err = re.evaluate("k1 * 2", &ctx(&[("k1", 1.0)])).unwrap_err();
        assert!(matches!(err, SimulatorError::FunctionalRatesDisabled));
    }

    #[test]
    fn invalidation_clears_cached_expansions() {
        let re = RateEvaluator::new(
            Arc::new(EvalexprEvaluator),
            EvaluatorConfig::default(),
            vec![],
        );
        let _ = re.expand("k1 + 1");
        assert!(!re.expanded.borrow().is_empty());
        re.invalidate_caches();
        assert!(re.expanded.borrow().is_empty());
        assert!(re.compiled.borrow().is_empty());
    }
}
