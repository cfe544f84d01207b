//! Runtime values of the embedded dialect.
//!
//! Reference-counted containers give the namespace Python-like aliasing:
//! two names bound to one list observe each other's mutations. Display
//! integration lives here as a [`RichDisplay`] impl so the conversion layer
//! never needs to know about concrete value shapes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use core_display::RichDisplay;
use core_lang::ast::{Param, Stmt};

/// Intrinsic functions preloaded into every environment. The set must stay
/// in lockstep with the analyzer's builtins table; a test asserts this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Repr,
    Str,
    Int,
    Float,
    Bool,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Range,
    Enumerate,
    Zip,
    Round,
    Type,
    Display,
    Html,
    Markdown,
    Latex,
    Json,
    Svg,
    // `math` module functions, reachable only through the module object.
    MathSqrt,
    MathFloor,
    MathCeil,
    MathFabs,
    MathPow,
    MathLog,
    MathSin,
    MathCos,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Repr => "repr",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Sorted => "sorted",
            Builtin::Range => "range",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Round => "round",
            Builtin::Type => "type",
            Builtin::Display => "display",
            Builtin::Html => "Html",
            Builtin::Markdown => "Markdown",
            Builtin::Latex => "Latex",
            Builtin::Json => "Json",
            Builtin::Svg => "Svg",
            Builtin::MathSqrt => "sqrt",
            Builtin::MathFloor => "floor",
            Builtin::MathCeil => "ceil",
            Builtin::MathFabs => "fabs",
            Builtin::MathPow => "pow",
            Builtin::MathLog => "log",
            Builtin::MathSin => "sin",
            Builtin::MathCos => "cos",
        }
    }

    /// The preloaded-namespace builtins, excluding module-scoped functions.
    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "repr" => Builtin::Repr,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "sorted" => Builtin::Sorted,
            "range" => Builtin::Range,
            "enumerate" => Builtin::Enumerate,
            "zip" => Builtin::Zip,
            "round" => Builtin::Round,
            "type" => Builtin::Type,
            "display" => Builtin::Display,
            "Html" => Builtin::Html,
            "Markdown" => Builtin::Markdown,
            "Latex" => Builtin::Latex,
            "Json" => Builtin::Json,
            "Svg" => Builtin::Svg,
            _ => return None,
        })
    }
}

/// User-defined function: parameters, pre-evaluated defaults, body.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub defaults: Vec<Option<Value>>,
    pub body: Vec<Stmt>,
}

/// Importable module object (only `math` exists in the dialect).
#[derive(Debug)]
pub struct ModuleDef {
    pub name: &'static str,
    pub attrs: HashMap<&'static str, Value>,
}

/// A value wrapped with an explicit display intent.
#[derive(Debug)]
pub enum RichValue {
    Html(String),
    Markdown(String),
    Latex(String),
    Json(String),
    Svg(String),
    /// `display(x)`: prefer displaying the wrapped value.
    Prepared(Value),
}

impl RichValue {
    pub fn tag(&self) -> &'static str {
        match self {
            RichValue::Html(_) => "Html",
            RichValue::Markdown(_) => "Markdown",
            RichValue::Latex(_) => "Latex",
            RichValue::Json(_) => "Json",
            RichValue::Svg(_) => "Svg",
            RichValue::Prepared(_) => "display",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    /// Association list; dialect dicts preserve insertion order and the key
    /// set stays small, so linear lookup is the honest structure.
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Func(Rc<Function>),
    Builtin(Builtin),
    /// Bound method: receiver plus method name, dispatched at call time.
    Method(Rc<(Value, &'static str)>),
    Module(Rc<ModuleDef>),
    Rich(Rc<RichValue>),
}

impl Value {
    pub fn str_value(text: impl Into<String>) -> Value {
        Value::Str(Rc::new(text.into()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(pairs)))
    }

    /// Python-style type name, used in error messages and `type()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Func(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::Rich(_) => "rich",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(pairs) => !pairs.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    /// Structural equality with numeric cross-type coercion, Python style.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k.py_eq(k2) && v.py_eq(v2))
                    })
            }
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => start == s2 && stop == e2 && step == st2,
            _ => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Numeric view for arithmetic coercion (bool counts as int).
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// `repr()` form.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => repr_str(s),
            Value::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::Dict(pairs) => {
                let inner: Vec<String> = pairs
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    format!("range({start}, {stop})")
                } else {
                    format!("range({start}, {stop}, {step})")
                }
            }
            Value::Func(f) => format!("<function {}>", f.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::Method(m) => format!("<built-in method {} of {} object>", m.1, m.0.type_name()),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Prepared(inner) => format!("display({})", inner.repr()),
                RichValue::Html(s)
                | RichValue::Markdown(s)
                | RichValue::Latex(s)
                | RichValue::Json(s)
                | RichValue::Svg(s) => format!("{}({})", rich.tag(), repr_str(s)),
            },
        }
    }

    /// `str()` form: strings render bare, everything else as repr.
    pub fn str_form(&self) -> String {
        match self {
            Value::Str(s) => s.as_ref().clone(),
            other => other.repr(),
        }
    }
}

pub fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        ((stop - start).max(0) + step - 1) / step
    } else if step < 0 {
        ((start - stop).max(0) + (-step) - 1) / (-step)
    } else {
        0
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Serialize a value as JSON for the `Json(...)` display builtin. Returns
/// `None` for values with no JSON form (functions, modules, ranges).
pub fn to_json(value: &Value) -> Option<String> {
    Some(match value {
        Value::None => "null".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => format!("{f}"),
        Value::Str(s) => json_escape(s),
        Value::List(items) => {
            let inner: Option<Vec<String>> = items.borrow().iter().map(to_json).collect();
            format!("[{}]", inner?.join(", "))
        }
        Value::Tuple(items) => {
            let inner: Option<Vec<String>> = items.iter().map(to_json).collect();
            format!("[{}]", inner?.join(", "))
        }
        Value::Dict(pairs) => {
            let mut parts = Vec::new();
            for (k, v) in pairs.borrow().iter() {
                let key = match k {
                    Value::Str(s) => json_escape(s),
                    other => json_escape(&other.str_form()),
                };
                parts.push(format!("{}: {}", key, to_json(v)?));
            }
            format!("{{{}}}", parts.join(", "))
        }
        _ => return None,
    })
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

impl RichDisplay for Value {
    fn prepared_display(&self) -> Option<&dyn RichDisplay> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Prepared(inner) => Some(inner),
                _ => None,
            },
            _ => None,
        }
    }

    fn html_repr(&self) -> Option<String> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Html(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn svg_repr(&self) -> Option<String> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Svg(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn markdown_repr(&self) -> Option<String> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Markdown(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn latex_repr(&self) -> Option<String> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Latex(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn json_repr(&self) -> Option<String> {
        match self {
            Value::Rich(rich) => match rich.as_ref() {
                RichValue::Json(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn text_repr(&self) -> String {
        self.repr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn repr_matches_python_shapes() {
        assert_eq!(Value::None.repr(), "None");
        assert_eq!(Value::Bool(true).repr(), "True");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::str_value("a\nb").repr(), "'a\\nb'");
        assert_eq!(
            Value::tuple(vec![Value::Int(1)]).repr(),
            "(1,)",
            "single tuples keep the trailing comma"
        );
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::str_value("x")]).repr(),
            "[1, 'x']"
        );
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert!(Value::Int(2).py_eq(&Value::Float(2.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(2).py_eq(&Value::str_value("2")));
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::str_value("").truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(
            !Value::Range {
                start: 0,
                stop: 0,
                step: 1
            }
            .truthy()
        );
    }

    #[test]
    fn range_len_handles_directions() {
        assert_eq!(range_len(0, 5, 1), 5);
        assert_eq!(range_len(5, 0, -1), 5);
        assert_eq!(range_len(0, 5, -1), 0);
        assert_eq!(range_len(0, 10, 3), 4);
    }

    #[test]
    fn json_serialization_of_plain_data() {
        let value = Value::dict(vec![
            (Value::str_value("xs"), Value::list(vec![Value::Int(1), Value::Int(2)])),
            (Value::str_value("name"), Value::str_value("folio")),
        ]);
        assert_eq!(
            to_json(&value).unwrap(),
            r#"{"xs": [1, 2], "name": "folio"}"#
        );
        assert!(to_json(&Value::Builtin(Builtin::Print)).is_none());
    }

    #[test]
    fn rich_values_expose_their_capability() {
        use core_display::{RichDisplay, to_renderable};
        let html = Value::Rich(Rc::new(RichValue::Html("<b>hi</b>".into())));
        assert_eq!(html.html_repr().as_deref(), Some("<b>hi</b>"));
        assert_eq!(
            to_renderable(&html),
            core_cell::Renderable::Html("<b>hi</b>".into())
        );

        let wrapped = Value::Rich(Rc::new(RichValue::Prepared(Value::Int(3))));
        assert_eq!(
            to_renderable(&wrapped),
            core_cell::Renderable::Text("3".into())
        );
    }
}
