//! One disposable boa realm per request.

use boa_engine::value::JsVariant;
use boa_engine::vm::RuntimeLimits;
use boa_engine::{Context, JsValue, Source};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::DynamicCodePolicy;

/// Prepares a fresh global object before the snippet runs. Everything not
/// named in `allowed` is removed, string-to-code entry points are replaced
/// according to the policy, string and array builders are capped and
/// `Math.random` becomes a seeded generator.
const BOOTSTRAP: &str = r#"function (global, options) {
  var allowed = [
    'globalThis', 'undefined', 'NaN', 'Infinity',
    'Object', 'Function', 'Array', 'String', 'Number', 'Boolean', 'Symbol', 'BigInt',
    'Math', 'JSON', 'Promise', 'RegExp', 'Map', 'Set', 'WeakMap', 'WeakSet',
    'Error', 'EvalError', 'RangeError', 'ReferenceError', 'SyntaxError', 'TypeError', 'URIError',
    'parseInt', 'parseFloat', 'isNaN', 'isFinite', 'eval',
    'escape', 'unescape', 'encodeURI', 'encodeURIComponent', 'decodeURI', 'decodeURIComponent'
  ];
  var getNames = Object.getOwnPropertyNames;
  var getProto = Object.getPrototypeOf;
  var define = Object.defineProperty;
  var toStr = String;
  var imul = Math.imul;
  var maxLength = options.maxStringLength;
  var maxElements = options.maxElements;
  var capture = options.dynamicCode === 'capture';

  var names = getNames(global);
  for (var i = 0; i < names.length; i++) {
    if (allowed.indexOf(names[i]) < 0) {
      try { delete global[names[i]]; } catch (e) {}
    }
  }

  function refuse() {
    throw new EvalError('dynamic code evaluation is disabled in this sandbox');
  }
  function constructorStub() {
    if (!capture) refuse();
    var body = arguments.length ? toStr(arguments[arguments.length - 1]) : '';
    return function () { return body; };
  }
  function evalStub(source) {
    if (!capture) refuse();
    return source;
  }

  var prototypes = [
    Function.prototype,
    getProto(function* () {}),
    getProto(async function () {}),
    getProto(async function* () {})
  ];
  constructorStub.prototype = Function.prototype;
  for (var p = 0; p < prototypes.length; p++) {
    define(prototypes[p], 'constructor', {
      value: constructorStub, writable: false, configurable: false
    });
  }
  define(global, 'Function', { value: constructorStub, writable: false, configurable: false });
  define(global, 'eval', { value: evalStub, writable: false, configurable: false });

  var stringProto = String.prototype;
  var repeat = stringProto.repeat;
  var padStart = stringProto.padStart;
  var padEnd = stringProto.padEnd;
  function tooLong() {
    throw new RangeError('string length limit exceeded');
  }
  define(stringProto, 'repeat', { value: function (count) {
    var text = toStr(this);
    if (text.length * Number(count) > maxLength) tooLong();
    return repeat.call(text, count);
  }});
  define(stringProto, 'padStart', { value: function (length, fill) {
    if (Number(length) > maxLength) tooLong();
    return padStart.call(toStr(this), length, fill);
  }});
  define(stringProto, 'padEnd', { value: function (length, fill) {
    if (Number(length) > maxLength) tooLong();
    return padEnd.call(toStr(this), length, fill);
  }});

  var arrayProto = Array.prototype;
  var join = arrayProto.join;
  var fill = arrayProto.fill;
  var concat = stringProto.concat;
  define(arrayProto, 'join', { value: function (separator) {
    var count = Number(this.length);
    var width = separator === undefined ? 1 : toStr(separator).length;
    if (count > maxElements || count * width > maxLength) tooLong();
    return join.call(this, separator);
  }});
  define(arrayProto, 'fill', { value: function () {
    if (Number(this.length) > maxElements) tooLong();
    return fill.apply(this, arguments);
  }});
  define(stringProto, 'concat', { value: function () {
    var total = toStr(this).length;
    for (var k = 0; k < arguments.length; k++) total += toStr(arguments[k]).length;
    if (total > maxLength) tooLong();
    return concat.apply(toStr(this), arguments);
  }});

  var seed = 0x2545f491;
  Math.random = function () {
    seed = (seed + 0x6d2b79f5) | 0;
    var t = imul(seed ^ (seed >>> 15), 1 | seed);
    t = (t + imul(t ^ (t >>> 7), 61 | t)) ^ t;
    return ((t ^ (t >>> 14)) >>> 0) / 4294967296;
  };
}"#;

/// Bytes per element assumed when capping array builders.
const ELEMENT_BYTES: u64 = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct RealmLimits {
    pub loop_iterations: u64,
    pub recursion: usize,
    pub stack_size: usize,
    pub max_string_length: u64,
    pub dynamic_code: DynamicCodePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireOutcome", into = "WireOutcome")]
pub(crate) enum RealmOutcome {
    Completed(Option<Value>),
    Failed(String),
    LimitExceeded(String),
}

/// Form exchanged with the worker process; keeps `undefined` apart from
/// `null`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum WireOutcome {
    Undefined,
    Value { value: Value },
    Failed { message: String },
    LimitExceeded { message: String },
}

impl From<WireOutcome> for RealmOutcome {
    fn from(wire: WireOutcome) -> Self {
        match wire {
            WireOutcome::Undefined => RealmOutcome::Completed(None),
            WireOutcome::Value { value } => RealmOutcome::Completed(Some(value)),
            WireOutcome::Failed { message } => RealmOutcome::Failed(message),
            WireOutcome::LimitExceeded { message } => RealmOutcome::LimitExceeded(message),
        }
    }
}

impl From<RealmOutcome> for WireOutcome {
    fn from(outcome: RealmOutcome) -> Self {
        match outcome {
            RealmOutcome::Completed(None) => WireOutcome::Undefined,
            RealmOutcome::Completed(Some(value)) => WireOutcome::Value { value },
            RealmOutcome::Failed(message) => WireOutcome::Failed { message },
            RealmOutcome::LimitExceeded(message) => WireOutcome::LimitExceeded { message },
        }
    }
}

pub(crate) fn run(code: &str, limits: &RealmLimits) -> RealmOutcome {
    let mut context = Context::default();
    let mut runtime = RuntimeLimits::default();
    runtime.set_loop_iteration_limit(limits.loop_iterations);
    runtime.set_recursion_limit(limits.recursion);
    runtime.set_stack_size_limit(limits.stack_size);
    context.set_runtime_limits(runtime);

    let prelude = format!(
        "({})(globalThis, {{ maxStringLength: {}, maxElements: {}, dynamicCode: '{}' }});",
        BOOTSTRAP,
        limits.max_string_length,
        (limits.max_string_length / ELEMENT_BYTES).max(1),
        limits.dynamic_code.as_str()
    );
    if let Err(err) = context.eval(Source::from_bytes(prelude.as_bytes())) {
        return RealmOutcome::Failed(format!("realm bootstrap failed: {}", err));
    }

    match context.eval(Source::from_bytes(code.as_bytes())) {
        Ok(value) => RealmOutcome::Completed(to_json(&value)),
        Err(err) => {
            let message = err.to_string();
            if is_runtime_limit(&message) {
                debug!(error = %message, "sandbox runtime limit reached");
                RealmOutcome::LimitExceeded(message)
            } else {
                RealmOutcome::Failed(message)
            }
        }
    }
}

fn is_runtime_limit(message: &str) -> bool {
    message.contains("RuntimeLimit")
        || (message.contains("Maximum")
            && message.contains("limit")
            && message.contains("exceeded"))
}

fn to_json(value: &JsValue) -> Option<Value> {
    match value.variant() {
        JsVariant::Undefined => None,
        JsVariant::Null => Some(Value::Null),
        JsVariant::Boolean(b) => Some(Value::Bool(b)),
        JsVariant::Integer32(n) => Some(Value::from(n)),
        JsVariant::Float64(n) => Some(number(n)),
        JsVariant::String(_) => value.as_string().map(|s| Value::String(s.to_std_string_lossy())),
        _ => Some(Value::String(value.display().to_string())),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(crate::types::format_number(n)))
}
