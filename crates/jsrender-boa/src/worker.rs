//! The thread that owns a Boa `Context`
//!
//! `Context` is neither `Send` nor `Sync`, so every engine gets a thread of
//! its own and talks to it over a command channel. The thread exits when the
//! command sender is dropped.

use boa_engine::{Context, JsError, JsString, JsValue, Source};
use crossbeam_channel::{Receiver, Sender};
use jsrender_core::{EngineError, ScriptError};
use serde_json::Value;
use tracing::debug;

use crate::conversions::{js_value_to_json, json_to_js_value};

pub(crate) type Reply<T> = Sender<Result<T, EngineError>>;

pub(crate) enum Command {
    Execute {
        code: String,
        document: String,
        reply: Reply<()>,
    },
    Evaluate {
        code: String,
        reply: Reply<Value>,
    },
    Call {
        function: String,
        args: Vec<Value>,
        reply: Reply<Value>,
    },
    HasVariable {
        name: String,
        reply: Reply<bool>,
    },
    SetVariable {
        name: String,
        value: Value,
        reply: Reply<()>,
    },
}

/// Serve commands until the channel closes
pub(crate) fn run(commands: Receiver<Command>, recursion_limit: usize) {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_recursion_limit(recursion_limit);

    // A send only fails when the caller stopped waiting for the reply
    for command in commands.iter() {
        match command {
            Command::Execute {
                code,
                document,
                reply,
            } => {
                let _ = reply.send(execute(&mut context, &code, &document));
            }
            Command::Evaluate { code, reply } => {
                let _ = reply.send(evaluate(&mut context, &code));
            }
            Command::Call {
                function,
                args,
                reply,
            } => {
                let _ = reply.send(call(&mut context, &function, &args));
            }
            Command::HasVariable { name, reply } => {
                let _ = reply.send(has_variable(&mut context, &name));
            }
            Command::SetVariable { name, value, reply } => {
                let _ = reply.send(set_variable(&mut context, &name, &value));
            }
        }
    }
    debug!("Boa engine thread exiting");
}

fn execute(context: &mut Context, code: &str, document: &str) -> Result<(), EngineError> {
    context
        .eval(Source::from_bytes(code))
        .map(|_| ())
        .map_err(|e| script_error(e, context).in_document(document).into())
}

fn evaluate(context: &mut Context, code: &str) -> Result<Value, EngineError> {
    let value = context
        .eval(Source::from_bytes(code))
        .map_err(|e| EngineError::from(script_error(e, context)))?;
    to_json(&value, context)
}

fn call(context: &mut Context, function: &str, args: &[Value]) -> Result<Value, EngineError> {
    let global = context.global_object();
    let target = global
        .get(JsString::from(function), context)
        .map_err(|e| EngineError::from(script_error(e, context)))?;
    let callable = match target.as_object() {
        Some(object) if object.is_callable() => object.clone(),
        _ => {
            return Err(ScriptError::new(format!("TypeError: {} is not a function", function)).into())
        }
    };

    let mut js_args = Vec::with_capacity(args.len());
    for arg in args {
        js_args.push(json_to_js_value(arg, context)?);
    }
    let result = callable
        .call(&JsValue::undefined(), &js_args, context)
        .map_err(|e| EngineError::from(script_error(e, context)))?;
    to_json(&result, context)
}

fn has_variable(context: &mut Context, name: &str) -> Result<bool, EngineError> {
    let global = context.global_object();
    global
        .has_property(JsString::from(name), context)
        .map_err(|e| script_error(e, context).into())
}

fn set_variable(context: &mut Context, name: &str, value: &Value) -> Result<(), EngineError> {
    let value = json_to_js_value(value, context)?;
    let global = context.global_object();
    global
        .set(JsString::from(name), value, true, context)
        .map(|_| ())
        .map_err(|e| script_error(e, context).into())
}

fn to_json(value: &JsValue, context: &mut Context) -> Result<Value, EngineError> {
    js_value_to_json(value, context).map_err(|e| script_error(e, context).into())
}

/// Describe a thrown value the way a console would (`TypeError: x is not a
/// function`), with the position when the message carries one
fn script_error(error: JsError, context: &mut Context) -> ScriptError {
    let message = match error.try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => error
            .as_opaque()
            .and_then(|value| value.to_string(context).ok())
            .map(|text| text.to_std_string_escaped())
            .unwrap_or_else(|| error.to_string()),
    };
    match parse_position(&message) {
        Some((line, column)) => ScriptError::new(message).at(line, column),
        None => ScriptError::new(message),
    }
}

/// Boa reports syntax errors as `... at line 3, col 14`
fn parse_position(message: &str) -> Option<(u32, u32)> {
    let rest = &message[message.rfind("line ")? + "line ".len()..];
    let (line, rest) = rest.split_once(',')?;
    let column = rest.trim_start().strip_prefix("col")?;
    let column = column.trim_start_matches("umn").trim();
    let digits: String = column.chars().take_while(char::is_ascii_digit).collect();
    Some((line.trim().parse().ok()?, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(
            parse_position("SyntaxError: unexpected token ')' at line 3, col 14"),
            Some((3, 14))
        );
        assert_eq!(parse_position("abrupt end at line 1, column 9"), Some((1, 9)));
        assert_eq!(parse_position("TypeError: x is not a function"), None);
    }
}
