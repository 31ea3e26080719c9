//! Method tables for arrays, maps and strings.
//!
//! These values have no `Class`, so `INVOKE` against them cannot walk a
//! method table by dense symbol the way instance dispatch does; instead the
//! VM resolves the symbol back to its name (`SymbolTable::name_of`) and
//! matches on it here. This keeps the fast path (instance/class dispatch,
//! §4.5) untouched while still satisfying the distilled spec's requirement
//! that array/map/string method tables are in scope.

use xr_core::value::Value;

use crate::error::VmError;

pub fn call_array_method(
    array: &xr_core::array::XArray,
    name: &str,
    args: &[Value],
    line: u32,
) -> Result<Value, VmError> {
    match name {
        "push" => {
            for a in args {
                array.push(a.clone());
            }
            Ok(Value::null())
        }
        "length" => Ok(Value::int(array.len() as i64)),
        "get" => {
            let idx = expect_int(args.first(), line)?;
            Ok(array.get(idx).unwrap_or(Value::null()))
        }
        "set" => {
            let idx = expect_int(args.first(), line)?;
            let value = args.get(1).cloned().unwrap_or(Value::null());
            array.set(idx, value).map_err(|_| VmError::OutOfRange {
                line,
                index: idx,
                len: array.len(),
            })?;
            Ok(Value::null())
        }
        _ => Err(VmError::MethodNotFound {
            line,
            name: name.to_string(),
        }),
    }
}

pub fn call_map_method(
    map: &xr_core::map::XMap,
    name: &str,
    args: &[Value],
    line: u32,
) -> Result<Value, VmError> {
    match name {
        "get" => {
            let key = args.first().cloned().unwrap_or(Value::null());
            Ok(map.get(&key).unwrap_or(Value::null()))
        }
        "set" => {
            let key = args.first().cloned().unwrap_or(Value::null());
            let value = args.get(1).cloned().unwrap_or(Value::null());
            map.set(key, value);
            Ok(Value::null())
        }
        "has" => {
            let key = args.first().cloned().unwrap_or(Value::null());
            Ok(Value::bool(map.has(&key)))
        }
        "delete" => {
            let key = args.first().cloned().unwrap_or(Value::null());
            Ok(Value::bool(map.delete(&key)))
        }
        "keys" => Ok(Value::Array(std::rc::Rc::new(array_from(map.keys())))),
        "values" => Ok(Value::Array(std::rc::Rc::new(array_from(map.values())))),
        "entries" => {
            let entries = map
                .entries()
                .into_iter()
                .map(|(k, v)| {
                    let pair = xr_core::array::XArray::with_capacity(2);
                    pair.push(k);
                    pair.push(v);
                    Value::Array(std::rc::Rc::new(pair))
                })
                .collect::<Vec<_>>();
            Ok(Value::Array(std::rc::Rc::new(array_from(entries))))
        }
        "size" => Ok(Value::int(map.size() as i64)),
        _ => Err(VmError::MethodNotFound {
            line,
            name: name.to_string(),
        }),
    }
}

pub fn call_string_method(
    s: &str,
    name: &str,
    args: &[Value],
    line: u32,
) -> Result<Value, VmError> {
    match name {
        "length" => Ok(Value::int(s.chars().count() as i64)),
        "toUpperCase" => Ok(Value::String(std::rc::Rc::new(xr_core::intern::XString {
            chars: s.to_uppercase(),
        }))),
        "toLowerCase" => Ok(Value::String(std::rc::Rc::new(xr_core::intern::XString {
            chars: s.to_lowercase(),
        }))),
        "charAt" => {
            let idx = expect_int(args.first(), line)?;
            let ch = usize::try_from(idx)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| c.to_string())
                .unwrap_or_default();
            Ok(Value::String(std::rc::Rc::new(xr_core::intern::XString {
                chars: ch,
            })))
        }
        _ => Err(VmError::MethodNotFound {
            line,
            name: name.to_string(),
        }),
    }
}

fn array_from(items: Vec<Value>) -> xr_core::array::XArray {
    let arr = xr_core::array::XArray::with_capacity(items.len());
    for item in items {
        arr.push(item);
    }
    arr
}

fn expect_int(value: Option<&Value>, line: u32) -> Result<i64, VmError> {
    value.and_then(Value::as_int).ok_or(VmError::TypeMismatch {
        line,
        expected: "int",
        actual: value.map(Value::type_name).unwrap_or("null"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use xr_core::array::XArray;
    use xr_core::map::XMap;

    #[test]
    fn array_push_and_length() {
        let arr = XArray::new();
        call_array_method(&arr, "push", &[Value::int(1)], 1).unwrap();
        call_array_method(&arr, "push", &[Value::int(2)], 1).unwrap();
        let len = call_array_method(&arr, "length", &[], 1).unwrap();
        assert_eq!(len, Value::int(2));
    }

    #[test]
    fn map_set_and_get() {
        let map = XMap::new();
        call_map_method(
            &map,
            "set",
            &[Value::string(std::rc::Rc::new(xr_core::intern::XString {
                chars: "k".to_string(),
            })), Value::int(9)],
            1,
        )
        .unwrap();
        let got = call_map_method(
            &map,
            "get",
            &[Value::string(std::rc::Rc::new(xr_core::intern::XString {
                chars: "k".to_string(),
            }))],
            1,
        )
        .unwrap();
        assert_eq!(got, Value::int(9));
    }
}
