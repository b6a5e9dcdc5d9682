//! Deterministic Lua transformer engine.
//!
//! Trees and treehouses each hold one Lua VM pre-loaded with a script that
//! must define `process(input) -> output`. The VM is a closed room: only the
//! table/string/math stdlibs are loaded, `math.random` is removed, and the
//! provided helpers (`contains`, `log`, `json_encode`, `json_decode`) are
//! pure or side-effect-free from the script's point of view. Same input,
//! same output — that property is what the tests enforce.
//!
//! JSON values map to Lua tables and back with these rules:
//! nil ↔ null; booleans as-is; every number passes through a 64-bit float
//! (integral results re-encode as JSON integers); strings as-is; a table
//! whose keys are exactly 1..N becomes an array, any other table becomes an
//! object with stringified keys. A non-table return from `process` is an
//! error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use mlua::{Function, Lua, LuaOptions, StdLib, Table, Value as LuaValue};
use serde_json::{Map, Number, Value};
use tracing::info;

/// Largest f64 that still holds every integer exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// One sandboxed Lua VM with a loaded transformer script.
///
/// `process` calls are serialized through the instance's own mutex; separate
/// instances run in parallel.
pub struct ScriptEngine {
    name: String,
    lua: Mutex<Lua>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine").field("name", &self.name).finish()
    }
}

impl ScriptEngine {
    /// Load a script from a file.
    pub fn from_file(name: &str, path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        Self::from_source(name, &source)
    }

    /// Load a script from source text. The script must define a global
    /// `process` function.
    pub fn from_source(name: &str, source: &str) -> Result<Self> {
        let lua = new_sandbox(name)?;
        lua.load(source)
            .set_name(name)
            .exec()
            .with_context(|| format!("failed to load script for {}", name))?;

        let process: Result<Function, _> = lua.globals().get("process");
        if process.is_err() {
            bail!("script for {} does not define a process function", name);
        }

        Ok(Self {
            name: name.to_string(),
            lua: Mutex::new(lua),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `process(input)`. Input and output are JSON objects on the Rust
    /// side, Lua tables inside the VM.
    pub fn process(&self, input: &Value) -> Result<Value> {
        let lua = self.lua.lock().unwrap();
        let process: Function = lua
            .globals()
            .get("process")
            .with_context(|| format!("process function missing in {}", self.name))?;

        let lua_input = json_to_lua(&lua, input)
            .with_context(|| format!("failed to convert input for {}", self.name))?;
        let result: LuaValue = process
            .call(lua_input)
            .with_context(|| format!("script {} failed", self.name))?;

        match &result {
            LuaValue::Table(_) => lua_to_json(&result)
                .with_context(|| format!("failed to convert output of {}", self.name)),
            other => bail!(
                "script {} returned {} instead of a table",
                self.name,
                other.type_name()
            ),
        }
    }
}

/// Build the restricted VM: table/string/math only, no randomness, with the
/// host helpers installed.
fn new_sandbox(name: &str) -> Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )
    .context("failed to create Lua VM")?;

    {
        let globals = lua.globals();

        // math.random would break the determinism contract.
        if let Ok(math) = globals.get::<Table>("math") {
            math.set("random", LuaValue::Nil)?;
            math.set("randomseed", LuaValue::Nil)?;
        }

        let contains = lua.create_function(|_, (haystack, needle): (String, String)| {
            Ok(haystack.contains(&needle))
        })?;
        globals.set("contains", contains)?;

        let script_name = name.to_string();
        let log = lua.create_function(move |_, msg: LuaValue| {
            info!(script = %script_name, "{}", display_lua(&msg));
            Ok(())
        })?;
        globals.set("log", log)?;

        let encode = lua.create_function(|_, value: LuaValue| {
            let json = lua_to_json(&value).map_err(mlua::Error::external)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?;
        globals.set("json_encode", encode)?;

        let decode = lua.create_function(|lua, text: String| {
            let json: Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
            json_to_lua(lua, &json).map_err(mlua::Error::external)
        })?;
        globals.set("json_decode", decode)?;
    }

    Ok(lua)
}

fn display_lua(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

/// Convert a JSON value into a Lua value.
pub fn json_to_lua(lua: &Lua, value: &Value) -> Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => {
            // All numbers round-trip through a 64-bit float.
            let f = n.as_f64().context("number out of f64 range")?;
            LuaValue::Number(f)
        }
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

/// Convert a Lua value into a JSON value.
pub fn lua_to_json(value: &LuaValue) -> Result<Value> {
    Ok(match value {
        LuaValue::Nil => Value::Null,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Number(Number::from(*i)),
        LuaValue::Number(n) => number_from_f64(*n),
        LuaValue::String(s) => Value::String(
            s.to_str()
                .context("script produced a non-UTF-8 string")?
                .to_string(),
        ),
        LuaValue::Table(t) => table_to_json(t)?,
        other => bail!("cannot serialize Lua {} to JSON", other.type_name()),
    })
}

/// Integral floats re-encode as JSON integers, mirroring how the original
/// runtime marshals float64 values.
fn number_from_f64(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn table_to_json(table: &Table) -> Result<Value> {
    let mut pairs = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        pairs.push(pair.context("failed to iterate Lua table")?);
    }

    let len = table.raw_len();
    let contiguous = len > 0
        && pairs.len() == len
        && pairs.iter().all(|(k, _)| {
            matches!(k, LuaValue::Integer(i) if *i >= 1 && (*i as usize) <= len)
        });

    if contiguous {
        let mut ordered = BTreeMap::new();
        for (k, v) in &pairs {
            if let LuaValue::Integer(i) = k {
                ordered.insert(*i, lua_to_json(v)?);
            }
        }
        Ok(Value::Array(ordered.into_values().collect()))
    } else {
        let mut map = Map::new();
        for (k, v) in &pairs {
            let key = match k {
                LuaValue::String(s) => s
                    .to_str()
                    .context("script produced a non-UTF-8 table key")?
                    .to_string(),
                LuaValue::Integer(i) => i.to_string(),
                LuaValue::Number(n) => n.to_string(),
                LuaValue::Boolean(b) => b.to_string(),
                other => bail!("cannot use Lua {} as an object key", other.type_name()),
            };
            map.insert(key, lua_to_json(v)?);
        }
        Ok(Value::Object(map))
    }
}
