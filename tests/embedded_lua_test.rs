//! Runs generated programs on an embedded Lua 5.4

use luavm_protect::{obfuscate, ProtectConfig, Protector};
use mlua::{Function, Lua, MultiValue, Variadic};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

/// Printed lines and returned values of one run
#[derive(Debug, Default, PartialEq)]
struct Outcome {
    printed: Vec<String>,
    returned: Vec<String>,
}

fn run(program: &str) -> mlua::Result<Outcome> {
    let lua = Lua::new();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&sink);
    let print = lua.create_function(move |lua, args: Variadic<mlua::Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for value in args {
            parts.push(tostring.call::<_, String>(value)?);
        }
        captured.lock().unwrap().push(parts.join("\t"));
        Ok(())
    })?;
    lua.globals().set("print", print)?;

    let values: MultiValue = lua.load(program).set_name("protected").eval()?;
    let tostring: Function = lua.globals().get("tostring")?;
    let returned = values
        .into_iter()
        .map(|value| tostring.call::<_, String>(value))
        .collect::<mlua::Result<Vec<_>>>()?;
    let printed = sink.lock().unwrap().clone();
    Ok(Outcome { printed, returned })
}

/// Run `source` both as plain Lua and protected, and require the same outcome
fn assert_equivalent(source: &str) -> Outcome {
    let expected = run(source).unwrap_or_else(|e| panic!("plain source failed: {e}\n{source}"));
    let program = obfuscate(source).unwrap();
    let actual = run(&program).unwrap_or_else(|e| panic!("protected program failed: {e}\n{source}"));
    assert_eq!(actual, expected, "{source}");
    actual
}

#[test]
fn test_closure_scenario() {
    let out = assert_equivalent("local x = 1; local function get() return x end; x = 2; print(get())");
    assert_eq!(out.printed, vec!["2"]);
}

#[test]
fn test_table_scenario() {
    let out = assert_equivalent("local t = {a = 1, 2, 3} print(t.a, t[1], t[2])");
    assert_eq!(out.printed, vec!["1\t2\t3"]);
}

#[test]
fn test_loop_scenario() {
    let out = assert_equivalent("local s = 0; for i = 1, 5 do s = s + i end; print(s)");
    assert_eq!(out.printed, vec!["15"]);
}

#[test]
fn test_loop_closures_capture_each_iteration() {
    let out = assert_equivalent(
        "local fs = {} for i = 1, 3 do fs[i] = function() return i end end return fs[1](), fs[2](), fs[3]()",
    );
    assert_eq!(out.returned, vec!["1", "2", "3"]);
}

#[test]
fn test_generic_and_while_loop_closures() {
    let source = r#"
        local fs = {}
        for _, v in ipairs({"a", "b"}) do fs[#fs + 1] = function() return v end end
        local n = 0
        while n < 2 do
            n = n + 1
            local m = n * 10
            fs[#fs + 1] = function() return m end
        end
        repeat local r = "r" fs[#fs + 1] = function() return r end until true
        return fs[1](), fs[2](), fs[3](), fs[4](), fs[5]()
    "#;
    let out = assert_equivalent(source);
    assert_eq!(out.returned, vec!["a", "b", "10", "20", "r"]);
}

#[test]
fn test_captured_local_survives_register_reuse() {
    let out = assert_equivalent("local f do local x = 1 f = function() return x end end local y = 5 return f()");
    assert_eq!(out.returned, vec!["1"]);
}

#[test]
fn test_closures_share_one_variable() {
    let source = r#"
        local function pair()
            local n = 0
            return function() n = n + 1 return n end, function() return n end
        end
        local inc, get = pair()
        inc() inc()
        local t = {}
        for i = 1, 2 do
            local c = 0
            t[i] = {function() c = c + i end, function() return c end}
            if i == 2 then break end
        end
        t[1][1]() t[2][1]() t[2][1]()
        return get(), t[1][2](), t[2][2]()
    "#;
    let out = assert_equivalent(source);
    assert_eq!(out.returned, vec!["2", "1", "4"]);
}

#[test]
fn test_varargs_methods_and_multiple_returns() {
    let source = r#"
        local function pack(...) return select('#', ...), ... end
        print(pack(1, nil, 3))
        local Account = {}
        Account.__index = Account
        function Account.new(balance) return setmetatable({balance = balance}, Account) end
        function Account:deposit(v) self.balance = self.balance + v return self end
        print(Account.new(10):deposit(5):deposit(1).balance)
        local function two() return 1, 2 end
        local t = {two(), two()}
        print(#t, (two()))
    "#;
    let out = assert_equivalent(source);
    assert_eq!(out.printed, vec!["3\t1\tnil\t3", "16", "3\t1"]);
}

#[test]
fn test_operators_and_control_flow() {
    let source = r#"
        local n, hits = 0, {}
        repeat n = n + 3 until n > 10
        for i = 10, 1, -4 do hits[#hits + 1] = i end
        print(n, 7 // 2, 7 % 3, 2 ^ 10 == 1024, "a" < "b", nil or "d", false and 1)
        print(table.concat(hits, ","), #"abc" .. "!")
    "#;
    let out = assert_equivalent(source);
    assert_eq!(out.printed, vec!["12\t3\t1\ttrue\ttrue\td\tfalse", "10,6,2\t3!"]);
}

#[test]
fn test_string_library_through_method_calls() {
    let source = r#"
        local words = {}
        for w in string.gmatch("alpha beta gamma", "%a+") do words[#words + 1] = w:upper() end
        print(#words, words[3], ("x"):rep(3))
    "#;
    assert_equivalent(source);
}

#[test]
fn test_script_arguments_are_forwarded() {
    let lua = Lua::new();
    let program = obfuscate("local a, b = ... return a, b").unwrap();
    let (a, b): (i64, String) = lua.load(&program).call((4, "x")).unwrap();
    assert_eq!((a, b.as_str()), (4, "x"));
}

#[test]
fn test_tampered_program_raises() {
    let program = Protector::new(ProtectConfig::default())
        .obfuscate_with_rng("print('ok')", &mut StdRng::seed_from_u64(8))
        .unwrap();
    let marker = "{code={";
    let start = program.rfind(marker).unwrap() + marker.len();
    let end = start + program[start..].find(',').unwrap();
    let byte: u32 = program[start..end].parse().unwrap();
    let tampered = format!("{}{}{}", &program[..start], (byte + 1) % 256, &program[end..]);

    let err = run(&tampered).unwrap_err();
    assert!(err.to_string().contains("Tampered"), "{err}");
}

#[test]
fn test_seeded_outputs_behave_alike() {
    let source = "local acc = 0 for i = 1, 4 do acc = acc + i * i end return acc";
    for seed in [1, 2, 3, 99] {
        let program = Protector::new(ProtectConfig::default())
            .obfuscate_with_rng(source, &mut StdRng::seed_from_u64(seed))
            .unwrap();
        assert_eq!(run(&program).unwrap().returned, vec!["30"], "seed {seed}");
    }
}
