//! Runs generated programs on a real Lua interpreter when one is installed

use luavm_protect::{obfuscate, ProtectConfig, Protector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::process::Command;

const INTERPRETERS: &[&str] = &["lua", "lua5.4", "lua5.3", "lua5.2", "lua5.1", "luajit"];

fn find_lua() -> Option<&'static str> {
    INTERPRETERS.iter().copied().find(|name| {
        Command::new(name)
            .arg("-v")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    })
}

/// Run `program` and return (success, stdout, stderr)
fn run_lua(lua: &str, program: &str) -> (bool, String, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("protected.lua");
    fs::write(&path, program).unwrap();
    let out = Command::new(lua).arg(&path).output().unwrap();
    (
        out.status.success(),
        String::from_utf8_lossy(&out.stdout).into_owned(),
        String::from_utf8_lossy(&out.stderr).into_owned(),
    )
}

macro_rules! require_lua {
    () => {
        match find_lua() {
            Some(lua) => lua,
            None => {
                eprintln!("skipping: no Lua interpreter found");
                return;
            }
        }
    };
}

fn assert_same_output(lua: &str, source: &str) {
    let (ok, expected, err) = run_lua(lua, source);
    assert!(ok, "plain source failed: {err}");
    let program = obfuscate(source).unwrap();
    let (ok, actual, err) = run_lua(lua, &program);
    assert!(ok, "protected program failed: {err}");
    assert_eq!(actual, expected);
}

#[test]
fn test_closure_scenario() {
    let lua = require_lua!();
    assert_same_output(
        lua,
        "local x = 1; local function get() return x end; x = 2; print(get())",
    );
}

#[test]
fn test_table_scenario() {
    let lua = require_lua!();
    assert_same_output(lua, "local t = {a = 1, 2, 3} print(t.a, t[1], t[2])");
}

#[test]
fn test_loop_scenario() {
    let lua = require_lua!();
    assert_same_output(lua, "local s = 0; for i = 1, 5 do s = s + i end; print(s)");
}

#[test]
fn test_mixed_program() {
    let lua = require_lua!();
    let source = r#"
        local function map(t, f)
            local r = {}
            for i, v in ipairs(t) do r[i] = f(v) end
            return r
        end
        local squares = map({1, 2, 3, 4}, function(x) return x * x end)
        print(table.concat(squares, ","))

        local Account = {}
        Account.__index = Account
        function Account.new(balance) return setmetatable({balance = balance}, Account) end
        function Account:deposit(v) self.balance = self.balance + v return self end
        print(Account.new(10):deposit(5):deposit(1).balance)

        local function pack(...) return select('#', ...), ... end
        print(pack(1, nil, 3))

        local words = {}
        for w in string.gmatch("alpha beta gamma", "%a+") do words[#words + 1] = w:upper() end
        print(#words, words[3], ("x"):rep(3))

        local n = 0
        while n < 100 do n = n + 7 if n % 5 == 0 then break end end
        print(n, 10 / 4, 2 ^ 10 == 1024, "a" < "b")
    "#;
    assert_same_output(lua, source);
}

#[test]
fn test_script_arguments_are_forwarded() {
    let lua = require_lua!();
    let program = obfuscate("local a, b = ... return a, b").unwrap();
    let wrapper = format!(
        "local f = (loadstring or load)({:?}) print(f(4, 'x'))",
        program
    );
    let (ok, out, err) = run_lua(lua, &wrapper);
    assert!(ok, "{err}");
    assert_eq!(out.trim_end(), "4\tx");
}

#[test]
fn test_tampered_program_raises() {
    let lua = require_lua!();
    let program = Protector::new(ProtectConfig::default())
        .obfuscate_with_rng("print('ok')", &mut StdRng::seed_from_u64(8))
        .unwrap();
    let marker = "{code={";
    let start = program.rfind(marker).unwrap() + marker.len();
    let end = start + program[start..].find(',').unwrap();
    let byte: u32 = program[start..end].parse().unwrap();
    let tampered = format!("{}{}{}", &program[..start], (byte + 1) % 256, &program[end..]);

    let (ok, out, err) = run_lua(lua, &tampered);
    assert!(!ok);
    assert!(out.is_empty());
    assert!(err.contains("Tampered"), "{err}");
}
