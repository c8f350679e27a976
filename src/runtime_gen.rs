//! Runtime generator for protected Lua scripts
//!
//! Emits one self-contained Lua program: cipher helpers, an integrity check,
//! the register VM with a scrambled dispatcher, and the encrypted root chunk.
//! The output runs unmodified on Lua 5.1 through 5.4.

use crate::bytecode::{Constant, OpCode};
use crate::crypto::{CipherContext, EncryptedChunk, CHECKSUM_MODULUS, LFSR_TAPS};
use crate::obfuscator::{DeadCode, NameGenerator, OpaquePredicate, PredicateAliases};
use crate::scrambler::OpcodeMap;
use crate::ProtectConfig;
use rand::seq::SliceRandom;
use rand::Rng;

/// Numeric junk locals declared in the prologue
const JUNK_LOCALS: usize = 40;

/// Junk locals the VM body may reference; each one costs an upvalue
const VM_JUNK_LOCALS: usize = 8;

/// Dead snippets generated per program
const DEAD_SNIPPETS: usize = 15;

/// How many of the dead snippets also land in the prologue
const PROLOGUE_SNIPPETS: usize = 5;

/// Identifiers of one generated program
struct Idents {
    vm: String,
    xor: String,
    dec_keys: String,
    poly: String,
    lfsr: String,
    verify: String,
    pack: String,
    insert: String,
    unpack: String,
    select: String,
    type_fn: String,
    next_fn: String,
    floor: String,
    env: String,
    opaque: String,
    chunk: String,
    args: String,
    upvals_in: String,
    ops: String,
    consts: String,
    protos: String,
    upvals: String,
    regs: String,
    open: String,
    nparams: String,
    pc: String,
    top: String,
    op: String,
    a: String,
    b: String,
    c: String,
}

impl Idents {
    fn new<R: Rng + ?Sized>(names: &mut NameGenerator, rng: &mut R) -> Self {
        let mut n = |role: &str| names.name(role, rng);
        Self {
            vm: n("vm"),
            xor: n("xor"),
            dec_keys: n("dec_keys"),
            poly: n("poly"),
            lfsr: n("lfsr"),
            verify: n("verify"),
            pack: n("pack"),
            insert: n("insert"),
            unpack: n("unpack"),
            select: n("select"),
            type_fn: n("type"),
            next_fn: n("next"),
            floor: n("floor"),
            env: n("env"),
            opaque: n("opaque"),
            chunk: n("chunk"),
            args: n("args"),
            upvals_in: n("upvals_in"),
            ops: n("ops"),
            consts: n("consts"),
            protos: n("protos"),
            upvals: n("upvals"),
            regs: n("regs"),
            open: n("open"),
            nparams: n("nparams"),
            pc: n("pc"),
            top: n("top"),
            op: n("op"),
            a: n("a"),
            b: n("b"),
            c: n("c"),
        }
    }

    fn aliases(&self) -> PredicateAliases {
        PredicateAliases {
            type_fn: self.type_fn.clone(),
            floor_fn: self.floor.clone(),
        }
    }
}

/// Generator for the protected Lua program
pub struct RuntimeGenerator {
    config: ProtectConfig,
}

impl RuntimeGenerator {
    /// Create a new runtime generator
    pub fn new(config: ProtectConfig) -> Self {
        Self { config }
    }

    /// Generate the complete protected program for `root`
    ///
    /// `map` and `ctx` must be the ones `root` was encrypted with. Every
    /// identifier, junk value, predicate choice, and dispatch order is drawn
    /// from `rng`, so two calls never produce the same text.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        root: &EncryptedChunk,
        map: &OpcodeMap,
        ctx: &CipherContext,
        rng: &mut R,
    ) -> String {
        let mut names = NameGenerator::new();
        let id = Idents::new(&mut names, rng);
        let aliases = id.aliases();

        let junk: Vec<String> = (0..JUNK_LOCALS).map(|_| names.fresh(rng)).collect();
        let vm_junk: Vec<String> = junk
            .choose_multiple(rng, VM_JUNK_LOCALS)
            .cloned()
            .collect();
        let dead = DeadCode::new(vm_junk);
        let snippets: Vec<String> = (0..DEAD_SNIPPETS)
            .map(|_| dead.snippet(rng, &mut names))
            .collect();

        let mut out = String::new();
        if self.config.header {
            out.push_str("-- Protected with luavm-protect\n");
            out.push_str("-- Do not edit: any change to the bytecode below breaks verification\n");
        }

        for name in &junk {
            out.push_str(&format!("local {name}={}\n", rng.gen_range(0..100_000)));
        }
        out.push_str(&self.prologue(&id));
        for snippet in snippets.iter().take(PROLOGUE_SNIPPETS) {
            out.push_str(&format!("do {snippet} end\n"));
        }
        out.push_str(&self.vm(&id, &aliases, map, ctx, &snippets, rng));

        let root_name = names.fresh(rng);
        out.push_str(&format!(
            "local {root_name}={}\n",
            chunk_literal(root)
        ));
        out.push_str(&format!(
            "return {vm}({root_name},{pack}(...),{{}})\n",
            vm = id.vm,
            pack = id.pack
        ));

        tracing::debug!(
            bytes = out.len(),
            decoys = map.decoys().len(),
            roles = names.get_mapping().len(),
            "Generated VM program"
        );
        out
    }

    /// Library aliases plus the cipher and verification helpers
    fn prologue(&self, id: &Idents) -> String {
        format!(
            r##"local {insert}=table.insert
local {unpack}=table.unpack or unpack
local {select}=select
local {type_fn}=type
local {next_fn}=next
local {floor}=math.floor
local {env}=_ENV or _G or {{}}
local {opaque}=(os and os.time and os.time()) or 1
local {pack}=function(...) return {{n={select}("#",...),...}} end
local {xor}=function(x,y)
  local r,p=0,1
  while x>0 or y>0 do
    local s,t=x%2,y%2
    if s~=t then r=r+p end
    x={floor}(x/2) y={floor}(y/2) p=p*2
  end
  return r
end
local {dec_keys}=function(d,ks)
  local r={{}}
  for i=1,#d do
    local v=d[i]
    for j=1,#ks do
      local k=ks[j]
      v=(v-k[((i-1)%#k)+1])%256
    end
    r[i]=v
  end
  return r
end
local {poly}=function(d,a,b,c,e,x)
  local r={{}}
  for i=1,#d do
    local j=i-1
    local y=(j*7+13)%256
    local z=(j*11+17)%256
    local f=(a*x*x*x+b*y*y+c*z+e)%256
    r[i]=(d[i]-f)%256
    x=(x*17+j+31)%256
  end
  return r
end
local {lfsr}=function(d,s)
  local r={{}}
  for i=1,#d do
    local l=s%2
    s={floor}(s/2)
    if l==1 then s={xor}(s,{taps}) end
    r[i]={xor}(d[i],s%256)
  end
  return r
end
local {verify}=function(d,cs,n)
  if #d~=n then return false end
  local s=0
  for i=1,#d do s=s+d[i] end
  return s%{modulus}==cs
end
"##,
            insert = id.insert,
            unpack = id.unpack,
            select = id.select,
            type_fn = id.type_fn,
            next_fn = id.next_fn,
            floor = id.floor,
            env = id.env,
            opaque = id.opaque,
            pack = id.pack,
            xor = id.xor,
            dec_keys = id.dec_keys,
            poly = id.poly,
            lfsr = id.lfsr,
            verify = id.verify,
            taps = LFSR_TAPS,
            modulus = CHECKSUM_MODULUS,
        )
    }

    /// The VM function with its shuffled dispatcher
    fn vm<R: Rng + ?Sized>(
        &self,
        id: &Idents,
        aliases: &PredicateAliases,
        map: &OpcodeMap,
        ctx: &CipherContext,
        snippets: &[String],
        rng: &mut R,
    ) -> String {
        let mut branches: Vec<(u8, String)> = OpCode::ALL
            .iter()
            .map(|&op| {
                let pred = OpaquePredicate::random(rng).render(&id.opaque, aliases);
                let dead = pick_snippet(snippets, rng);
                (map.code(op), handler(op, id, &pred, &dead))
            })
            .collect();
        for &decoy in map.decoys() {
            branches.push((decoy, pick_snippet(snippets, rng)));
        }
        branches.shuffle(rng);

        let mut dispatch = String::new();
        for (i, (code, body)) in branches.iter().enumerate() {
            let keyword = if i == 0 { "if" } else { "elseif" };
            dispatch.push_str(&format!("    {keyword} {}=={code} then\n      {body}\n", id.op));
        }
        dispatch.push_str("    else break end\n");

        let poly = &ctx.poly;
        let loop_pred = OpaquePredicate::random(rng).render(&id.opaque, aliases);

        format!(
            r#"local {vm}
{vm}=function({chunk},{args},{upvals_in})
  local {ops}={chunk}.d
  if not {ops} then
    if not {verify}({chunk}.code,{chunk}.cs,{chunk}.len) then error("Tampered") end
    {ops}={dec_keys}({poly}({lfsr}({chunk}.code,{seed}),{pa},{pb},{pc_},{pd},{px}),{{{k3},{k2},{k1}}})
    {chunk}.d={ops}
  end
  local {consts}={chunk}.consts
  local {protos}={chunk}.protos
  local {upvals}={upvals_in} or {{}}
  local {nparams}={chunk}.numParams
  local {regs}={{}}
  local {open}={{}}
  for i=1,{nparams} do {regs}[i]={args}[i] end
  local {pc}=1
  local {top}=0
  while {loop_pred} do
    local {op}={ops}[{pc}]
    local {a}={ops}[{pc}+1]
    local {b}={ops}[{pc}+2]
    local {c}={ops}[{pc}+3]
    {pc}={pc}+4
{dispatch}  end
end
"#,
            vm = id.vm,
            chunk = id.chunk,
            args = id.args,
            upvals_in = id.upvals_in,
            ops = id.ops,
            verify = id.verify,
            dec_keys = id.dec_keys,
            poly = id.poly,
            lfsr = id.lfsr,
            seed = ctx.lfsr_seed,
            pa = poly.a,
            pb = poly.b,
            pc_ = poly.c,
            pd = poly.d,
            px = poly.seed,
            k1 = byte_list(&ctx.keys[0]),
            k2 = byte_list(&ctx.keys[1]),
            k3 = byte_list(&ctx.keys[2]),
            consts = id.consts,
            protos = id.protos,
            upvals = id.upvals,
            nparams = id.nparams,
            regs = id.regs,
            open = id.open,
            pc = id.pc,
            top = id.top,
            loop_pred = loop_pred,
            op = id.op,
            a = id.a,
            b = id.b,
            c = id.c,
            dispatch = dispatch,
        )
    }
}

fn pick_snippet<R: Rng + ?Sized>(snippets: &[String], rng: &mut R) -> String {
    snippets
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| "do end".to_string())
}

/// Lua body for one real opcode. Register `x` lives at `regs[x+1]`.
fn handler(op: OpCode, id: &Idents, pred: &str, dead: &str) -> String {
    let r = &id.regs;
    let k = &id.consts;
    let (a, b, c) = (&id.a, &id.b, &id.c);
    let pc = &id.pc;
    let top = &id.top;
    let env = &id.env;
    let u = &id.upvals;
    let bx = format!("{b}+{c}*256");
    let sbx = format!("local s={b}+{c}*256 if s>=32768 then s=s-65536 end");

    let arith = |sym: &str| format!("{r}[{a}+1]={r}[{b}+1]{sym}{r}[{c}+1]");
    let compare = |sym: &str| {
        format!("if ({r}[{b}+1]{sym}{r}[{c}+1])~=({a}~=0) then {pc}={pc}+4 end")
    };

    match op {
        OpCode::Move => format!("{r}[{a}+1]={r}[{b}+1]"),
        OpCode::LoadK => format!("{r}[{a}+1]={k}[{bx}+1]"),
        OpCode::LoadBool => format!("{r}[{a}+1]=({b}~=0) if {c}~=0 then {pc}={pc}+4 end"),
        OpCode::LoadNil => format!("for i={a}+1,{a}+{b}+1 do {r}[i]=nil end"),
        OpCode::GetUpval => format!("local u={u}[{b}+1] {r}[{a}+1]=u.s[u.i]"),
        OpCode::GetGlobal => format!("{r}[{a}+1]={env}[{k}[{bx}+1]]"),
        OpCode::GetTable => format!("{r}[{a}+1]={r}[{b}+1][{r}[{c}+1]]"),
        OpCode::SetGlobal => format!("{env}[{k}[{bx}+1]]={r}[{a}+1]"),
        OpCode::SetUpval => format!("local u={u}[{b}+1] u.s[u.i]={r}[{a}+1]"),
        OpCode::SetTable => format!("{r}[{a}+1][{r}[{b}+1]]={r}[{c}+1]"),
        OpCode::NewTable => format!("{r}[{a}+1]={{}}"),
        OpCode::SelfOp => format!("local o={r}[{b}+1] {r}[{a}+2]=o {r}[{a}+1]=o[{r}[{c}+1]]"),
        OpCode::Add => arith("+"),
        OpCode::Sub => arith("-"),
        OpCode::Mul => arith("*"),
        OpCode::Div => arith("/"),
        OpCode::IDiv => format!("{r}[{a}+1]={fl}({r}[{b}+1]/{r}[{c}+1])", fl = id.floor),
        OpCode::Mod => arith("%"),
        OpCode::Pow => arith("^"),
        OpCode::Unm => format!("{r}[{a}+1]=-{r}[{b}+1]"),
        OpCode::Not => format!("{r}[{a}+1]=not {r}[{b}+1]"),
        OpCode::Len => format!("{r}[{a}+1]=#{r}[{b}+1]"),
        OpCode::Concat => arith(".."),
        OpCode::Jmp => format!("{sbx} {pc}={pc}+s*4"),
        OpCode::Eq => compare("=="),
        OpCode::Lt => compare("<"),
        OpCode::Le => compare("<="),
        OpCode::Test => format!("if (not not {r}[{a}+1])~=({c}~=0) then {pc}={pc}+4 end"),
        OpCode::TestSet => format!(
            "local v={r}[{b}+1] if (not not v)==({c}~=0) then {r}[{a}+1]=v else {pc}={pc}+4 end"
        ),
        OpCode::Call => format!(
            "local f={r}[{a}+1] local n={b}-1 if {b}==0 then n={top}-{a}-1 end \
             local g={{}} for i=1,n do g[i]={r}[{a}+1+i] end \
             local q if {pred} then q={pack}(f({unpack}(g,1,n))) else {dead} end \
             if {c}==0 then for i=1,q.n do {r}[{a}+i]=q[i] end {top}={a}+q.n \
             else for i=1,{c}-1 do {r}[{a}+i]=q[i] end end",
            pack = id.pack,
            unpack = id.unpack,
        ),
        OpCode::Return => format!(
            "local n={b}-1 if {b}==0 then n={top}-{a} end \
             local q={{}} for i=1,n do q[i]={r}[{a}+i] end return {unpack}(q,1,n)",
            unpack = id.unpack,
        ),
        OpCode::ForLoop => format!(
            "{sbx} local st={r}[{a}+3] local v={r}[{a}+1]+st {r}[{a}+1]=v \
             if (st>0 and v<={r}[{a}+2]) or (st<=0 and v>={r}[{a}+2]) then \
             {pc}={pc}+s*4 {r}[{a}+4]=v end"
        ),
        OpCode::ForPrep => format!("{sbx} {r}[{a}+1]={r}[{a}+1]-{r}[{a}+3] {pc}={pc}+s*4"),
        OpCode::TForLoop => format!(
            "local q={pack}({r}[{a}+1]({r}[{a}+2],{r}[{a}+3])) \
             for i=1,{c} do {r}[{a}+3+i]=q[i] end \
             if {r}[{a}+4]~=nil then {r}[{a}+3]={r}[{a}+4] else {pc}={pc}+4 end",
            pack = id.pack,
        ),
        OpCode::SetList => format!(
            "local t={r}[{a}+1] local s={bx} for i={a}+2,{top} do t[s+i-{a}-2]={r}[i] end"
        ),
        OpCode::Closure => format!(
            "local p={protos}[{bx}+1] local w={{}} local d=p.upvalues \
             for i=1,#d do local e=d[i] if e[1]==1 then local x=e[2]+1 local l={open}[x] \
             if not l then l={{s={r},i=x}} {open}[x]=l end {ins}(w,l) \
             else {ins}(w,{u}[e[2]+1]) end end \
             {r}[{a}+1]=function(...) return {vm}(p,{pack}(...),w) end",
            protos = id.protos,
            open = id.open,
            ins = id.insert,
            vm = id.vm,
            pack = id.pack,
        ),
        OpCode::Close => format!(
            "for x,l in {nx},{open} do if x>{a} then l.s={{l.s[l.i]}} l.i=1 {open}[x]=nil end end",
            nx = id.next_fn,
            open = id.open,
        ),
        OpCode::Vararg => format!(
            "local m={args}.n-{np} if m<0 then m=0 end \
             if {b}==0 then for i=1,m do {r}[{a}+i]={args}[{np}+i] end {top}={a}+m \
             else for i=1,{b}-1 do if i<=m then {r}[{a}+i]={args}[{np}+i] else {r}[{a}+i]=nil end end end",
            args = id.args,
            np = id.nparams,
        ),
    }
}

fn byte_list(bytes: &[u8]) -> String {
    let items: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
    format!("{{{}}}", items.join(","))
}

/// Lua table literal for an encrypted chunk and its nested prototypes
fn chunk_literal(chunk: &EncryptedChunk) -> String {
    let consts: Vec<String> = chunk.constants.iter().map(Constant::to_lua).collect();
    let protos: Vec<String> = chunk.protos.iter().map(chunk_literal).collect();
    let upvalues: Vec<String> = chunk
        .upvalues
        .iter()
        .map(|u| format!("{{{},{}}}", u8::from(u.is_local), u.index))
        .collect();
    format!(
        "{{code={},consts={{{}}},protos={{{}}},numParams={},vararg={},upvalues={{{}}},cs={},len={}}}",
        byte_list(&chunk.code),
        consts.join(","),
        protos.join(","),
        chunk.num_params,
        u8::from(chunk.is_vararg),
        upvalues.join(","),
        chunk.checksum,
        chunk.len,
    )
}
