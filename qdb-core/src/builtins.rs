//! アクションコードのビルトイン
//!
//! `--help-builtins` の出力とインタプリタのディスパッチは同じ表 `BUILTINS` から作ります。

use crate::action::{ActionCode, Statement};
use crate::console::Console;
use crate::disasm::disassemble;
use crate::expr_eval::{ExpressionEvaluator, Expr};
use crate::inferior::Inferior;
use crate::Result;
use anyhow::Context;
use qdb_target::registers::canonical_name;
use qdb_target::GENERAL_REGISTERS;

/// `dump()` で読む最大バイト数
const MAX_DUMP_LEN: u64 = 0x10000;

/// `disas()` の最大命令数
const MAX_DISAS_COUNT: u64 = 256;

/// x86-64命令の最大長
const MAX_INSTRUCTION_LEN: usize = 15;

/// `bt()` がたどる最大フレーム数
const MAX_FRAMES: usize = 64;

/// ビルトインの定義
#[derive(Debug)]
pub struct Builtin {
    pub name: &'static str,
    pub params: &'static str,
    pub min_args: usize,
    /// Noneは可変長
    pub max_args: Option<usize>,
    pub summary: &'static str,
}

impl Builtin {
    /// 引数の数を検査する
    pub fn check_arity(&self, count: usize) -> Result<()> {
        let too_many = self.max_args.is_some_and(|max| count > max);
        if count < self.min_args || too_many {
            return Err(anyhow::anyhow!(
                "{}({}) called with {} argument(s)",
                self.name,
                self.params,
                count
            ));
        }
        Ok(())
    }

    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.params)
    }
}

pub const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "print",
        params: "args...",
        min_args: 0,
        max_args: None,
        summary: "print expressions (hex) and strings on one line",
    },
    Builtin {
        name: "record",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "print the query location, pc and symbol of the hit",
    },
    Builtin {
        name: "regs",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "print general-purpose registers",
    },
    Builtin {
        name: "setreg",
        params: "reg, value",
        min_args: 2,
        max_args: Some(2),
        summary: "write a register",
    },
    Builtin {
        name: "dump",
        params: "addr, len",
        min_args: 2,
        max_args: Some(2),
        summary: "hex dump memory",
    },
    Builtin {
        name: "setmem",
        params: "addr, value, size",
        min_args: 3,
        max_args: Some(3),
        summary: "write 1, 2, 4 or 8 bytes of memory",
    },
    Builtin {
        name: "disas",
        params: "addr, count",
        min_args: 2,
        max_args: Some(2),
        summary: "disassemble instructions",
    },
    Builtin {
        name: "bt",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "frame-pointer backtrace with symbols and source lines",
    },
    Builtin {
        name: "where",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "print symbol and source line of the pc",
    },
    Builtin {
        name: "detach",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "detach from the debuggee and end the session (no exit code)",
    },
    Builtin {
        name: "kill",
        params: "",
        min_args: 0,
        max_args: Some(0),
        summary: "kill the debuggee and end the session (no exit code)",
    },
];

/// 名前でビルトインを探す
pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// `--help-builtins` の本文
pub fn documentation() -> String {
    let width = BUILTINS.iter().map(|b| b.signature().len()).max().unwrap_or(0) + 2;

    let mut doc = String::from("Builtins for -init, -at and -at-if action code (separate statements with ';'):\n\n");
    for builtin in BUILTINS {
        doc.push_str(&format!("  {:<width$}{}\n", builtin.signature(), builtin.summary, width = width));
    }
    doc.push_str(concat!(
        "\nExpressions (locations, conditions and arguments):\n",
        "  numbers      0x401000, 42\n",
        "  registers    rax..r15, rip/pc, rsp/sp, rbp/fp, eax, r8d, ...\n",
        "  symbols      main, libc.so.6!malloc, `quoted::name`\n",
        "  operators    - ! ~ * / % + - << >> & ^ | == != < <= > >= && ||\n",
        "  memory       poi(x) qword(x) dword(x) word(x) byte(x)\n",
    ));
    doc
}

/// アクション実行後の制御
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Detach,
    Kill,
}

/// アクションコードを先頭から実行する
///
/// 各文のエラーには `statement N: <text>` のコンテキストが付きます。
pub fn execute(code: &ActionCode, inferior: &mut dyn Inferior, console: &Console) -> Result<Flow> {
    for (index, statement) in code.statements().iter().enumerate() {
        let flow = run_statement(statement, inferior, console)
            .with_context(|| format!("statement {}: {}", index + 1, statement.text))?;
        if flow != Flow::Continue {
            return Ok(flow);
        }
    }
    Ok(Flow::Continue)
}

fn run_statement(statement: &Statement, inferior: &mut dyn Inferior, console: &Console) -> Result<Flow> {
    let args = statement.args.as_slice();
    match statement.name.as_str() {
        "print" => {
            let parts = args
                .iter()
                .map(|arg| match arg {
                    Expr::Str(s) => Ok(s.clone()),
                    expr => value(inferior, expr).map(|v| format!("0x{:x}", v)),
                })
                .collect::<Result<Vec<_>>>()?;
            console.info(parts.join(" "));
        }
        "record" => {
            let pc = inferior.register("pc")?;
            let location = inferior.query_location().unwrap_or("<init>");
            console.info(format!("hit {} pc=0x{:x} {}", location, pc, describe(inferior, pc)));
        }
        "regs" => {
            for chunk in GENERAL_REGISTERS.chunks(4) {
                let line = chunk
                    .iter()
                    .map(|name| inferior.register(name).map(|v| format!("{:>6}=0x{:016x}", name, v)))
                    .collect::<Result<Vec<_>>>()?;
                console.info(line.join(" "));
            }
        }
        "setreg" => {
            let name = match &args[0] {
                Expr::Ident(name) if canonical_name(name).is_some() => name,
                _ => return Err(anyhow::anyhow!("setreg() expects a register name as its first argument")),
            };
            let v = value(inferior, &args[1])?;
            inferior.set_register(name, v)?;
        }
        "dump" => {
            let addr = value(inferior, &args[0])?;
            let len = value(inferior, &args[1])?;
            if len > MAX_DUMP_LEN {
                return Err(anyhow::anyhow!("dump length 0x{:x} exceeds 0x{:x}", len, MAX_DUMP_LEN));
            }
            let bytes = inferior.read_memory(addr, len as usize)?;
            for line in hex_dump(addr, &bytes) {
                console.info(line);
            }
        }
        "setmem" => {
            let addr = value(inferior, &args[0])?;
            let v = value(inferior, &args[1])?;
            let size = value(inferior, &args[2])? as usize;
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(anyhow::anyhow!("setmem() size must be 1, 2, 4 or 8 (got {})", size));
            }
            inferior.write_memory(addr, &v.to_le_bytes()[..size])?;
        }
        "disas" => {
            let addr = value(inferior, &args[0])?;
            let count = value(inferior, &args[1])?.min(MAX_DISAS_COUNT) as usize;
            let code = read_code(inferior, addr, count * MAX_INSTRUCTION_LEN)?;
            for insn in disassemble(&code, addr, count)? {
                console.info(insn);
            }
        }
        "bt" => {
            for (index, pc) in backtrace(inferior)?.into_iter().enumerate() {
                console.info(format!("#{:<2} 0x{:016x} {}", index, pc, describe(inferior, pc)));
            }
        }
        "where" => {
            let pc = inferior.register("pc")?;
            console.info(format!("0x{:016x} {}", pc, describe(inferior, pc)));
        }
        "detach" => return Ok(Flow::Detach),
        "kill" => return Ok(Flow::Kill),
        other => return Err(anyhow::anyhow!("Unknown builtin '{}'", other)),
    }
    Ok(Flow::Continue)
}

fn value(inferior: &dyn Inferior, expr: &Expr) -> Result<u64> {
    ExpressionEvaluator::new(inferior).evaluate(expr)
}

/// `module!symbol+0x10 at file:line` 形式の説明
fn describe(inferior: &dyn Inferior, addr: u64) -> String {
    let mut text = inferior
        .symbolize(addr)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());
    if let Some(line) = inferior.source_line(addr) {
        text.push_str(" at ");
        text.push_str(&line);
    }
    text
}

/// 命令列を読む（途中で読めなくなったら読めた所まで）
fn read_code(inferior: &dyn Inferior, addr: u64, len: usize) -> Result<Vec<u8>> {
    let err = match inferior.read_memory(addr, len) {
        Ok(code) => return Ok(code),
        Err(e) => e,
    };

    let mut code = Vec::new();
    while code.len() < len {
        match inferior.read_memory(addr.wrapping_add(code.len() as u64), 1) {
            Ok(byte) => code.extend(byte),
            Err(_) => break,
        }
    }
    if code.is_empty() {
        return Err(err);
    }
    Ok(code)
}

/// フレームポインタをたどって戻りアドレスを集める（先頭は現在のpc）
fn backtrace(inferior: &dyn Inferior) -> Result<Vec<u64>> {
    let mut frames = vec![inferior.register("pc")?];
    let mut fp = inferior.register("rbp")?;

    while frames.len() < MAX_FRAMES && fp != 0 {
        let (Ok(next_fp), Ok(ret)) = (inferior.read_uint(fp, 8), inferior.read_uint(fp.wrapping_add(8), 8)) else {
            break;
        };
        if ret == 0 {
            break;
        }
        frames.push(ret);
        // スタックは下位アドレスへ伸びる
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }

    Ok(frames)
}

/// 16バイトごとの16進ダンプ
fn hex_dump(addr: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
                .collect();
            format!("0x{:016x}  {:<47}  {}", addr + (i as u64) * 16, hex.join(" "), ascii)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Verbosity;
    use crate::testing::{capture_console, FakeInferior};

    fn run(code: &str, inferior: &mut FakeInferior) -> (Result<Flow>, String) {
        let (console, captured) = capture_console(Verbosity::Normal);
        let action = ActionCode::parse(code).unwrap();
        let flow = execute(&action, inferior, &console);
        (flow, captured.stdout())
    }

    #[test]
    fn test_documentation_lists_every_builtin() {
        let doc = documentation();
        for builtin in BUILTINS {
            assert!(doc.contains(&builtin.signature()), "missing {}", builtin.name);
        }
        assert_eq!(doc, documentation());
    }

    #[test]
    fn test_print() {
        let mut inferior = FakeInferior::new();
        inferior.set("rdi", 0x2a);
        let (flow, out) = run(r#"print("rdi =", rdi, rdi + 1)"#, &mut inferior);
        assert_eq!(flow.unwrap(), Flow::Continue);
        assert_eq!(out, "qdb: rdi = 0x2a 0x2b\n");
    }

    #[test]
    fn test_record_and_where() {
        let mut inferior = FakeInferior::new();
        inferior.set("rip", 0x401004);
        inferior.add_symbol("main", 0x401000);
        inferior.location = Some("main".to_string());

        let (_, out) = run("record(); where()", &mut inferior);
        assert_eq!(
            out,
            "qdb: hit main pc=0x401004 test!main+0x4\nqdb: 0x0000000000401004 test!main+0x4\n"
        );
    }

    #[test]
    fn test_setreg_and_setmem() {
        let mut inferior = FakeInferior::new();
        inferior.map(0x1000, &[0; 8]);

        let (flow, _) = run("setreg(rax, 0x10 + 1); setmem(0x1002, 0xbeef, 2)", &mut inferior);
        flow.unwrap();
        assert_eq!(inferior.register("rax").unwrap(), 0x11);
        assert_eq!(inferior.read_uint(0x1000, 8).unwrap(), 0xbeef_0000);

        let (flow, _) = run("setreg(1, 2)", &mut inferior);
        assert!(flow.is_err());
        let (flow, _) = run("setmem(0x1000, 1, 3)", &mut inferior);
        assert!(flow.is_err());
    }

    #[test]
    fn test_dump() {
        let mut inferior = FakeInferior::new();
        inferior.map(0x1000, b"hello, qdb!\x00\x01\x02\x03\x04xyz");

        let (flow, out) = run("dump(0x1000, 0x13)", &mut inferior);
        flow.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("qdb: 0x0000000000001000  68 65 6c 6c 6f"));
        assert!(lines[0].ends_with("hello, qdb!....."));
        assert!(lines[1].ends_with("xyz"));
    }

    #[test]
    fn test_disas() {
        let mut inferior = FakeInferior::new();
        inferior.map(0x1000, &[0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3]);

        let (flow, out) = run("disas(0x1000, 2)", &mut inferior);
        flow.unwrap();
        assert_eq!(
            out,
            "qdb: 0x0000000000001000  mov rax, 1\nqdb: 0x0000000000001007  ret\n"
        );
    }

    #[test]
    fn test_bt_walks_frame_pointers() {
        let mut inferior = FakeInferior::new();
        let mut stack = Vec::new();
        // frame 0: [fp]=0x7010, [fp+8]=0x401100
        stack.extend_from_slice(&0x7010u64.to_le_bytes());
        stack.extend_from_slice(&0x401100u64.to_le_bytes());
        // frame 1: [fp]=0, [fp+8]=0x401200
        stack.extend_from_slice(&0u64.to_le_bytes());
        stack.extend_from_slice(&0x401200u64.to_le_bytes());
        inferior.map(0x7000, &stack);
        inferior.set("rip", 0x401000);
        inferior.set("rbp", 0x7000);

        let (flow, out) = run("bt()", &mut inferior);
        flow.unwrap();
        let pcs: Vec<&str> = out.lines().map(|l| l.split_whitespace().nth(2).unwrap()).collect();
        assert_eq!(
            pcs,
            vec!["0x0000000000401000", "0x0000000000401100", "0x0000000000401200"]
        );
    }

    #[test]
    fn test_flow_stops_execution() {
        let mut inferior = FakeInferior::new();
        let (flow, out) = run("print(1); detach(); print(2)", &mut inferior);
        assert_eq!(flow.unwrap(), Flow::Detach);
        assert_eq!(out, "qdb: 0x1\n");

        let (flow, _) = run("kill()", &mut inferior);
        assert_eq!(flow.unwrap(), Flow::Kill);
    }

    #[test]
    fn test_error_context_names_statement() {
        let mut inferior = FakeInferior::new();
        let (flow, _) = run("print(1); dump(0x5000, 8)", &mut inferior);
        let err = flow.unwrap_err();
        let chain: Vec<String> = err.chain().map(|c| c.to_string()).collect();
        assert_eq!(chain[0], "statement 2: dump(0x5000, 8)");
        assert!(chain.len() >= 2);
    }

    #[test]
    fn test_quiet_console_suppresses_output() {
        let mut inferior = FakeInferior::new();
        let (console, captured) = capture_console(Verbosity::Quiet);
        let action = ActionCode::parse("print(1)").unwrap();
        execute(&action, &mut inferior, &console).unwrap();
        assert_eq!(captured.stdout(), "");
    }
}
