// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Table-driven MCU configuration scripts.
//!
//! Some target setup cannot be expressed over the debug protocol alone:
//! remapping the boot memory so the vector table is readable, or routing
//! the SWO trace pin out of the package. Each MCU family needs a slightly
//! different register recipe, so those recipes live in a compact script
//! table instead of being hard-coded.
//!
//! A script is a list of lines of the form
//!
//! ```text
//! LVALUE OP RVALUE      # comment
//! ```
//!
//! with `OP` one of `=` (assign), `|`/`|=` (set bits), `~`/`~=` (clear
//! bits). An LVALUE is a known register name or a literal address; an
//! RVALUE is a literal or `$n`, the caller's n-th parameter. A bare `$`
//! as LVALUE reads the word addressed by the RVALUE and stores it in
//! parameter slot 0.
//!
//! Execution issues memory reads and writes through the [`TargetMem`]
//! trait, which the probe session implements on top of the debug link.

mod catalog;

use thiserror::Error;

pub type TargetMemError = Box<dyn std::error::Error + Send + Sync>;

/// Memory access into the attached target. `read_mem`/`write_mem` move
/// raw little-endian bytes.
pub trait TargetMem {
    fn read_mem(
        &mut self,
        addr: u32,
        len: usize,
    ) -> Result<Vec<u8>, TargetMemError>;

    fn write_mem(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), TargetMemError>;
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("no script {name:?} for MCU {mcu:?}")]
    UnknownScript { name: String, mcu: String },
    #[error("line {line}: unknown register {name:?}")]
    UnknownRegister { line: usize, name: String },
    #[error("line {line}: syntax error")]
    Syntax { line: usize },
    #[error("line {line}: parameter ${param} not provided")]
    MissingParam { line: usize, param: u8 },
    #[error("target access failed: {0}")]
    Target(#[source] TargetMemError),
}

/// A register symbol: resolved to an absolute address and access width.
#[derive(Debug)]
pub struct Reg {
    pub name: &'static str,
    pub addr: u32,
    pub width: u8,
}

/// One catalog entry: a named script and the MCU families it applies to.
pub struct ScriptDef {
    pub name: &'static str,
    pub mcus: &'static str,
    pub body: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    /// Literal value; doubles as a literal address depending on position.
    Literal(u32),
    /// A register from the symbol table: `(address, width)`.
    Register(u32, u8),
    /// `$n`: the caller's n-th parameter.
    Param(u8),
    /// `$`: store the value read from the target into parameter slot 0.
    ResultSink,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Oper {
    Assign,
    SetBits,
    ClearBits,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Line {
    pub lhs: Operand,
    pub oper: Oper,
    pub rhs: Operand,
}

/// Looks up the script `name` for the given MCU family and architecture
/// tag. Family matching is case-insensitive; a catalog token carrying a
/// trailing architecture suffix also matches with the suffix stripped,
/// and `*` matches anything.
pub fn find(name: &str, mcu: &str, arch: &str) -> Option<&'static ScriptDef> {
    catalog::SCRIPTS
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name) && mcu_match(s.mcus, mcu, arch))
}

fn mcu_match(list: &str, mcu: &str, arch: &str) -> bool {
    for token in list.split(',') {
        let token = token.trim();
        if token == "*" || token.eq_ignore_ascii_case(mcu) {
            return true;
        }
        // "LPC43xx Cortex-M4" should match mcu "LPC43xx": retry with the
        // architecture suffix stripped (and, when the caller knows its
        // architecture, insist the suffixes agree).
        if let Some((family, tag)) = token.rsplit_once(' ') {
            if family.trim().eq_ignore_ascii_case(mcu)
                && (arch.is_empty() || tag.trim().eq_ignore_ascii_case(arch)
                    || suffix_of(tag.trim(), arch))
            {
                return true;
            }
        }
    }
    false
}

/// "Cortex-M4" carries the same meaning as the probe's bare "M4" tag.
fn suffix_of(tag: &str, arch: &str) -> bool {
    tag.len() > arch.len()
        && tag
            .to_ascii_lowercase()
            .ends_with(&arch.to_ascii_lowercase())
}

/// Parses a script body into executable lines.
pub fn parse(body: &str) -> Result<Vec<Line>, ScriptError> {
    let mut lines = Vec::new();
    for (idx, raw) in body.lines().enumerate() {
        let line = idx + 1;
        let text = raw.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        let (lhs_text, rest) = split_token(text);
        let rest = rest.trim_start();
        let (oper, rest) = parse_oper(rest).ok_or(ScriptError::Syntax { line })?;
        let rhs_text = rest.trim();
        if rhs_text.is_empty() || rhs_text.split_whitespace().count() != 1 {
            return Err(ScriptError::Syntax { line });
        }

        let lhs = parse_operand(lhs_text, line)?;
        let rhs = parse_operand(rhs_text, line)?;

        // The result sink only makes sense as a destination, and a bare
        // parameter or sink cannot be written to.
        match (lhs, rhs) {
            (Operand::Param(_), _) | (_, Operand::ResultSink) => {
                return Err(ScriptError::Syntax { line });
            }
            (Operand::ResultSink, _) if oper != Oper::Assign => {
                return Err(ScriptError::Syntax { line });
            }
            _ => {}
        }

        lines.push(Line { lhs, oper, rhs });
    }
    Ok(lines)
}

fn split_token(text: &str) -> (&str, &str) {
    match text.find(|c: char| c.is_whitespace() || "=|~".contains(c)) {
        Some(pos) => text.split_at(pos),
        None => (text, ""),
    }
}

fn parse_oper(text: &str) -> Option<(Oper, &str)> {
    let mut chars = text.chars();
    let oper = match chars.next()? {
        '=' => return Some((Oper::Assign, chars.as_str())),
        '|' => Oper::SetBits,
        '~' => Oper::ClearBits,
        _ => return None,
    };
    // `|=` and `~=` are spelled with an optional trailing `=`.
    let rest = chars.as_str();
    Some((oper, rest.strip_prefix('=').unwrap_or(rest)))
}

fn parse_operand(text: &str, line: usize) -> Result<Operand, ScriptError> {
    if text == "$" {
        return Ok(Operand::ResultSink);
    }
    if let Some(num) = text.strip_prefix('$') {
        let param = num
            .parse::<u8>()
            .ok()
            .filter(|&n| n <= 9)
            .ok_or(ScriptError::Syntax { line })?;
        return Ok(Operand::Param(param));
    }
    if let Some(value) = parse_literal(text) {
        return Ok(Operand::Literal(value));
    }
    if text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return catalog::REGISTERS
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(text))
            .map(|r| Operand::Register(r.addr, r.width))
            .ok_or_else(|| ScriptError::UnknownRegister {
                line,
                name: text.to_string(),
            });
    }
    Err(ScriptError::Syntax { line })
}

fn parse_literal(text: &str) -> Option<u32> {
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else if text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

/// Runs the script `name` for the given MCU, issuing the register accesses
/// through `mem`. `params` provides the `$n` substitutions; a script with
/// a result sink writes back into `params[0]`. Execution stops at the
/// first rejected access.
pub fn run(
    name: &str,
    mcu: &str,
    arch: &str,
    params: &mut [u32],
    mem: &mut dyn TargetMem,
) -> Result<(), ScriptError> {
    let def = find(name, mcu, arch).ok_or_else(|| ScriptError::UnknownScript {
        name: name.to_string(),
        mcu: mcu.to_string(),
    })?;
    let lines = parse(def.body)?;
    log::debug!("running script {:?} for {} ({} lines)", name, mcu, lines.len());

    for (idx, line) in lines.iter().enumerate() {
        let lineno = idx + 1;
        let rhs = resolve_value(line.rhs, params, lineno)?;

        match line.lhs {
            Operand::ResultSink => {
                // `$ = <addr>`: read the target word into parameter 0.
                let bytes = mem
                    .read_mem(rhs, 4)
                    .map_err(ScriptError::Target)?;
                let value = word_from_le(&bytes);
                if let Some(slot) = params.first_mut() {
                    *slot = value;
                }
            }
            Operand::Literal(addr) => {
                apply(mem, addr, 4, line.oper, rhs)?;
            }
            Operand::Register(addr, width) => {
                apply(mem, addr, width, line.oper, rhs)?;
            }
            Operand::Param(_) => unreachable!("rejected at parse"),
        }
    }
    Ok(())
}

fn resolve_value(
    operand: Operand,
    params: &[u32],
    line: usize,
) -> Result<u32, ScriptError> {
    match operand {
        Operand::Literal(v) => Ok(v),
        Operand::Register(addr, _) => Ok(addr),
        Operand::Param(n) => params
            .get(usize::from(n))
            .copied()
            .ok_or(ScriptError::MissingParam { line, param: n }),
        Operand::ResultSink => Err(ScriptError::Syntax { line }),
    }
}

fn apply(
    mem: &mut dyn TargetMem,
    addr: u32,
    width: u8,
    oper: Oper,
    rhs: u32,
) -> Result<(), ScriptError> {
    let width = usize::from(width);
    let value = match oper {
        Oper::Assign => rhs,
        Oper::SetBits | Oper::ClearBits => {
            let bytes = mem
                .read_mem(addr, width)
                .map_err(ScriptError::Target)?;
            let current = word_from_le(&bytes);
            match oper {
                Oper::SetBits => current | rhs,
                _ => current & !rhs,
            }
        }
    };
    mem.write_mem(addr, &value.to_le_bytes()[..width])
        .map_err(ScriptError::Target)
}

fn word_from_le(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = bytes.len().min(4);
    word[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every access and serves reads from a fixed word.
    struct FakeMem {
        ops: Vec<String>,
        read_value: u32,
        fail_after: Option<usize>,
    }

    impl FakeMem {
        fn new(read_value: u32) -> Self {
            Self { ops: Vec::new(), read_value, fail_after: None }
        }
    }

    impl TargetMem for FakeMem {
        fn read_mem(
            &mut self,
            addr: u32,
            len: usize,
        ) -> Result<Vec<u8>, TargetMemError> {
            self.ops.push(format!("r {addr:08x} {len}"));
            Ok(self.read_value.to_le_bytes()[..len].to_vec())
        }

        fn write_mem(
            &mut self,
            addr: u32,
            data: &[u8],
        ) -> Result<(), TargetMemError> {
            if let Some(limit) = self.fail_after {
                if self.ops.iter().filter(|o| o.starts_with('w')).count()
                    >= limit
                {
                    return Err("write rejected".into());
                }
            }
            let mut word = [0u8; 4];
            word[..data.len()].copy_from_slice(data);
            self.ops
                .push(format!("w {addr:08x} {:08x}", u32::from_le_bytes(word)));
            Ok(())
        }
    }

    #[test]
    fn find_matches_family_case_insensitive() {
        assert!(find("memremap", "lpc17XX", "").is_some());
        assert!(find("memremap", "LPC99xx", "").is_none());
    }

    #[test]
    fn find_strips_architecture_suffix() {
        // The catalog entry reads "LPC43xx Cortex-M4".
        assert!(find("memremap", "LPC43xx", "M4").is_some());
        assert!(find("memremap", "LPC43xx", "").is_some());
        assert!(find("memremap", "LPC43xx", "M0").is_none());
    }

    #[test]
    fn wildcard_matches_anything() {
        assert!(find("swo-trace", "SomethingNew123", "M7").is_some());
    }

    #[test]
    fn parse_accepts_both_operator_spellings() {
        let lines = parse("ITM_TER |= 1\nITM_TER | 1\n").unwrap();
        assert_eq!(lines[0], lines[1]);
        assert_eq!(lines[0].oper, Oper::SetBits);
    }

    #[test]
    fn parse_rejects_junk() {
        assert!(matches!(
            parse("ITM_TER ? 1\n"),
            Err(ScriptError::Syntax { line: 1 })
        ));
        assert!(matches!(
            parse("NOT_A_REGISTER = 1\n"),
            Err(ScriptError::UnknownRegister { line: 1, .. })
        ));
        assert!(matches!(
            parse("$3 = 1\n"),
            Err(ScriptError::Syntax { line: 1 })
        ));
    }

    #[test]
    fn parse_literal_address_lvalue() {
        let lines = parse("0xE0000E00 = 0x1F\n").unwrap();
        assert_eq!(
            lines[0],
            Line {
                lhs: Operand::Literal(0xE000_0E00),
                oper: Oper::Assign,
                rhs: Operand::Literal(0x1F),
            }
        );
    }

    #[test]
    fn stm32f4_swo_device_is_the_six_line_program() {
        let def = find("swo-device", "STM32F4", "M4").unwrap();
        let lines = parse(def.body).unwrap();
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            Line {
                // RCC_AHB1ENR |= 0x02
                lhs: Operand::Register(0x4002_3830, 4),
                oper: Oper::SetBits,
                rhs: Operand::Literal(0x02),
            }
        );
    }

    #[test]
    fn set_bits_reads_then_writes() {
        let mut mem = FakeMem::new(0x1);
        let mut params = [];
        run("swo-device", "STM32F4xx", "M4", &mut params, &mut mem)
            .unwrap();
        // Six lines, each an OR/AND-NOT: one read followed by one write.
        assert_eq!(mem.ops.len(), 12);
        assert!(mem.ops[0].starts_with("r 40023830"));
        assert!(mem.ops[1].starts_with("w 40023830 00000003"));
    }

    #[test]
    fn rejected_write_aborts_execution() {
        let mut mem = FakeMem::new(0);
        mem.fail_after = Some(1);
        let mut params = [];
        let err = run("swo-device", "STM32F4xx", "M4", &mut params, &mut mem)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Target(_)));
        // One full line (read + write) and the second line's read+failed
        // write attempt; nothing after the failure.
        assert_eq!(
            mem.ops.iter().filter(|o| o.starts_with('w')).count(),
            1
        );
    }

    #[test]
    fn params_substitute_into_rvalues() {
        let mut mem = FakeMem::new(0);
        let mut params = [2, 48];
        run("swo-trace", "STM32F4xx", "M4", &mut params, &mut mem)
            .unwrap();
        // TPIU_ACPR = $1 and TPIU_SPPR = $0.
        assert!(mem.ops.contains(&"w e0040010 00000030".to_string()));
        assert!(mem.ops.contains(&"w e00400f0 00000002".to_string()));
    }

    #[test]
    fn missing_param_is_an_error() {
        let mut mem = FakeMem::new(0);
        let mut params = [1];
        assert!(matches!(
            run("swo-trace", "STM32F4xx", "M4", &mut params, &mut mem),
            Err(ScriptError::MissingParam { param: 1, .. })
        ));
    }

    #[test]
    fn result_sink_stores_into_param_zero() {
        let mut mem = FakeMem::new(0x0000_8100);
        let mut params = [0u32];
        run("partid", "LPC8xx", "M0+", &mut params, &mut mem).unwrap();
        assert_eq!(params[0], 0x8100);
        assert_eq!(mem.ops, ["r 400483f8 4"]);
    }
}
