//! Address-expression parser.
//!
//! Grammar: `[prefix:]expr` where `prefix ∈ {s,p,v,c}` picks the space and
//! the virtual prefix may carry a PID (`v:742:expr`). Numbers default to
//! hexadecimal when the input is address-like, with `0x`/`$` prefixes and
//! `h` suffix forcing hex, and `.` prefix / `d` suffix forcing decimal.
//! Expressions allow one `+` or `-`. Named built-ins (`ram`, `sp`, `pc`,
//! `stack`) and `$name` variables resolve through the parser's table.

use std::collections::HashMap;

use crate::addr::{AddressSpace, TypedAddress};
use crate::error::{Error, Result};

pub struct AddressParser {
    variables: HashMap<String, u64>,
}

impl Default for AddressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressParser {
    pub fn new() -> Self {
        let mut variables = HashMap::new();
        variables.insert("ram".into(), 0x4000_0000);
        variables.insert("base".into(), 0);
        AddressParser { variables }
    }

    /// Seeds the built-in names from live engine state.
    pub fn set_builtins(&mut self, ram_base: u64, stack_ptr: u64, program_counter: u64) {
        self.variables.insert("ram".into(), ram_base);
        self.variables.insert("sp".into(), stack_ptr);
        self.variables.insert("stack".into(), stack_ptr);
        self.variables.insert("pc".into(), program_counter);
    }

    pub fn set_variable(&mut self, name: &str, value: u64) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<u64> {
        self.variables.get(name).copied()
    }

    /// Parses `input` in the context of `current_space` (used when no
    /// prefix is given, and to decide whether bare numbers default to hex).
    pub fn parse(&self, input: &str, current_space: AddressSpace) -> Result<TypedAddress> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Malformed("empty address expression".into()));
        }

        if let Some(addr) = self.parse_prefixed(trimmed)? {
            return Ok(addr);
        }

        if let Some(value) = self.parse_expression(trimmed) {
            // `stack` alone names a virtual location regardless of context.
            if trimmed == "stack" {
                return Ok(TypedAddress::virt(value, None));
            }
            return Ok(TypedAddress::unspaced(value).with_space(current_space));
        }

        let default_hex = current_space != AddressSpace::None;
        match parse_number(trimmed, default_hex) {
            Some(value) => Ok(TypedAddress::unspaced(value).with_space(current_space)),
            None => Err(Error::Malformed(format!("could not parse: {trimmed}"))),
        }
    }

    /// `s:`, `p:`, `v:[pid:]`, `c:` forms. `Ok(None)` when there is no
    /// prefix; `Err` when the prefix is there but the remainder is garbage.
    fn parse_prefixed(&self, input: &str) -> Result<Option<TypedAddress>> {
        let Some((head, mut rest)) = input.split_once(':') else {
            return Ok(None);
        };
        if head.len() != 1 {
            return Ok(None);
        }
        let mut space = match head.chars().next().unwrap().to_ascii_lowercase() {
            's' => AddressSpace::SharedFileOffset,
            'p' => AddressSpace::GuestPhysical,
            'v' => AddressSpace::GuestVirtual { pid: None },
            'c' => AddressSpace::Crunched,
            _ => return Ok(None),
        };

        if let AddressSpace::GuestVirtual { ref mut pid } = space {
            if let Some((pid_str, tail)) = rest.split_once(':') {
                match pid_str.trim().parse::<u32>() {
                    Ok(p) => {
                        *pid = Some(p);
                        rest = tail;
                    }
                    Err(_) => {
                        return Err(Error::Malformed(format!("bad pid qualifier: {pid_str}")))
                    }
                }
            }
        }

        let rest = rest.trim();
        let value = parse_number(rest, true)
            .or_else(|| self.parse_expression(rest))
            .ok_or_else(|| Error::Malformed(format!("could not parse: {rest}")))?;
        Ok(Some(TypedAddress::unspaced(value).with_space(space)))
    }

    /// A variable/built-in name, or a single `+`/`-` between two terms.
    fn parse_expression(&self, input: &str) -> Option<u64> {
        if let Some(name) = input.strip_prefix('$') {
            if let Some(value) = self.variable(name) {
                return Some(value);
            }
        }
        if let Some(value) = self.variable(input) {
            return Some(value);
        }

        if let Some(pos) = input.find('+') {
            let left = self.term(input[..pos].trim())?;
            let right = parse_number(input[pos + 1..].trim(), false)?;
            return Some(left.wrapping_add(right));
        }
        // Minus at position 0 would be a negative number, not an operator.
        if let Some(pos) = input.find('-').filter(|&p| p > 0) {
            let left = self.term(input[..pos].trim())?;
            let right = parse_number(input[pos + 1..].trim(), false)?;
            return Some(left.wrapping_sub(right));
        }
        None
    }

    /// Left-hand term of an expression: variable (with or without `$`) or
    /// hex-defaulting number.
    fn term(&self, text: &str) -> Option<u64> {
        if let Some(name) = text.strip_prefix('$') {
            return self.variable(name);
        }
        if let Some(value) = self.variable(text) {
            return Some(value);
        }
        parse_number(text, true)
    }
}

/// Number grammar shared by every position: `.`-prefixed/`d`-suffixed
/// decimal, `0x`/`$`-prefixed or `h`-suffixed hex, otherwise whichever base
/// `default_hex` names.
fn parse_number(text: &str, default_hex: bool) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    if let Some(rest) = text.strip_prefix('.') {
        return u64::from_str_radix(rest, 10).ok();
    }
    if let Some(rest) = text.strip_suffix('.') {
        return u64::from_str_radix(rest, 10).ok();
    }
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(rest, 16).ok();
    }
    if let Some(rest) = text.strip_prefix('$') {
        return u64::from_str_radix(rest, 16).ok();
    }
    if let Some(rest) = text.strip_suffix('h').or_else(|| text.strip_suffix('H')) {
        if let Ok(v) = u64::from_str_radix(rest, 16) {
            return Some(v);
        }
    }
    if let Some(rest) = text.strip_suffix('d').or_else(|| text.strip_suffix('D')) {
        // Only take the decimal reading when it actually parses; "abcd"
        // should still get the default-base interpretation below.
        if let Ok(v) = u64::from_str_radix(rest, 10) {
            return Some(v);
        }
    }
    if default_hex {
        u64::from_str_radix(text, 16).ok()
    } else {
        u64::from_str_radix(text, 10).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parser() -> AddressParser {
        let mut p = AddressParser::new();
        p.set_builtins(0x4000_0000, 0x7FFF_F000, 0x40_1000);
        p
    }

    #[test]
    fn prefixes_select_spaces() {
        let p = parser();
        let a = p.parse("s:1000", AddressSpace::None).unwrap();
        assert_eq!(a.space(), AddressSpace::SharedFileOffset);
        assert_eq!(a.value(), 0x1000);

        let a = p.parse("P:40000000", AddressSpace::None).unwrap();
        assert_eq!(a.space(), AddressSpace::GuestPhysical);

        let a = p.parse("c:20", AddressSpace::None).unwrap();
        assert_eq!(a.space(), AddressSpace::Crunched);
    }

    #[test]
    fn virtual_prefix_carries_pid() {
        let p = parser();
        let a = p.parse("v:742:ffff0000", AddressSpace::None).unwrap();
        assert_eq!(a.space(), AddressSpace::GuestVirtual { pid: Some(742) });
        assert_eq!(a.value(), 0xFFFF_0000);

        let a = p.parse("v:deadbeef", AddressSpace::None).unwrap();
        assert_eq!(a.space(), AddressSpace::GuestVirtual { pid: None });
        assert_eq!(a.value(), 0xDEAD_BEEF);
    }

    #[test]
    fn number_bases() {
        let p = parser();
        // Address-like context defaults to hex.
        assert_eq!(
            p.parse("100", AddressSpace::GuestPhysical).unwrap().value(),
            0x100
        );
        // No context defaults to decimal.
        assert_eq!(p.parse("100", AddressSpace::None).unwrap().value(), 100);
        assert_eq!(p.parse("0x20", AddressSpace::None).unwrap().value(), 0x20);
        assert_eq!(p.parse("$20", AddressSpace::None).unwrap().value(), 0x20);
        assert_eq!(p.parse("20h", AddressSpace::None).unwrap().value(), 0x20);
        assert_eq!(p.parse(".32", AddressSpace::GuestPhysical).unwrap().value(), 32);
        assert_eq!(p.parse("32d", AddressSpace::GuestPhysical).unwrap().value(), 32);
    }

    #[test]
    fn single_operator_arithmetic() {
        let p = parser();
        // Right-hand side of an operator parses as decimal by default.
        assert_eq!(
            p.parse("p:ram+16", AddressSpace::None).unwrap().value(),
            0x4000_0010
        );
        assert_eq!(
            p.parse("1000-16", AddressSpace::GuestPhysical).unwrap().value(),
            0x1000 - 16
        );
        assert_eq!(
            p.parse("$ram+0x40", AddressSpace::None).unwrap().value(),
            0x4000_0040
        );
    }

    #[test]
    fn builtins_resolve() {
        let p = parser();
        assert_eq!(p.parse("ram", AddressSpace::None).unwrap().value(), 0x4000_0000);
        assert_eq!(p.parse("pc", AddressSpace::None).unwrap().value(), 0x40_1000);
        let stack = p.parse("stack", AddressSpace::None).unwrap();
        assert_eq!(stack.value(), 0x7FFF_F000);
        assert_eq!(stack.space(), AddressSpace::GuestVirtual { pid: None });
    }

    #[test]
    fn user_variables() {
        let mut p = parser();
        p.set_variable("heap", 0x5555_0000);
        assert_eq!(p.parse("$heap", AddressSpace::None).unwrap().value(), 0x5555_0000);
        assert_eq!(
            p.parse("$heap+32", AddressSpace::None).unwrap().value(),
            0x5555_0020
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let p = parser();
        assert!(p.parse("", AddressSpace::None).is_err());
        assert!(p.parse("zzz", AddressSpace::GuestPhysical).is_err());
        assert!(p.parse("v:notapid:10", AddressSpace::None).is_err());
        assert!(p.parse("p:", AddressSpace::None).is_err());
    }
}
